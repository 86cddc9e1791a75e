//! Shared test helpers for link integration tests

use serlink::{ConnectState, LinkConfig, LinkStack, LoopbackDriver, Timestamp};

/// Install the `RUST_LOG`-driven subscriber, once per test binary.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two link stacks joined back to back by an in-memory driver pair,
/// with a fabricated clock the tests step explicitly.
pub struct LinkPair {
    pub a: LinkStack<LoopbackDriver>,
    pub b: LinkStack<LoopbackDriver>,
    pub now: Timestamp,
}

impl LinkPair {
    pub fn new() -> Self {
        Self::with_config(LinkConfig::testing())
    }

    pub fn with_config(config: LinkConfig) -> Self {
        init_logging();
        let (da, db) = LoopbackDriver::pair(4096);
        LinkPair {
            a: LinkStack::new(da, config.clone()).unwrap(),
            b: LinkStack::new(db, config).unwrap(),
            now: 0,
        }
    }

    /// Advance the clock and poll both ends once.
    pub fn tick(&mut self) {
        self.now = self.now.wrapping_add(10);
        self.a.poll(self.now).unwrap();
        self.b.poll(self.now).unwrap();
    }

    pub fn settle(&mut self, ticks: u32) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Bring both ends up and run the handshake to completion.
    pub fn connect(&mut self) {
        self.a.connect(self.now).unwrap();
        self.b.connect(self.now).unwrap();
        for _ in 0..50 {
            self.tick();
            if self.a.state() == ConnectState::Connected
                && self.b.state() == ConnectState::Connected
            {
                return;
            }
        }
        panic!(
            "handshake did not complete: a={:?} b={:?}",
            self.a.state(),
            self.b.state()
        );
    }
}
