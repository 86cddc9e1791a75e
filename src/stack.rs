//! Top of the layer stack
//!
//! [`LinkStack`] owns one driver, the framing engine, the multiplexor,
//! the connection manager and the shared-channel dispatcher, and runs
//! them from a single cooperative [`LinkStack::poll`]. Each tick moves
//! bytes bottom-up: driver to framer, frames to the multiplexor or the
//! connection manager, complete write units to their consumers.
//!
//! Everything is single-threaded; blocking semantics (the foreground
//! request) are built by spinning the poll loop, never by waiting.

use crate::common::{constants, ChannelId, Frame, Timestamp};
use crate::config::LinkConfig;
use crate::connection::{ConnectState, ConnectionManager, LinkEvent};
use crate::dispatch::{CompleteFn, EscapeFlag, SharedChannelSet, SharedHandle, UserToken};
use crate::driver::Driver;
use crate::error::{LinkError, Result};
use crate::framing::FrameEngine;
use crate::mux::Multiplexor;

use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::trace;

/// Writes queued by dispatcher send callbacks, drained each tick
type TxQueue = Rc<RefCell<VecDeque<(ChannelId, Bytes)>>>;

/// One serial link: driver, framing, multiplexing, connection
/// management and request dispatch behind a single poll.
pub struct LinkStack<D: Driver> {
    driver: D,
    framer: FrameEngine,
    mux: Multiplexor,
    conn: ConnectionManager,
    shared: SharedChannelSet,
    /// Reply routing for channels bound to a shared handle
    bindings: HashMap<ChannelId, SharedHandle>,
    /// Buffered units for channels read directly
    inbox: HashMap<ChannelId, VecDeque<Bytes>>,
    dispatch_tx: TxQueue,
    /// Connection state seen on the previous tick
    last_state: ConnectState,
}

impl<D: Driver> LinkStack<D> {
    pub fn new(mut driver: D, config: LinkConfig) -> Result<Self> {
        config.validate()?;
        if let Some(options) = &config.driver_options {
            driver.set_options(options)?;
        }
        driver.set_baud(config.baud)?;
        Ok(Self {
            driver,
            framer: FrameEngine::new(config.clone()),
            mux: Multiplexor::new(config.clone()),
            conn: ConnectionManager::new(config.clone()),
            shared: SharedChannelSet::new(config.request_timeout_ms),
            bindings: HashMap::new(),
            inbox: HashMap::new(),
            dispatch_tx: Rc::new(RefCell::new(VecDeque::new())),
            last_state: ConnectState::Disconnected,
        })
    }

    pub fn state(&self) -> ConnectState {
        self.conn.state()
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn framer(&self) -> &FrameEngine {
        &self.framer
    }

    pub fn mux(&self) -> &Multiplexor {
        &self.mux
    }

    pub fn shared(&mut self) -> &mut SharedChannelSet {
        &mut self.shared
    }

    /// Connection and channel lifecycle events since the last call
    pub fn take_events(&mut self) -> Vec<LinkEvent> {
        self.conn.take_events()
    }

    /// Start probing for a peer.
    pub fn connect(&mut self, now: Timestamp) -> Result<()> {
        self.conn.enable_link(&mut self.framer, now)
    }

    /// Stop the link; with `abort` in-flight traffic is discarded,
    /// otherwise pending frames flush first.
    pub fn disconnect(&mut self, abort: bool) -> Result<()> {
        self.conn.disable(&mut self.framer, &mut self.mux, abort)
    }

    /// Announce a local server channel peers may open by name.
    pub fn register_server(&mut self, name: &str) {
        self.mux.register_server(name);
    }

    /// Open a well-known remote server channel by name; completion is
    /// the `ChannelUp` or `ResolveFailed` event.
    pub fn resolve(&mut self, name: &str) -> Result<ChannelId> {
        self.conn.resolve(&mut self.framer, &mut self.mux, name)
    }

    /// Channel id for a name that has already come up
    pub fn lookup(&self, name: &str) -> Option<ChannelId> {
        self.conn.lookup(name)
    }

    /// Queue one write unit on a channel.
    pub fn write(&mut self, chan: ChannelId, bytes: Bytes) -> Result<()> {
        self.mux.write(chan, bytes)
    }

    /// Next complete unit received on an unbound channel, if any.
    pub fn read(&mut self, chan: ChannelId) -> Option<Bytes> {
        self.inbox.get_mut(&chan).and_then(|q| q.pop_front())
    }

    pub fn close(&mut self, chan: ChannelId) -> Result<()> {
        self.bindings.remove(&chan);
        self.inbox.remove(&chan);
        self.mux.close(&mut self.framer, chan)
    }

    /// Put a channel with request/reply semantics under the shared
    /// dispatcher. Requests flow through the dispatcher's queues and
    /// replies complete the active operation instead of landing in the
    /// inbox.
    pub fn bind_shared(&mut self, chan: ChannelId) -> SharedHandle {
        let queue = self.dispatch_tx.clone();
        let handle = self.shared.create(
            Box::new(move |cmd| {
                queue
                    .borrow_mut()
                    .push_back((chan, Bytes::copy_from_slice(cmd)));
                Ok(())
            }),
            Box::new(Ok),
        );
        self.bindings.insert(chan, handle);
        handle
    }

    /// Destroy a shared handle, failing its queued operations.
    pub fn destroy_shared(&mut self, handle: SharedHandle) -> Result<()> {
        self.bindings.retain(|_, &mut h| h != handle);
        self.shared.destroy(handle)
    }

    /// Queue a background request on a bound channel.
    pub fn back(
        &mut self,
        handle: SharedHandle,
        cmd: Bytes,
        user: UserToken,
        complete: CompleteFn,
    ) -> Result<()> {
        self.shared.back(handle, cmd, user, complete)
    }

    /// Run a foreground request to completion, spinning the poll loop.
    ///
    /// `clock` supplies the current time each tick and must advance,
    /// or the request timeout can never fire. With `allow_escape`, a
    /// set [`EscapeFlag`] abandons the request with `Escape`.
    pub fn fore<C>(
        &mut self,
        handle: SharedHandle,
        cmd: Bytes,
        allow_escape: bool,
        escape: &EscapeFlag,
        mut clock: C,
    ) -> Result<Bytes>
    where
        C: FnMut() -> Timestamp,
    {
        let outcome: Rc<Cell<Option<Result<Bytes>>>> = Rc::new(Cell::new(None));
        let cell = outcome.clone();
        self.shared.fore_enqueue(
            handle,
            cmd,
            Box::new(move |_, _, result| {
                cell.set(Some(result));
            }),
        )?;

        loop {
            if let Some(result) = outcome.take() {
                return result;
            }
            if allow_escape && escape.get() {
                self.shared.abandon(handle)?;
                return Err(LinkError::Escape);
            }
            self.poll(clock())?;
        }
    }

    /// One tick of the cooperative scheduler: advance every layer and
    /// route what each produced to the layer above.
    pub fn poll(&mut self, now: Timestamp) -> Result<()> {
        let frames = match self.framer.poll(&mut self.driver, now) {
            Ok(frames) => frames,
            // Retry exhaustion leaves the framer failed; the
            // connection manager turns that into a disconnect below
            Err(LinkError::Comms) => Vec::new(),
            Err(e) => return Err(e),
        };

        for frame in frames {
            self.route_frame(frame, now)?;
        }

        self.conn
            .poll(&mut self.driver, &mut self.framer, &mut self.mux, now)?;
        self.observe_disconnect();

        let queued: Vec<(ChannelId, Bytes)> = self.dispatch_tx.borrow_mut().drain(..).collect();
        for (chan, bytes) in queued {
            if let Err(err) = self.mux.write(chan, bytes) {
                // The request never reached the wire; its operation
                // completes with the failure
                match self.bindings.get(&chan) {
                    Some(&handle) => self.shared.fail_active(handle, err)?,
                    None => return Err(err),
                }
            }
        }

        for (chan, bytes) in self.mux.poll(&mut self.framer, now)? {
            match self.bindings.get(&chan) {
                Some(&handle) => self.shared.poll_data(handle, bytes)?,
                None => {
                    self.inbox.entry(chan).or_default().push_back(bytes);
                }
            }
        }

        for handle in self.shared.handle_ids() {
            self.shared.poll_idle(handle, now)?;
        }
        Ok(())
    }

    /// A collapse to `Disconnected` fails every outstanding shared
    /// request with the link's terminal reason, so waiters do not sit
    /// until the request deadline.
    fn observe_disconnect(&mut self) {
        let state = self.conn.state();
        if state == ConnectState::Disconnected && self.last_state != ConnectState::Disconnected {
            let reason = self.conn.take_drop_reason().unwrap_or(LinkError::NoLink);
            trace!(%reason, "failing outstanding shared requests");
            for handle in self.shared.handle_ids() {
                let _ = self.shared.fail_all(handle, reason.clone());
            }
        }
        self.last_state = state;
    }

    /// Connection management owns the session-level control tags; the
    /// multiplexor owns channel lifecycle and flow control.
    fn route_frame(&mut self, frame: Frame, now: Timestamp) -> Result<()> {
        if frame.is_control() {
            match frame.payload.first().copied() {
                Some(
                    constants::CTRL_HELLO
                    | constants::CTRL_HELLO_ACK
                    | constants::CTRL_KEEPALIVE
                    | constants::CTRL_BYE,
                ) => {
                    return self.conn.handle_control(&mut self.framer, &frame, now);
                }
                _ => {}
            }
        }
        trace!(chan = frame.header.chan, "frame to multiplexor");
        self.conn.note_activity(now);
        self.mux.handle_frame(&mut self.framer, frame)
    }
}
