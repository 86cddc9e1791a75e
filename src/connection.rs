//! Connection management: peer discovery and channel naming
//!
//! The [`ConnectionManager`] watches framing health, probes for the
//! peer, exchanges capabilities, and brings up well-known server
//! channels by name. Connect and disconnect surface as [`LinkEvent`]s
//! drained by the host.

use crate::common::{constants, time_diff, ChannelId, Frame, Timestamp};
use crate::config::LinkConfig;
use crate::driver::Driver;
use crate::error::{LinkError, Result};
use crate::framing::{FrameEngine, FrameState};
use crate::mux::{Multiplexor, MuxEvent};

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Connection state for the single peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Disconnected,
    /// Sending hellos, walking the baud candidates
    Probing,
    /// Valid peer hello seen; capabilities in flight
    Negotiating,
    Connected,
    /// Graceful shutdown; pending traffic flushing
    Draining,
}

/// Events surfaced to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected { reason: LinkError },
    /// A named server channel came up
    ChannelUp { name: String, chan: ChannelId },
    /// The peer does not host the named server
    ResolveFailed { name: String },
}

/// Interval between hello frames while probing
const HELLO_INTERVAL_MS: u32 = 500;
/// Dwell time on one baud candidate before stepping to the next
const BAUD_CYCLE_MS: u32 = 2_000;

/// Peer discovery and naming over one framed, multiplexed pipe.
pub struct ConnectionManager {
    config: LinkConfig,
    state: ConnectState,
    nonce: u32,
    events: VecDeque<LinkEvent>,
    names: HashMap<String, ChannelId>,
    /// Terminal reason for the latest collapse to `Disconnected`
    drop_reason: Option<LinkError>,

    last_hello: Timestamp,
    baud_index: usize,
    baud_switched: Timestamp,
    last_activity: Timestamp,
    acked_peer: bool,
}

impl ConnectionManager {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            state: ConnectState::Disconnected,
            nonce: rand::random::<u32>(),
            events: VecDeque::new(),
            names: HashMap::new(),
            drop_reason: None,
            last_hello: 0,
            baud_index: 0,
            baud_switched: 0,
            last_activity: 0,
            acked_peer: false,
        }
    }

    pub fn state(&self) -> ConnectState {
        self.state
    }

    /// Drain pending connect/disconnect events
    pub fn take_events(&mut self) -> Vec<LinkEvent> {
        self.events.drain(..).collect()
    }

    /// Why the link last went down, consumed by the stack to fail
    /// requests still outstanding on shared channels
    pub fn take_drop_reason(&mut self) -> Option<LinkError> {
        self.drop_reason.take()
    }

    /// Channel id of a resolved well-known server, if up
    pub fn lookup(&self, name: &str) -> Option<ChannelId> {
        self.names.get(name).copied()
    }

    /// Start probing for a peer
    pub fn enable_link(&mut self, framer: &mut FrameEngine, now: Timestamp) -> Result<()> {
        if self.state != ConnectState::Disconnected {
            return Err(LinkError::LinkBusy);
        }
        info!("link enabled, probing for peer");
        framer.reset();
        framer.start();
        self.state = ConnectState::Probing;
        self.nonce = rand::random::<u32>();
        self.drop_reason = None;
        self.baud_index = 0;
        self.baud_switched = now;
        // Force an immediate hello
        self.last_hello = now.wrapping_sub(HELLO_INTERVAL_MS);
        self.acked_peer = false;
        Ok(())
    }

    /// Stop the link. With `abort` all in-flight traffic is discarded;
    /// otherwise pending frames flush first.
    pub fn disable(
        &mut self,
        framer: &mut FrameEngine,
        mux: &mut Multiplexor,
        abort: bool,
    ) -> Result<()> {
        if self.state == ConnectState::Disconnected {
            return Ok(());
        }
        if abort {
            self.drop_link(framer, mux, LinkError::Remote(crate::error::RemoteError::Aborted));
            return Ok(());
        }
        debug!("link draining");
        if self.state == ConnectState::Connected {
            let mut payload = BytesMut::with_capacity(1);
            payload.put_u8(constants::CTRL_BYE);
            // Best effort; the drain completes regardless
            let _ = framer.send_frame(
                constants::CONTROL_CHANNEL,
                constants::FRAME_CTRL,
                payload.freeze(),
            );
        }
        self.state = ConnectState::Draining;
        Ok(())
    }

    /// Open a well-known server channel by name.
    ///
    /// Returns the allocating channel id; completion is the
    /// `ChannelUp` or `ResolveFailed` event.
    pub fn resolve(
        &mut self,
        framer: &mut FrameEngine,
        mux: &mut Multiplexor,
        name: &str,
    ) -> Result<ChannelId> {
        if self.state != ConnectState::Connected {
            return Err(LinkError::NotConnected);
        }
        if let Some(&chan) = self.names.get(name) {
            return Ok(chan);
        }
        mux.open(framer, name)
    }

    /// Handle a control frame routed here by the stack.
    pub fn handle_control(
        &mut self,
        framer: &mut FrameEngine,
        frame: &Frame,
        now: Timestamp,
    ) -> Result<()> {
        self.last_activity = now;
        let payload = &frame.payload;
        match payload.first().copied() {
            Some(constants::CTRL_HELLO) => self.handle_hello(framer, payload, false),
            Some(constants::CTRL_HELLO_ACK) => self.handle_hello(framer, payload, true),
            Some(constants::CTRL_KEEPALIVE) => Ok(()),
            Some(constants::CTRL_BYE) => {
                info!("peer closed the link");
                let reason = LinkError::Remote(crate::error::RemoteError::Disconnected);
                self.drop_reason = Some(reason.clone());
                self.events.push_back(LinkEvent::Disconnected { reason });
                self.state = ConnectState::Disconnected;
                self.names.clear();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_hello(
        &mut self,
        framer: &mut FrameEngine,
        payload: &Bytes,
        is_ack: bool,
    ) -> Result<()> {
        if payload.len() < 6 {
            return Ok(());
        }
        let version = payload[1];
        let nonce = u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]);

        if nonce == self.nonce {
            // Our own hello echoed back: the line loops to ourselves
            warn!("hello echo detected, ignoring");
            return Ok(());
        }

        if version != constants::PROTOCOL_VERSION {
            warn!(
                peer = version,
                ours = constants::PROTOCOL_VERSION,
                "protocol version mismatch"
            );
            self.drop_reason = Some(LinkError::NoConnect);
            self.events.push_back(LinkEvent::Disconnected {
                reason: LinkError::NoConnect,
            });
            self.state = ConnectState::Disconnected;
            return Ok(());
        }

        match (self.state, is_ack) {
            (ConnectState::Probing, false) | (ConnectState::Negotiating, false) => {
                self.state = ConnectState::Negotiating;
                self.send_hello(framer, true)?;
                self.acked_peer = true;
            }
            (ConnectState::Probing, true) | (ConnectState::Negotiating, true) => {
                info!("capability exchange complete, connected");
                self.state = ConnectState::Connected;
                self.events.push_back(LinkEvent::Connected);
                if !self.acked_peer {
                    // Let the peer finish its own negotiation
                    self.send_hello(framer, true)?;
                    self.acked_peer = true;
                }
            }
            (ConnectState::Connected, false) => {
                // Peer restarted negotiation; answer it
                self.send_hello(framer, true)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn send_hello(&mut self, framer: &mut FrameEngine, is_ack: bool) -> Result<()> {
        let kind = if is_ack {
            constants::CTRL_HELLO_ACK
        } else {
            constants::CTRL_HELLO
        };
        let mut payload = BytesMut::with_capacity(6);
        payload.put_u8(kind);
        payload.put_u8(constants::PROTOCOL_VERSION);
        payload.put_u32(self.nonce);
        framer.send_frame(
            constants::CONTROL_CHANNEL,
            constants::FRAME_CTRL,
            payload.freeze(),
        )?;
        Ok(())
    }

    /// Advance the connection state machine one tick.
    pub fn poll(
        &mut self,
        driver: &mut dyn Driver,
        framer: &mut FrameEngine,
        mux: &mut Multiplexor,
        now: Timestamp,
    ) -> Result<()> {
        // Fold multiplexor lifecycle into our name table and events
        for event in mux.take_events() {
            match event {
                MuxEvent::ChannelOpen { chan, name } => {
                    self.names.insert(name.clone(), chan);
                    self.events.push_back(LinkEvent::ChannelUp { name, chan });
                }
                MuxEvent::ChannelOpenFailed { name, .. } => {
                    self.events.push_back(LinkEvent::ResolveFailed { name });
                }
                MuxEvent::PeerOpened { chan, name } => {
                    self.names.insert(name.clone(), chan);
                    self.events
                        .push_back(LinkEvent::ChannelUp { name, chan });
                }
                MuxEvent::ChannelClosed { chan } => {
                    self.names.retain(|_, &mut c| c != chan);
                }
            }
        }

        match self.state {
            ConnectState::Disconnected => Ok(()),
            ConnectState::Probing => self.poll_probing(driver, framer, now),
            ConnectState::Negotiating => Ok(()),
            ConnectState::Connected => self.poll_connected(framer, mux, now),
            ConnectState::Draining => {
                if framer.idle() {
                    self.drop_link(framer, mux, LinkError::NoLink);
                }
                Ok(())
            }
        }
    }

    fn poll_probing(
        &mut self,
        driver: &mut dyn Driver,
        framer: &mut FrameEngine,
        now: Timestamp,
    ) -> Result<()> {
        // A failed probe hello just means nobody answered yet; restart
        // the framing layer and keep going
        if framer.state() == FrameState::Failed {
            framer.reset();
            framer.start();
        }

        // Walk the candidate rates while nothing answers
        if time_diff(now, self.baud_switched) >= BAUD_CYCLE_MS as i32
            && !self.config.baud_candidates.is_empty()
        {
            self.baud_index = (self.baud_index + 1) % self.config.baud_candidates.len();
            let baud = self.config.baud_candidates[self.baud_index];
            framer.set_line_baud(driver, baud)?;
            self.baud_switched = now;
        }

        // One hello in flight at a time
        if time_diff(now, self.last_hello) >= HELLO_INTERVAL_MS as i32 && framer.idle() {
            self.send_hello(framer, false)?;
            self.last_hello = now;
        }
        Ok(())
    }

    fn poll_connected(
        &mut self,
        framer: &mut FrameEngine,
        mux: &mut Multiplexor,
        now: Timestamp,
    ) -> Result<()> {
        if framer.state() == FrameState::Failed {
            warn!("framing failed, dropping connection");
            self.drop_link(framer, mux, LinkError::Comms);
            return Ok(());
        }

        if let Some(keep_alive) = self.config.keep_alive_ms {
            if time_diff(now, self.last_activity) >= keep_alive as i32 && framer.idle() {
                let mut payload = BytesMut::with_capacity(1);
                payload.put_u8(constants::CTRL_KEEPALIVE);
                framer.send_frame(
                    constants::CONTROL_CHANNEL,
                    constants::FRAME_CTRL,
                    payload.freeze(),
                )?;
                self.last_activity = now;
            }
        }
        Ok(())
    }

    /// Collapse to `Disconnected`, tearing down every layer below.
    fn drop_link(&mut self, framer: &mut FrameEngine, mux: &mut Multiplexor, reason: LinkError) {
        debug!(%reason, "link down");
        mux.reset();
        framer.reset();
        self.names.clear();
        self.drop_reason = Some(reason.clone());
        if self.state == ConnectState::Connected || self.state == ConnectState::Draining {
            self.events.push_back(LinkEvent::Disconnected { reason });
        }
        self.state = ConnectState::Disconnected;
    }

    /// Record traffic for keep-alive accounting
    pub fn note_activity(&mut self, now: Timestamp) {
        self.last_activity = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LoopbackDriver;

    struct End {
        driver: LoopbackDriver,
        framer: FrameEngine,
        mux: Multiplexor,
        conn: ConnectionManager,
    }

    fn make(driver: LoopbackDriver) -> End {
        let config = LinkConfig::testing();
        End {
            driver,
            framer: FrameEngine::new(config.clone()),
            mux: Multiplexor::new(config.clone()),
            conn: ConnectionManager::new(config),
        }
    }

    fn tick(end: &mut End, now: Timestamp) {
        let frames = end.framer.poll(&mut end.driver, now).unwrap_or_default();
        for frame in frames {
            if frame.is_control() {
                let tag = frame.payload.first().copied().unwrap_or(0);
                if matches!(
                    tag,
                    constants::CTRL_HELLO
                        | constants::CTRL_HELLO_ACK
                        | constants::CTRL_KEEPALIVE
                        | constants::CTRL_BYE
                ) {
                    end.conn
                        .handle_control(&mut end.framer, &frame, now)
                        .unwrap();
                } else {
                    end.mux.handle_frame(&mut end.framer, frame).unwrap();
                }
            } else {
                end.mux.handle_frame(&mut end.framer, frame).unwrap();
            }
        }
        let _ = end.mux.poll(&mut end.framer, now);
        end.conn
            .poll(&mut end.driver, &mut end.framer, &mut end.mux, now)
            .unwrap();
        let _ = end.framer.poll(&mut end.driver, now);
    }

    fn settle(a: &mut End, b: &mut End, now: Timestamp) {
        for _ in 0..64 {
            tick(a, now);
            tick(b, now);
        }
    }

    #[test]
    fn test_connect_sequence() {
        let (da, db) = LoopbackDriver::pair(16_384);
        let (mut a, mut b) = (make(da), make(db));

        a.conn.enable_link(&mut a.framer, 0).unwrap();
        b.conn.enable_link(&mut b.framer, 0).unwrap();
        assert_eq!(a.conn.state(), ConnectState::Probing);

        settle(&mut a, &mut b, 1_000);
        assert_eq!(a.conn.state(), ConnectState::Connected);
        assert_eq!(b.conn.state(), ConnectState::Connected);
        assert!(a.conn.take_events().contains(&LinkEvent::Connected));
    }

    #[test]
    fn test_resolve_named_server() {
        let (da, db) = LoopbackDriver::pair(16_384);
        let (mut a, mut b) = (make(da), make(db));
        b.mux.register_server("link.clipboard");

        a.conn.enable_link(&mut a.framer, 0).unwrap();
        b.conn.enable_link(&mut b.framer, 0).unwrap();
        settle(&mut a, &mut b, 1_000);

        let chan = a
            .conn
            .resolve(&mut a.framer, &mut a.mux, "link.clipboard")
            .unwrap();
        settle(&mut a, &mut b, 1_001);

        assert_eq!(a.conn.lookup("link.clipboard"), Some(chan));
        assert!(a
            .conn
            .take_events()
            .iter()
            .any(|e| matches!(e, LinkEvent::ChannelUp { name, .. } if name == "link.clipboard")));
    }

    #[test]
    fn test_resolve_missing_server() {
        let (da, db) = LoopbackDriver::pair(16_384);
        let (mut a, mut b) = (make(da), make(db));

        a.conn.enable_link(&mut a.framer, 0).unwrap();
        b.conn.enable_link(&mut b.framer, 0).unwrap();
        settle(&mut a, &mut b, 1_000);

        a.conn
            .resolve(&mut a.framer, &mut a.mux, "link.print")
            .unwrap();
        settle(&mut a, &mut b, 1_001);

        assert!(a
            .conn
            .take_events()
            .contains(&LinkEvent::ResolveFailed { name: "link.print".into() }));
        assert_eq!(a.conn.lookup("link.print"), None);
    }

    #[test]
    fn test_resolve_requires_connection() {
        let (da, _db) = LoopbackDriver::pair(16_384);
        let mut a = make(da);
        assert_eq!(
            a.conn.resolve(&mut a.framer, &mut a.mux, "link.fs"),
            Err(LinkError::NotConnected)
        );
    }

    #[test]
    fn test_framing_failure_disconnects() {
        let (da, db) = LoopbackDriver::pair(16_384);
        let (mut a, mut b) = (make(da), make(db));

        a.conn.enable_link(&mut a.framer, 0).unwrap();
        b.conn.enable_link(&mut b.framer, 0).unwrap();
        settle(&mut a, &mut b, 1_000);
        assert_eq!(a.conn.state(), ConnectState::Connected);

        // Peer vanishes: every frame from `a` is now lost
        a.framer
            .send_frame(constants::CONTROL_CHANNEL, constants::FRAME_CTRL, {
                let mut p = BytesMut::new();
                p.put_u8(constants::CTRL_KEEPALIVE);
                p.freeze()
            })
            .unwrap();
        let mut now = 2_000;
        for _ in 0..32 {
            a.driver.drop_in_flight();
            let _ = a.framer.poll(&mut a.driver, now);
            a.conn
                .poll(&mut a.driver, &mut a.framer, &mut a.mux, now)
                .unwrap();
            now = now.wrapping_add(200_000);
        }

        assert_eq!(a.conn.state(), ConnectState::Disconnected);
        assert!(a
            .conn
            .take_events()
            .contains(&LinkEvent::Disconnected { reason: LinkError::Comms }));
    }

    #[test]
    fn test_graceful_disable() {
        let (da, db) = LoopbackDriver::pair(16_384);
        let (mut a, mut b) = (make(da), make(db));

        a.conn.enable_link(&mut a.framer, 0).unwrap();
        b.conn.enable_link(&mut b.framer, 0).unwrap();
        settle(&mut a, &mut b, 1_000);

        a.conn.disable(&mut a.framer, &mut a.mux, false).unwrap();
        assert_eq!(a.conn.state(), ConnectState::Draining);
        settle(&mut a, &mut b, 1_001);

        assert_eq!(a.conn.state(), ConnectState::Disconnected);
        // Peer saw the goodbye
        assert_eq!(b.conn.state(), ConnectState::Disconnected);
    }
}
