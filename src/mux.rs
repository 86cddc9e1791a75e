//! Channel multiplexing over the framing layer
//!
//! The [`Multiplexor`] carries many logical channels over the single
//! framed pipe. Channel 0 is reserved for in-band control (open, close,
//! credit grants); every other channel is a byte stream with its own
//! flow-control credit. Writes are fragmented into frame-sized chunks;
//! ordering is preserved within a channel, never across channels.
//!
//! Each write is one *unit*: the stream carries a 16-bit length prefix
//! so the receiving side can re-deliver whole units even when they were
//! fragmented across frames.

use crate::common::{constants, ChannelId, Frame, Timestamp};
use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::framing::FrameEngine;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Open requested, waiting for the peer's answer
    Allocating,
    /// Carrying data
    Open,
    /// Close requested with writes still queued
    Draining,
    /// Gone; the id may be reused
    Closed,
}

/// A complete unit delivered on a channel
pub type MuxMessage = (ChannelId, Bytes);

/// Channel lifecycle notifications for the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// A channel we opened was granted by the peer
    ChannelOpen { chan: ChannelId, name: String },
    /// A channel we opened was refused (named server absent)
    ChannelOpenFailed { chan: ChannelId, name: String },
    /// The peer opened a channel to one of our registered servers
    PeerOpened { chan: ChannelId, name: String },
    /// A channel closed (either end)
    ChannelClosed { chan: ChannelId },
}

/// Counters maintained by the multiplexor
#[derive(Debug, Default, Clone)]
pub struct MuxStats {
    pub channels_opened: u64,
    pub units_sent: u64,
    pub units_received: u64,
    pub chunks_sent: u64,
    pub credit_stalls: u64,
}

struct Channel {
    local: ChannelId,
    remote: Option<ChannelId>,
    name: String,
    state: ChannelState,
    /// Bytes we may still send before the peer grants more
    credit: u32,
    /// Bytes received since our last grant to the peer
    since_grant: u32,
    tx_queue: VecDeque<Bytes>,
    rx_buf: BytesMut,
    rx_units: VecDeque<Bytes>,
}

impl Channel {
    fn new(local: ChannelId, name: String, credit: u32) -> Self {
        Self {
            local,
            remote: None,
            name,
            state: ChannelState::Allocating,
            credit,
            since_grant: 0,
            tx_queue: VecDeque::new(),
            rx_buf: BytesMut::new(),
            rx_units: VecDeque::new(),
        }
    }
}

/// Logical channels over one framed pipe.
pub struct Multiplexor {
    config: LinkConfig,
    channels: HashMap<ChannelId, Channel>,
    servers: Vec<String>,
    events: VecDeque<MuxEvent>,
    stats: MuxStats,
}

impl Multiplexor {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            channels: HashMap::new(),
            servers: Vec::new(),
            events: VecDeque::new(),
            stats: MuxStats::default(),
        }
    }

    pub fn stats(&self) -> &MuxStats {
        &self.stats
    }

    /// Make a server name available for the peer to open
    pub fn register_server(&mut self, name: &str) {
        if !self.servers.iter().any(|s| s == name) {
            self.servers.push(name.to_string());
        }
    }

    pub fn channel_state(&self, chan: ChannelId) -> ChannelState {
        self.channels
            .get(&chan)
            .map(|c| c.state)
            .unwrap_or(ChannelState::Closed)
    }

    /// Drain pending lifecycle events
    pub fn take_events(&mut self) -> Vec<MuxEvent> {
        self.events.drain(..).collect()
    }

    /// Drop all channel state (link went down)
    pub fn reset(&mut self) {
        for (&chan, channel) in self.channels.iter() {
            if channel.state != ChannelState::Closed {
                self.events.push_back(MuxEvent::ChannelClosed { chan });
            }
        }
        self.channels.clear();
    }

    /// Open a channel to the named server at the peer.
    ///
    /// Returns the freshly minted local id; the channel stays
    /// `Allocating` until the peer answers.
    pub fn open(&mut self, framer: &mut FrameEngine, name: &str) -> Result<ChannelId> {
        if name.is_empty() || name.len() > 32 {
            return Err(LinkError::bad_name(name));
        }

        let local = self.mint_id()?;
        let mut payload = BytesMut::with_capacity(3 + name.len());
        payload.put_u8(constants::CTRL_OPEN);
        payload.put_u8(local);
        payload.put_u8(name.len() as u8);
        payload.extend_from_slice(name.as_bytes());
        framer.send_frame(
            constants::CONTROL_CHANNEL,
            constants::FRAME_CTRL,
            payload.freeze(),
        )?;

        debug!(chan = local, name, "channel open requested");
        self.channels
            .insert(local, Channel::new(local, name.to_string(), self.config.channel_credit));
        Ok(local)
    }

    /// Close a channel. Queued writes drain first.
    pub fn close(&mut self, framer: &mut FrameEngine, chan: ChannelId) -> Result<()> {
        let channel = self.channels.get_mut(&chan).ok_or(LinkError::NoMux)?;
        match channel.state {
            ChannelState::Closed => return Ok(()),
            ChannelState::Open | ChannelState::Allocating if !channel.tx_queue.is_empty() => {
                channel.state = ChannelState::Draining;
                return Ok(());
            }
            _ => {}
        }
        self.finish_close(framer, chan)
    }

    fn finish_close(&mut self, framer: &mut FrameEngine, chan: ChannelId) -> Result<()> {
        if let Some(channel) = self.channels.get_mut(&chan) {
            if let Some(remote) = channel.remote {
                let mut payload = BytesMut::with_capacity(2);
                payload.put_u8(constants::CTRL_CLOSE);
                payload.put_u8(remote);
                framer.send_frame(
                    constants::CONTROL_CHANNEL,
                    constants::FRAME_CTRL,
                    payload.freeze(),
                )?;
            }
            channel.state = ChannelState::Closed;
        }
        self.channels.remove(&chan);
        self.events.push_back(MuxEvent::ChannelClosed { chan });
        debug!(chan, "channel closed");
        Ok(())
    }

    /// Queue one unit of bytes on a channel.
    ///
    /// The unit is fragmented into frame-sized chunks; exceeding the
    /// per-channel queue bound fails with `MuxFull` and queues nothing.
    pub fn write(&mut self, chan: ChannelId, bytes: Bytes) -> Result<()> {
        if bytes.len() > u16::MAX as usize {
            return Err(LinkError::DriverSize);
        }
        let max_chunk = self.config.max_payload as usize;
        let queue_limit = self.config.queue_limit;

        let channel = self.channels.get_mut(&chan).ok_or(LinkError::NoMux)?;
        match channel.state {
            ChannelState::Open | ChannelState::Allocating => {}
            _ => return Err(LinkError::NotConnected),
        }

        let mut unit = BytesMut::with_capacity(2 + bytes.len());
        unit.put_u16(bytes.len() as u16);
        unit.extend_from_slice(&bytes);
        let unit = unit.freeze();

        let chunks = unit.len().div_ceil(max_chunk);
        if channel.tx_queue.len() + chunks > queue_limit {
            return Err(LinkError::MuxFull);
        }

        let mut offset = 0;
        while offset < unit.len() {
            let end = (offset + max_chunk).min(unit.len());
            channel.tx_queue.push_back(unit.slice(offset..end));
            offset = end;
        }

        self.stats.units_sent += 1;
        trace!(chan, bytes = bytes.len(), chunks, "unit queued");
        Ok(())
    }

    /// Handle an inbound frame routed to the multiplexor by the stack.
    pub fn handle_frame(&mut self, framer: &mut FrameEngine, frame: Frame) -> Result<()> {
        if frame.is_control() {
            return self.handle_control(framer, frame.payload);
        }

        let chan = frame.header.chan;
        match self.channels.get_mut(&chan) {
            Some(channel) if channel.state == ChannelState::Open => {
                channel.rx_buf.extend_from_slice(&frame.payload);
                channel.since_grant += frame.payload.len() as u32;
                Self::extract_units(channel, &mut self.stats);
            }
            _ => {
                trace!(chan, "data for unknown channel dropped");
            }
        }
        Ok(())
    }

    fn extract_units(channel: &mut Channel, stats: &mut MuxStats) {
        loop {
            if channel.rx_buf.len() < 2 {
                return;
            }
            let unit_len = u16::from_be_bytes([channel.rx_buf[0], channel.rx_buf[1]]) as usize;
            if channel.rx_buf.len() < 2 + unit_len {
                return;
            }
            channel.rx_buf.advance(2);
            let unit = channel.rx_buf.split_to(unit_len).freeze();
            channel.rx_units.push_back(unit);
            stats.units_received += 1;
        }
    }

    fn handle_control(&mut self, framer: &mut FrameEngine, payload: Bytes) -> Result<()> {
        match payload.first().copied() {
            Some(constants::CTRL_OPEN) => self.handle_open(framer, &payload),
            Some(constants::CTRL_OPEN_ACK) => {
                if payload.len() < 3 {
                    return Ok(());
                }
                let (ours, theirs) = (payload[1], payload[2]);
                if let Some(channel) = self.channels.get_mut(&ours) {
                    channel.remote = Some(theirs);
                    channel.state = ChannelState::Open;
                    self.stats.channels_opened += 1;
                    debug!(chan = ours, remote = theirs, "channel open");
                    self.events.push_back(MuxEvent::ChannelOpen {
                        chan: ours,
                        name: channel.name.clone(),
                    });
                }
                Ok(())
            }
            Some(constants::CTRL_OPEN_FAIL) => {
                if payload.len() < 2 {
                    return Ok(());
                }
                let ours = payload[1];
                if let Some(channel) = self.channels.remove(&ours) {
                    warn!(chan = ours, name = %channel.name, "peer refused channel");
                    self.events.push_back(MuxEvent::ChannelOpenFailed {
                        chan: ours,
                        name: channel.name,
                    });
                }
                Ok(())
            }
            Some(constants::CTRL_CLOSE) => {
                if payload.len() < 2 {
                    return Ok(());
                }
                let ours = payload[1];
                if self.channels.remove(&ours).is_some() {
                    debug!(chan = ours, "peer closed channel");
                    self.events.push_back(MuxEvent::ChannelClosed { chan: ours });
                }
                Ok(())
            }
            Some(constants::CTRL_CREDIT) => {
                if payload.len() < 6 {
                    return Ok(());
                }
                let ours = payload[1];
                let grant = u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]);
                if let Some(channel) = self.channels.get_mut(&ours) {
                    channel.credit = channel.credit.saturating_add(grant);
                    trace!(chan = ours, grant, credit = channel.credit, "credit granted");
                }
                Ok(())
            }
            _ => {
                // Not a multiplexor message; the stack routes those
                Ok(())
            }
        }
    }

    fn handle_open(&mut self, framer: &mut FrameEngine, payload: &Bytes) -> Result<()> {
        if payload.len() < 3 {
            return Ok(());
        }
        let theirs = payload[1];
        let name_len = payload[2] as usize;
        if payload.len() < 3 + name_len {
            return Ok(());
        }
        let name = match std::str::from_utf8(&payload[3..3 + name_len]) {
            Ok(name) => name.to_string(),
            Err(_) => return Ok(()),
        };

        if !self.servers.iter().any(|s| s == &name) {
            let mut reply = BytesMut::with_capacity(2);
            reply.put_u8(constants::CTRL_OPEN_FAIL);
            reply.put_u8(theirs);
            framer.send_frame(
                constants::CONTROL_CHANNEL,
                constants::FRAME_CTRL,
                reply.freeze(),
            )?;
            return Ok(());
        }

        let local = self.mint_id()?;
        let mut channel = Channel::new(local, name.clone(), self.config.channel_credit);
        channel.remote = Some(theirs);
        channel.state = ChannelState::Open;
        self.channels.insert(local, channel);
        self.stats.channels_opened += 1;

        let mut reply = BytesMut::with_capacity(3);
        reply.put_u8(constants::CTRL_OPEN_ACK);
        reply.put_u8(theirs);
        reply.put_u8(local);
        framer.send_frame(
            constants::CONTROL_CHANNEL,
            constants::FRAME_CTRL,
            reply.freeze(),
        )?;

        debug!(chan = local, remote = theirs, name = %name, "peer opened channel");
        self.events.push_back(MuxEvent::PeerOpened { chan: local, name });
        Ok(())
    }

    /// Advance all channels: push queued chunks within credit and the
    /// frame window, grant credit back to the peer, finish drains, and
    /// deliver at most one complete unit per channel.
    pub fn poll(&mut self, framer: &mut FrameEngine, _now: Timestamp) -> Result<Vec<MuxMessage>> {
        let mut delivered = Vec::new();
        let mut to_close = Vec::new();
        let initial_credit = self.config.channel_credit;

        let mut ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        ids.sort_unstable();

        for chan in ids {
            let channel = match self.channels.get_mut(&chan) {
                Some(c) => c,
                None => continue,
            };

            // Transmit queued chunks
            while let Some(front_len) = channel.tx_queue.front().map(|c| c.len()) {
                if channel.state != ChannelState::Open && channel.state != ChannelState::Draining {
                    break;
                }
                let Some(remote) = channel.remote else { break };
                if channel.credit < front_len as u32 {
                    self.stats.credit_stalls += 1;
                    break;
                }
                if !framer.can_send() {
                    break;
                }
                if let Some(chunk) = channel.tx_queue.pop_front() {
                    channel.credit -= chunk.len() as u32;
                    framer.send_frame(remote, constants::FRAME_DATA, chunk)?;
                    self.stats.chunks_sent += 1;
                }
            }

            // Re-grant credit once the peer has used half its window
            if channel.since_grant >= initial_credit / 2 {
                if let Some(remote) = channel.remote {
                    if framer.can_send() {
                        let grant = channel.since_grant;
                        let mut payload = BytesMut::with_capacity(6);
                        payload.put_u8(constants::CTRL_CREDIT);
                        payload.put_u8(remote);
                        payload.put_u32(grant);
                        framer.send_frame(
                            constants::CONTROL_CHANNEL,
                            constants::FRAME_CTRL,
                            payload.freeze(),
                        )?;
                        channel.since_grant = 0;
                    }
                }
            }

            if channel.state == ChannelState::Draining && channel.tx_queue.is_empty() {
                to_close.push(chan);
                continue;
            }

            // At most one unit per channel per tick
            if let Some(unit) = channel.rx_units.pop_front() {
                delivered.push((chan, unit));
            }
        }

        for chan in to_close {
            self.finish_close(framer, chan)?;
        }

        Ok(delivered)
    }

    /// Allocate an unused non-zero channel id
    fn mint_id(&self) -> Result<ChannelId> {
        for id in 1..=u8::MAX {
            if !self.channels.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(LinkError::Buffer)
    }
}
