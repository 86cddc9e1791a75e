//! Common types and utilities for the link core

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

/// Link protocol constants
pub mod constants {
    pub const FRAME_STX: u8 = 0x02; // start-of-frame marker
    pub const FRAME_ETX: u8 = 0x03; // end-of-frame marker
    pub const FRAME_DLE: u8 = 0x10; // escape for marker bytes in the body
    pub const FRAME_XOR: u8 = 0x20; // stuffed bytes are sent as DLE, byte ^ FRAME_XOR

    pub const FRAME_DATA: u8 = 1; // frame kind: channel data
    pub const FRAME_ACK: u8 = 2; // frame kind: acknowledgement
    pub const FRAME_CTRL: u8 = 3; // frame kind: link control

    pub const CTRL_HELLO: u8 = 1; // peer probe
    pub const CTRL_HELLO_ACK: u8 = 2; // probe response with capabilities
    pub const CTRL_BAUD: u8 = 3; // auto-baud candidate
    pub const CTRL_OPEN: u8 = 4; // open channel by name
    pub const CTRL_OPEN_ACK: u8 = 5; // channel open granted
    pub const CTRL_OPEN_FAIL: u8 = 6; // named server absent
    pub const CTRL_CLOSE: u8 = 7; // close channel
    pub const CTRL_CREDIT: u8 = 8; // grant flow-control credit
    pub const CTRL_KEEPALIVE: u8 = 9; // idle-link liveness probe
    pub const CTRL_BYE: u8 = 10; // orderly shutdown

    pub const CONTROL_CHANNEL: u8 = 0; // channel 0 carries link control only

    pub const HEADER_SIZE: usize = 5; // seq + kind + chan + 2-byte length
    pub const TRAILER_SIZE: usize = 2; // 16-bit checksum

    pub const WINDOW_DEF: u8 = 4; // default unacked frame window
    pub const RETRY_LIMIT_DEF: u32 = 8; // retransmissions before the link fails
    pub const RETRY_BASE_MS: u32 = 200; // retransmit timeout floor
    pub const PAYLOAD_DEF: u16 = 256; // default max payload per frame
    pub const CREDIT_DEF: u32 = 2048; // default per-channel credit grant, bytes
    pub const QUEUE_LIMIT_DEF: usize = 32; // pending chunks per channel
    pub const REQUEST_TIMEOUT_MS: u32 = 30_000; // shared-channel request deadline
    pub const KEEPALIVE_MS: u32 = 10_000; // default idle probe interval
    pub const PROTOCOL_VERSION: u8 = 2;
}

/// Channel identifier type
pub type ChannelId = u8;

/// Frame sequence number type (8-bit, wraps)
pub type SeqNum = u8;

/// Timestamp type (milliseconds, wraps)
pub type Timestamp = u32;

/// Frame header structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub seq: SeqNum,
    pub kind: u8,
    pub chan: ChannelId,
    pub len: u16,
}

impl FrameHeader {
    /// Size of the header on the wire, before stuffing
    pub const SIZE: usize = constants::HEADER_SIZE;

    pub fn new(seq: SeqNum, kind: u8, chan: ChannelId) -> Self {
        Self {
            seq,
            kind,
            chan,
            len: 0,
        }
    }

    /// Encode header into buffer (unstuffed)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.seq);
        buf.put_u8(self.kind);
        buf.put_u8(self.chan);
        buf.put_u16(self.len);
    }

    /// Decode header from buffer (unstuffed)
    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            seq: buf.get_u8(),
            kind: buf.get_u8(),
            chan: buf.get_u8(),
            len: buf.get_u16(),
        })
    }

    /// Get frame kind as string for debugging
    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            constants::FRAME_DATA => "DATA",
            constants::FRAME_ACK => "ACK",
            constants::FRAME_CTRL => "CTRL",
            _ => "UNKNOWN",
        }
    }
}

/// A complete frame: header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(seq: SeqNum, kind: u8, chan: ChannelId, payload: Bytes) -> Self {
        let mut header = FrameHeader::new(seq, kind, chan);
        header.len = payload.len() as u16;
        Self { header, payload }
    }

    /// Create a data frame
    pub fn data(seq: SeqNum, chan: ChannelId, payload: Bytes) -> Self {
        Self::new(seq, constants::FRAME_DATA, chan, payload)
    }

    /// Create an acknowledgement for `seq`
    pub fn ack(seq: SeqNum) -> Self {
        Self::new(seq, constants::FRAME_ACK, constants::CONTROL_CHANNEL, Bytes::new())
    }

    /// Create a control frame
    pub fn control(seq: SeqNum, payload: Bytes) -> Self {
        Self::new(seq, constants::FRAME_CTRL, constants::CONTROL_CHANNEL, payload)
    }

    /// Header-plus-payload size before stuffing and markers
    pub fn body_size(&self) -> usize {
        FrameHeader::SIZE + self.payload.len() + constants::TRAILER_SIZE
    }

    pub fn is_data(&self) -> bool {
        self.header.kind == constants::FRAME_DATA
    }

    pub fn is_ack(&self) -> bool {
        self.header.kind == constants::FRAME_ACK
    }

    pub fn is_control(&self) -> bool {
        self.header.kind == constants::FRAME_CTRL
    }

    /// Encode the frame into its on-wire form: markers, stuffed body,
    /// and trailing checksum over header + payload.
    pub fn encode_wire(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::with_capacity(self.body_size());
        self.header.encode(&mut body);
        body.extend_from_slice(&self.payload);

        let crc = crc16(&body);
        body.put_u16(crc);

        buf.put_u8(constants::FRAME_STX);
        for &byte in body.iter() {
            if matches!(
                byte,
                constants::FRAME_STX | constants::FRAME_ETX | constants::FRAME_DLE
            ) {
                buf.put_u8(constants::FRAME_DLE);
                buf.put_u8(byte ^ constants::FRAME_XOR);
            } else {
                buf.put_u8(byte);
            }
        }
        buf.put_u8(constants::FRAME_ETX);
    }

    /// Decode an unstuffed frame body (header + payload + checksum).
    ///
    /// Returns `None` on bad checksum or a length that disagrees with
    /// the body; such frames are dropped silently and retransmitted by
    /// the peer.
    pub fn decode_body(body: Bytes) -> Option<Self> {
        if body.len() < FrameHeader::SIZE + constants::TRAILER_SIZE {
            return None;
        }

        let check_end = body.len() - constants::TRAILER_SIZE;
        let expect = crc16(&body[..check_end]);
        let got = u16::from_be_bytes([body[check_end], body[check_end + 1]]);
        if expect != got {
            return None;
        }

        let mut buf = body.slice(..check_end);
        let header = FrameHeader::decode(&mut buf)?;
        if buf.len() != header.len as usize {
            return None;
        }

        Some(Self {
            header,
            payload: buf,
        })
    }
}

/// CRC-16/CCITT-FALSE over `data` (poly 0x1021, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Get current timestamp in milliseconds
pub fn current_timestamp() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

/// Calculate time difference handling wrapping
pub fn time_diff(later: Timestamp, earlier: Timestamp) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// Check if an 8-bit sequence number is before another (handling wrap)
pub fn seq_before(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i8) < 0
}

/// Check if an 8-bit sequence number is after another (handling wrap)
pub fn seq_after(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i8) > 0
}

/// Lock-free recycling of frame scratch buffers.
///
/// Encoded wire images are retained frozen until the peer acknowledges
/// them; a released image that nobody else references converts back
/// into its `BytesMut` and returns here instead of being freed. A miss
/// falls through to a plain allocation, so acquisition never blocks.
pub mod pool {
    use bytes::{Bytes, BytesMut};
    use crossbeam_queue::ArrayQueue;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::LazyLock;

    /// Holds one stuffed frame at the default payload size
    const FRAME_CAP: usize = 600;
    /// Oversized payload configurations and reassembly scratch
    const BULK_CAP: usize = 4096;

    static FRAME_SLOTS: LazyLock<ArrayQueue<BytesMut>> = LazyLock::new(|| ArrayQueue::new(128));
    static BULK_SLOTS: LazyLock<ArrayQueue<BytesMut>> = LazyLock::new(|| ArrayQueue::new(16));
    static REUSED: AtomicU64 = AtomicU64::new(0);

    /// Take a buffer with at least `size_hint` bytes of capacity.
    pub fn acquire(size_hint: usize) -> BytesMut {
        let (slots, cap) = if size_hint <= FRAME_CAP {
            (&FRAME_SLOTS, FRAME_CAP)
        } else {
            (&BULK_SLOTS, BULK_CAP.max(size_hint))
        };
        match slots.pop() {
            Some(buf) => {
                REUSED.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => BytesMut::with_capacity(cap),
        }
    }

    /// Hand back a spent scratch buffer. Undersized buffers and a full
    /// tier both fall to the allocator.
    pub fn recycle(mut buf: BytesMut) {
        buf.clear();
        let slots = if buf.capacity() >= BULK_CAP {
            &BULK_SLOTS
        } else if buf.capacity() >= FRAME_CAP {
            &FRAME_SLOTS
        } else {
            return;
        };
        let _ = slots.push(buf);
    }

    /// Reclaim a released wire image. Only the last reference converts
    /// back; an image still shared stays with its other holders.
    pub fn recycle_frozen(bytes: Bytes) {
        if let Ok(buf) = bytes.try_into_mut() {
            recycle(buf);
        }
    }

    /// Acquisitions served from recycled buffers so far
    pub fn reuse_count() -> u64 {
        REUSED.load(Ordering::Relaxed)
    }
}
