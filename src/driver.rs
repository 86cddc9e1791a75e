//! Byte-pipe driver abstraction
//!
//! The [`Driver`] trait lets the link core run over any asynchronous
//! serial device: a UART, an infrared adapter, a USB CDC endpoint. The
//! upper layers never block; they only move the bytes the driver can
//! accept right now, and the driver reports readiness via
//! [`Driver::tx_free`] and [`Driver::rx_avail`].
//!
//! [`LoopbackDriver::pair`] provides two connected in-memory endpoints
//! used by the integration tests.

use crate::error::{LinkError, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::debug;

/// Non-blocking byte pipe consumed by the framing layer.
pub trait Driver {
    /// Write as much of `buf` as fits, returning the number of bytes taken.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Read available bytes into `buf`, returning the number read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Bytes of transmit buffer space currently free.
    fn tx_free(&self) -> usize;

    /// Bytes currently waiting to be read.
    fn rx_avail(&self) -> usize;

    /// Reconfigure the line rate.
    fn set_baud(&mut self, baud: u32) -> Result<()>;

    /// Pass an opaque option string to the device.
    fn set_options(&mut self, options: &str) -> Result<()>;

    /// Enable or disable hardware auto-baud detection.
    fn auto_baud(&mut self, enable: bool) -> Result<()>;

    /// Discard any buffered but untransmitted output.
    fn drain(&mut self) -> Result<()>;
}

/// One direction of an in-memory pipe.
struct Pipe {
    queue: VecDeque<u8>,
    capacity: usize,
}

impl Pipe {
    fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
}

/// In-memory driver: two endpoints joined by a pair of bounded pipes.
///
/// Used by tests and by the sans-IO examples; bytes written at one end
/// become readable at the other. Fault-injection helpers corrupt or
/// discard in-flight bytes to exercise the retransmission path.
pub struct LoopbackDriver {
    tx: Rc<RefCell<Pipe>>,
    rx: Rc<RefCell<Pipe>>,
    baud: u32,
}

impl LoopbackDriver {
    /// Create a connected pair of endpoints with `capacity` bytes of
    /// buffering in each direction.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let a_to_b = Rc::new(RefCell::new(Pipe::new(capacity)));
        let b_to_a = Rc::new(RefCell::new(Pipe::new(capacity)));

        let a = Self {
            tx: a_to_b.clone(),
            rx: b_to_a.clone(),
            baud: 115_200,
        };
        let b = Self {
            tx: b_to_a,
            rx: a_to_b,
            baud: 115_200,
        };
        (a, b)
    }

    /// Bytes currently in flight towards the peer.
    pub fn in_flight(&self) -> usize {
        self.tx.borrow().queue.len()
    }

    /// Flip one bit of the in-flight byte at `index`.
    pub fn corrupt_in_flight(&self, index: usize) {
        let mut pipe = self.tx.borrow_mut();
        if let Some(byte) = pipe.queue.get_mut(index) {
            *byte ^= 0x01;
        }
    }

    /// Discard everything currently in flight towards the peer.
    pub fn drop_in_flight(&self) {
        self.tx.borrow_mut().queue.clear();
    }
}

impl Driver for LoopbackDriver {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut pipe = self.tx.borrow_mut();
        let space = pipe.capacity - pipe.queue.len();
        let take = buf.len().min(space);
        pipe.queue.extend(&buf[..take]);
        Ok(take)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut pipe = self.rx.borrow_mut();
        let mut count = 0;
        while count < buf.len() {
            match pipe.queue.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }

    fn tx_free(&self) -> usize {
        let pipe = self.tx.borrow();
        pipe.capacity - pipe.queue.len()
    }

    fn rx_avail(&self) -> usize {
        self.rx.borrow().queue.len()
    }

    fn set_baud(&mut self, baud: u32) -> Result<()> {
        if baud == 0 {
            return Err(LinkError::bad_parms("baud rate must be greater than 0"));
        }
        debug!(baud, "loopback baud changed");
        self.baud = baud;
        Ok(())
    }

    fn set_options(&mut self, options: &str) -> Result<()> {
        debug!(options, "loopback options set");
        Ok(())
    }

    fn auto_baud(&mut self, _enable: bool) -> Result<()> {
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        self.tx.borrow_mut().queue.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_transfers_bytes() {
        let (mut a, mut b) = LoopbackDriver::pair(64);

        assert_eq!(a.write(b"hello").unwrap(), 5);
        assert_eq!(b.rx_avail(), 5);

        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(b.rx_avail(), 0);
    }

    #[test]
    fn test_write_respects_capacity() {
        let (mut a, _b) = LoopbackDriver::pair(4);
        assert_eq!(a.write(b"abcdef").unwrap(), 4);
        assert_eq!(a.tx_free(), 0);
        assert_eq!(a.write(b"x").unwrap(), 0);
    }

    #[test]
    fn test_drop_in_flight() {
        let (mut a, b) = LoopbackDriver::pair(64);
        a.write(b"doomed").unwrap();
        a.drop_in_flight();
        assert_eq!(b.rx_avail(), 0);
    }
}
