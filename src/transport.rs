//! The L1 transport contract.
//!
//! The stack never touches sockets itself. The embedding application hands
//! in something implementing [`Transport`], and the stack calls it from the
//! read and write paths. All methods are non-blocking: when the underlying
//! I/O cannot progress they return [`Error::WantRead`] /
//! [`Error::WantWrite`], which the stack propagates together with the
//! dependency bits telling the caller what to wait for.

use std::time::Duration;

use crate::Error;

/// Whether the pipeline runs over a stream or a datagram transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reliable ordered byte stream (TLS framing, implicit sequence
    /// numbers, no retransmission machinery).
    Stream,
    /// Unreliable datagrams (DTLS framing, explicit epoch/sequence,
    /// fragmentation, reassembly and flight retransmission).
    Datagram,
}

/// Byte transport underneath the record layer.
///
/// For [`Mode::Datagram`], `send` must transmit the whole buffer as one
/// datagram and `recv` must deliver exactly one datagram per call. For
/// [`Mode::Stream`], both operate on arbitrary byte runs.
pub trait Transport {
    /// Send bytes. Returns the number of bytes accepted, or
    /// [`Error::WantWrite`] if the transport cannot take data right now.
    ///
    /// Datagram transports must accept all-or-nothing.
    fn send(&mut self, data: &[u8]) -> Result<usize, Error>;

    /// Receive bytes into `buf`. Returns the number of bytes received, or
    /// [`Error::WantRead`] if nothing is available.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Receive with a timeout. Returns [`Error::WantRead`] both on timeout
    /// and on would-block; the distinction is carried by the timer state.
    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        let _ = timeout;
        self.recv(buf)
    }
}

/// External conditions that would let a blocked operation progress.
///
/// Returned by [`Mps::read_dependencies`] and [`Mps::write_dependencies`].
///
/// [`Mps::read_dependencies`]: crate::Mps::read_dependencies
/// [`Mps::write_dependencies`]: crate::Mps::write_dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dependencies(u8);

impl Dependencies {
    /// The transport must become readable.
    pub const TRANSPORT_READ: Dependencies = Dependencies(1 << 0);
    /// The transport must become writable.
    pub const TRANSPORT_WRITE: Dependencies = Dependencies(1 << 1);

    /// No external dependency is pending.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set in `self`.
    pub fn contains(&self, other: Dependencies) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn insert(&mut self, other: Dependencies) {
        self.0 |= other.0;
    }

    pub(crate) fn clear(&mut self) {
        self.0 = 0;
    }
}
