//! Streaming read handle over the current inbound message.
//!
//! The cursor state lives on the MPS context so that a paused read survives
//! the handle itself; the [`Reader`] is a short-lived view pairing that
//! state with the bytes currently available. Exclusive ownership follows
//! from the mutable borrow of the context: a second reader cannot exist
//! while one is out.

use crate::Error;

/// Persistent cursor of the message being read.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ReaderState {
    /// Bytes of the message consumed so far (absolute offset).
    pub offset: usize,
    /// Absolute message offset of the first byte currently available.
    pub base: usize,
    /// Total message length.
    pub total: usize,
}

impl ReaderState {
    pub fn start(total: usize) -> Self {
        ReaderState {
            offset: 0,
            base: 0,
            total,
        }
    }

    /// Bytes consumed from the currently available window.
    pub fn taken_from_window(&self) -> usize {
        self.offset - self.base
    }

    pub fn is_done(&self) -> bool {
        self.offset == self.total
    }
}

/// Lazily advancing window into the current inbound message.
///
/// Obtained from [`Mps::read_handshake`] or [`Mps::read_application`] and
/// valid until the matching consume or pause call.
///
/// [`Mps::read_handshake`]: crate::Mps::read_handshake
/// [`Mps::read_application`]: crate::Mps::read_application
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    state: &'a mut ReaderState,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], state: &'a mut ReaderState) -> Self {
        debug_assert!(state.offset >= state.base);
        debug_assert!(state.offset - state.base <= data.len());
        Reader { data, state }
    }

    /// Look at up to `n` bytes without consuming them.
    ///
    /// Returns fewer than `n` bytes only if the message ends there. When
    /// the message continues beyond the bytes currently available (stream
    /// mode, message spanning records), returns [`Error::WantRead`]: pause
    /// the read and retry once more data has arrived.
    pub fn peek(&self, n: usize) -> Result<&[u8], Error> {
        let local = self.state.taken_from_window();
        let avail = self.data.len() - local;

        if n <= avail {
            return Ok(&self.data[local..local + n]);
        }

        let window_end = self.state.base + self.data.len();
        if window_end >= self.state.total {
            // The message ends inside the window: short read.
            Ok(&self.data[local..])
        } else {
            Err(Error::WantRead)
        }
    }

    /// Consume `n` bytes. Only bytes previously seen via
    /// [`Reader::peek`] may be consumed.
    pub fn advance(&mut self, n: usize) -> Result<(), Error> {
        let local = self.state.taken_from_window();
        if local + n > self.data.len() {
            return Err(Error::BadInput("advance past available data"));
        }
        self.state.offset += n;
        Ok(())
    }

    /// Bytes of the message not yet consumed (including bytes that have
    /// not arrived yet).
    pub fn remaining(&self) -> usize {
        self.state.total - self.state.offset
    }
}
