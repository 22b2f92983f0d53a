//! Streaming write handle for the current outbound message.
//!
//! Mirrors [`Reader`]: the cursor state lives on the MPS context, the
//! handle is a short-lived view writing into either the open record region
//! (application data) or the backing buffer of a handshake message.
//!
//! [`Reader`]: crate::Reader

use crate::buffer::Buf;
use crate::Error;

/// Persistent cursor of the message being written.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WriterState {
    /// Offset in the target buffer where this message starts.
    pub base: usize,
    /// Committed end position (absolute in the target buffer).
    pub committed: usize,
    /// Hard capacity (absolute in the target buffer).
    pub limit: usize,
    /// Declared message length, if the user provided one.
    pub declared: Option<usize>,
}

impl WriterState {
    pub fn start(base: usize, limit: usize, declared: Option<usize>) -> Self {
        WriterState {
            base,
            committed: base,
            limit,
            declared,
        }
    }

    /// Message bytes committed so far.
    pub fn written(&self) -> usize {
        self.committed - self.base
    }

    pub fn is_done(&self) -> bool {
        match self.declared {
            Some(l) => self.written() == l,
            None => true,
        }
    }
}

/// Write handle for the current outbound message.
///
/// Obtained from [`Mps::write_handshake`] or [`Mps::write_application`] and
/// valid until the matching dispatch or pause call.
///
/// [`Mps::write_handshake`]: crate::Mps::write_handshake
/// [`Mps::write_application`]: crate::Mps::write_application
#[derive(Debug)]
pub struct Writer<'a> {
    buf: &'a mut Buf,
    state: &'a mut WriterState,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(buf: &'a mut Buf, state: &'a mut WriterState) -> Self {
        debug_assert!(buf.len() >= state.committed);
        Writer { buf, state }
    }

    /// Reserve space for `n` more bytes and return it for filling.
    ///
    /// Fails with [`Error::BadInput`] when a declared message length would
    /// be exceeded, and with [`Error::WantWrite`] when the current record
    /// region is full; in the latter case, dispatch and retry.
    pub fn reserve(&mut self, n: usize) -> Result<&mut [u8], Error> {
        if let Some(declared) = self.state.declared {
            if self.state.written() + n > declared {
                return Err(Error::BadInput("write past declared message length"));
            }
        }
        if self.state.committed + n > self.state.limit {
            return Err(Error::WantWrite);
        }

        self.buf.resize(self.state.committed + n, 0);
        Ok(&mut self.buf[self.state.committed..])
    }

    /// Commit `n` bytes of previously reserved space.
    pub fn commit(&mut self, n: usize) -> Result<(), Error> {
        if self.state.committed + n > self.buf.len() {
            return Err(Error::BadInput("commit past reserved space"));
        }
        self.state.committed += n;
        self.buf.truncate(self.state.committed);
        Ok(())
    }

    /// Reserve, fill and commit in one step.
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        let dst = self.reserve(data.len())?;
        dst[..data.len()].copy_from_slice(data);
        self.commit(data.len())
    }

    /// Message bytes committed so far.
    pub fn written(&self) -> usize {
        self.state.written()
    }

    /// Bytes still writable before hitting the declared length or the
    /// region capacity.
    pub fn space_left(&self) -> usize {
        let cap = self.state.limit - self.state.committed;
        match self.state.declared {
            Some(l) => cap.min(l - self.state.written()),
            None => cap,
        }
    }
}
