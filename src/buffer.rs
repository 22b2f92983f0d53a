//! Pooled byte buffers.
//!
//! Record payloads, reassembly windows and retransmission backups all churn
//! through buffers of roughly datagram size. The pool recycles them to avoid
//! per-message allocation, and every buffer scrubs itself on drop since it
//! may have held plaintext or key-derived data.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut, RangeBounds};
use std::vec::Drain;

use zeroize::Zeroize;

/// Pool of reusable [`Buf`] instances.
#[derive(Default)]
pub struct BufferPool {
    free: VecDeque<Buf>,
}

impl BufferPool {
    /// Take a buffer from the pool, creating one if none is free.
    pub fn take(&mut self) -> Buf {
        self.free.pop_front().unwrap_or_default()
    }

    /// Return a buffer to the pool.
    ///
    /// The contents are scrubbed before the buffer becomes reusable.
    pub fn put(&mut self, mut buffer: Buf) {
        buffer.0.zeroize();
        buffer.clear();
        self.free.push_back(buffer);
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("free", &self.free.len())
            .finish()
    }
}

/// A growable byte buffer that zeroizes on drop.
#[derive(Default)]
pub struct Buf(Vec<u8>);

impl Buf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: usize) -> Self {
        Buf(vec![0; len])
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn extend_from_slice(&mut self, other: &[u8]) {
        self.0.extend_from_slice(other);
    }

    pub fn push(&mut self, byte: u8) {
        self.0.push(byte);
    }

    pub fn resize(&mut self, len: usize, value: u8) {
        self.0.resize(len, value);
    }

    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }

    pub fn drain(&mut self, r: impl RangeBounds<usize>) -> Drain<'_, u8> {
        self.0.drain(r)
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

// The AEAD transforms work in place on the record payload buffer.
impl aes_gcm::aead::Buffer for Buf {
    fn extend_from_slice(&mut self, other: &[u8]) -> aes_gcm::aead::Result<()> {
        self.0.extend_from_slice(other);
        Ok(())
    }

    fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }
}

impl Deref for Buf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Buf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl AsRef<[u8]> for Buf {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsMut<[u8]> for Buf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf").field("len", &self.0.len()).finish()
    }
}

impl From<Vec<u8>> for Buf {
    fn from(v: Vec<u8>) -> Self {
        Buf(v)
    }
}

impl From<&[u8]> for Buf {
    fn from(v: &[u8]) -> Self {
        Buf(v.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_recycles() {
        let mut pool = BufferPool::default();
        let mut b = pool.take();
        b.extend_from_slice(b"secret");
        pool.put(b);

        let b = pool.take();
        assert!(b.is_empty());
        // Recycled, not re-allocated.
        assert!(b.0.capacity() >= 6);
    }

    #[test]
    fn put_scrubs_contents() {
        let mut pool = BufferPool::default();
        let mut b = pool.take();
        b.extend_from_slice(&[0xAA; 16]);
        pool.put(b);

        let mut b = pool.take();
        b.resize(16, 0);
        assert_eq!(&*b, &[0u8; 16]);
    }
}
