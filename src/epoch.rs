//! Epochs: registered sets of record-protection parameters.
//!
//! An epoch is an opaque, monotonically allocated identifier referring to
//! an AEAD transform plus per-direction record state (outgoing sequence
//! counter, incoming replay window). Registration transfers ownership of
//! the transform to the stack; activation for read and write happens
//! independently. An epoch is retained while either direction still uses
//! it or any buffered message references it, and purged once it is
//! strictly older than both.

use core::fmt;

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};
use zeroize::Zeroize;

use crate::buffer::Buf;
use crate::window::ReplayWindow;

/// Identifier of a registered epoch.
///
/// Also the on-wire epoch value in datagram mode, which is why it is not
/// opaque to the record layer.
pub type EpochId = u16;

/// Authentication failure reported by an [`Aead`] implementation.
///
/// Deliberately carries no detail: decryption failures must be
/// indistinguishable to an observer of our behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthError;

/// Bulk record protection, the narrow cryptographic collaborator of the
/// stack.
///
/// Implementations must be deterministic and constant-time in the inputs.
/// The payload buffer is transformed in place; `seal` appends the
/// authentication tag, `open` verifies and strips it.
pub trait Aead: Send {
    /// Bytes of per-record expansion (the tag).
    fn overhead(&self) -> usize;

    /// Encrypt `payload` in place under `nonce`, authenticating `aad`.
    fn seal(&self, nonce: &[u8; 12], aad: &[u8], payload: &mut Buf) -> Result<(), AuthError>;

    /// Decrypt `payload` in place under `nonce`, verifying `aad`.
    fn open(&self, nonce: &[u8; 12], aad: &[u8], payload: &mut Buf) -> Result<(), AuthError>;
}

/// A registered protection transform: an AEAD plus its nonce base.
///
/// The per-record nonce is the nonce base XORed with the 8-byte wire
/// sequence of the record, aligned to the end of the base.
pub struct Transform {
    aead: Box<dyn Aead>,
    nonce_base: [u8; 12],
}

impl Transform {
    /// Wrap a caller-provided AEAD implementation.
    pub fn new(aead: Box<dyn Aead>, nonce_base: [u8; 12]) -> Self {
        Transform { aead, nonce_base }
    }

    /// The identity transform for unprotected epochs (epoch 0 of a
    /// handshake, and tests that need a deterministic wire image).
    pub fn plaintext() -> Self {
        Transform {
            aead: Box::new(PlaintextAead),
            nonce_base: [0; 12],
        }
    }

    /// AES-128-GCM under `key` with the given nonce base.
    pub fn aes128_gcm(mut key: [u8; 16], nonce_base: [u8; 12]) -> Self {
        let cipher = Aes128Gcm::new((&key).into());
        key.zeroize();
        Transform {
            aead: Box::new(GcmAead(cipher)),
            nonce_base,
        }
    }

    /// AES-256-GCM under `key` with the given nonce base.
    pub fn aes256_gcm(mut key: [u8; 32], nonce_base: [u8; 12]) -> Self {
        let cipher = Aes256Gcm::new((&key).into());
        key.zeroize();
        Transform {
            aead: Box::new(GcmAead(cipher)),
            nonce_base,
        }
    }

    pub(crate) fn overhead(&self) -> usize {
        self.aead.overhead()
    }

    pub(crate) fn nonce_for(&self, wire_seq: [u8; 8]) -> [u8; 12] {
        let mut nonce = self.nonce_base;
        for (n, s) in nonce[4..].iter_mut().zip(wire_seq.iter()) {
            *n ^= s;
        }
        nonce
    }

    pub(crate) fn seal(
        &self,
        wire_seq: [u8; 8],
        aad: &[u8],
        payload: &mut Buf,
    ) -> Result<(), AuthError> {
        self.aead.seal(&self.nonce_for(wire_seq), aad, payload)
    }

    pub(crate) fn open(
        &self,
        wire_seq: [u8; 8],
        aad: &[u8],
        payload: &mut Buf,
    ) -> Result<(), AuthError> {
        self.aead.open(&self.nonce_for(wire_seq), aad, payload)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("overhead", &self.aead.overhead())
            .finish()
    }
}

struct PlaintextAead;

impl Aead for PlaintextAead {
    fn overhead(&self) -> usize {
        0
    }

    fn seal(&self, _: &[u8; 12], _: &[u8], _: &mut Buf) -> Result<(), AuthError> {
        Ok(())
    }

    fn open(&self, _: &[u8; 12], _: &[u8], _: &mut Buf) -> Result<(), AuthError> {
        Ok(())
    }
}

struct GcmAead<C>(C);

impl<C> Aead for GcmAead<C>
where
    C: AeadInPlace + Send,
{
    fn overhead(&self) -> usize {
        16
    }

    fn seal(&self, nonce: &[u8; 12], aad: &[u8], payload: &mut Buf) -> Result<(), AuthError> {
        self.0
            .encrypt_in_place(Nonce::from_slice(nonce), aad, payload)
            .map_err(|_| AuthError)
    }

    fn open(&self, nonce: &[u8; 12], aad: &[u8], payload: &mut Buf) -> Result<(), AuthError> {
        self.0
            .decrypt_in_place(Nonce::from_slice(nonce), aad, payload)
            .map_err(|_| AuthError)
    }
}

/// A registered epoch with its live per-direction state.
#[derive(Debug)]
pub(crate) struct EpochSlot {
    pub id: EpochId,
    pub transform: Transform,
    /// Next outgoing record sequence number on this epoch.
    pub next_seq: u64,
    /// Next incoming record sequence number (stream mode, where the
    /// counter is implicit).
    pub next_read_seq: u64,
    /// Replay window for incoming records on this epoch.
    pub replay: ReplayWindow,
}

impl EpochSlot {
    pub fn new(id: EpochId, transform: Transform) -> Self {
        EpochSlot {
            id,
            transform,
            next_seq: 0,
            next_read_seq: 0,
            replay: ReplayWindow::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcm_roundtrip_and_tamper() {
        let t = Transform::aes128_gcm([7; 16], [9; 12]);
        let seq = [0, 1, 0, 0, 0, 0, 0, 5];
        let aad = b"header";

        let mut payload = Buf::from(&b"hello world"[..]);
        t.seal(seq, aad, &mut payload).unwrap();
        assert_eq!(payload.len(), 11 + 16);

        let mut tampered = Buf::from(&payload[..]);
        tampered[0] ^= 1;
        assert!(t.open(seq, aad, &mut tampered).is_err());

        t.open(seq, aad, &mut payload).unwrap();
        assert_eq!(&*payload, b"hello world");
    }

    #[test]
    fn nonce_varies_with_sequence() {
        let t = Transform::aes128_gcm([1; 16], [0; 12]);
        let n1 = t.nonce_for([0, 0, 0, 0, 0, 0, 0, 1]);
        let n2 = t.nonce_for([0, 0, 0, 0, 0, 0, 0, 2]);
        assert_ne!(n1, n2);
    }
}
