//! mstack: a transport-agnostic (D)TLS message processing stack
//!
//! mstack is the engine between raw record I/O and a handshake state
//! machine: it owns record sequencing, epoch-keyed record protection,
//! DTLS handshake fragmentation and reassembly, and the retransmission
//! state machine that makes handshake flights reliable over a lossy
//! datagram transport. Handshake *contents* never enter this crate; the
//! layer above parses them through streaming readers and writers.
//!
//! # Goals
//! - **One pipeline, two transports**: the same layered engine runs over
//!   a byte stream (TLS framing) or datagrams (DTLS framing), selected at
//!   runtime.
//! - **Safety**: `forbid(unsafe_code)` throughout the crate.
//! - **Low overhead**: pooled buffers, bounded reassembly windows, no
//!   per-message allocation churn.
//! - **Narrow collaborators**: bulk AEAD, transport and timer are small
//!   traits the embedding application provides.
//!
//! ## Non-goals
//! - Parsing handshake payloads or running the TLS state machine proper
//! - Key schedule derivation and certificate validation
//! - Session tickets, configuration file loading, CLI tooling
//! - Primitive cryptography beyond the bundled AEAD transforms
//!
//! # Layering
//!
//! ```text
//! user (handshake logic)
//!   │  read()/write_*()/dispatch()/flush()     readers & writers
//! L4 flight & retransmission machine           src/flight/
//!   │  complete handshake messages
//! L3 message demux & handshake headers         src/message.rs
//!   │  decrypted record payloads
//! L2 record layer (epochs, replay, AEAD)       src/record/
//!   │  datagrams / byte runs
//! L1 transport adapter                         src/transport.rs
//! ```
//!
//! # Integration model
//!
//! The stack never blocks: operations either succeed, fail terminally, or
//! return [`Error::WantRead`] / [`Error::WantWrite`] together with
//! dependency bits ([`Mps::read_dependencies`],
//! [`Mps::write_dependencies`]) describing what to wait for. The caller
//! waits on its socket (and the [`Timer`]) and calls back in.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mstack::{Config, Error, HandshakeOut, Mps, MsgFlags, Retransmit, Transform};
//! # fn transport() -> Box<dyn mstack::Transport> { unimplemented!() }
//! # fn timer() -> Box<dyn mstack::Timer> { unimplemented!() }
//!
//! fn client_hello(mps: &mut Mps) -> Result<(), Error> {
//!     let body = b"...client hello body...";
//!
//!     let mut writer = mps.write_handshake(HandshakeOut {
//!         msg_type: 1,
//!         length: Some(body.len()),
//!         retransmit: Retransmit::Buffered,
//!     })?;
//!     writer.write_all(body)?;
//!     drop(writer);
//!
//!     mps.write_set_flags(MsgFlags::END)?;
//!     mps.dispatch()?;
//!     mps.flush()
//! }
//!
//! let config = Arc::new(Config::builder().build().unwrap());
//! let mut mps = Mps::new(config, transport(), timer());
//! let epoch = mps.register_epoch(Transform::plaintext()).unwrap();
//! mps.activate_read_epoch(epoch).unwrap();
//! mps.activate_write_epoch(epoch).unwrap();
//! let _ = client_hello(&mut mps);
//! ```
//!
//! ### MSRV
//! Rust 1.81.0

#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(missing_docs)]
#![allow(clippy::len_without_is_empty)]

#[macro_use]
extern crate log;

pub mod buffer;
mod config;
mod epoch;
mod error;
mod flight;
mod message;
mod mps;
mod reader;
pub mod record;
mod timer;
mod transport;
mod util;
mod window;
mod writer;

pub use config::{Config, ConfigBuilder};
pub use epoch::{Aead, AuthError, EpochId, Transform};
pub use error::{BlockReason, BlockingInfo, Error, Layer};
pub use flight::{MsgFlags, Retransmit, MAX_FLIGHT_LENGTH};
pub use message::{Alert, AlertDescription, AlertLevel, HandshakeHeader, MsgType};
pub use mps::{ConnectionState, HandshakeIn, HandshakeOut, Mps};
pub use reader::Reader;
pub use timer::{Timer, TimerState};
pub use transport::{Dependencies, Mode, Transport};
pub use window::ReplayWindow;
pub use writer::Writer;
