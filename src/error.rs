use core::fmt;

use crate::message::AlertDescription;

/// The pipeline layer an error originated in.
///
/// Carried inside [`Error::InvalidRecord`] and [`Error::Internal`] so a
/// failure can be diagnosed without exposing layer internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// L1: the transport adapter.
    Transport,
    /// L2: the record layer.
    Record,
    /// L3: the message layer.
    Message,
    /// L4: the flight and retransmission state machine.
    Flight,
}

/// Errors surfaced by the stack.
///
/// `WantRead` and `WantWrite` are backpressure, not failures: retry once the
/// corresponding dependency (see [`Dependencies`]) fires. Every other
/// variant except [`Error::CloseNotify`] records itself in the context's
/// blocking info, after which all calls but `flush` return
/// [`Error::Blocked`].
///
/// [`Dependencies`]: crate::Dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Progress requires the transport to become readable.
    WantRead,
    /// Progress requires the transport to become writable.
    WantWrite,
    /// Record framing or AEAD authentication failed.
    ///
    /// Fatal in stream mode. In datagram mode the offending record is
    /// discarded silently and this variant never reaches the user.
    InvalidRecord(Layer),
    /// Padding removal failed (stream mode).
    InvalidPadding,
    /// API misuse, or a malformed inbound structure that survived the
    /// record layer.
    BadInput(&'static str),
    /// Too many retransmission timeouts without progress. The connection
    /// closes without an alert.
    RetransmitTimeoutExhausted,
    /// A fatal alert has been sent to the peer.
    AlertSent(AlertDescription),
    /// A fatal alert has been received from the peer.
    AlertReceived(AlertDescription),
    /// The peer closed its writing side in an orderly fashion.
    CloseNotify,
    /// The context is blocked after a previous terminal condition.
    /// Inspect [`Mps::error_state`] for the cause.
    ///
    /// [`Mps::error_state`]: crate::Mps::error_state
    Blocked,
    /// An outgoing flight exceeded the configured maximum length.
    FlightTooLong,
    /// A sequence number space was exhausted.
    CounterWrap,
    /// An internal invariant was violated.
    Internal(Layer, &'static str),
}

impl Error {
    /// True for the non-fatal backpressure variants.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WantRead | Error::WantWrite)
    }
}

/// Why a context became blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockReason {
    /// The context is not blocked.
    #[default]
    None,
    /// We sent a fatal alert.
    AlertSent(AlertDescription),
    /// The peer sent a fatal alert.
    AlertReceived(AlertDescription),
    /// Retransmission gave up without progress.
    TimeoutExhausted,
    /// An internal failure; the original error is preserved.
    Failure(Error),
}

/// Snapshot of the terminal condition that blocked a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockingInfo {
    /// The reason the context blocked.
    pub reason: BlockReason,
}

impl BlockingInfo {
    pub(crate) fn record(&mut self, reason: BlockReason) {
        // First cause wins; later failures are consequences.
        if self.reason == BlockReason::None {
            self.reason = reason;
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::WantRead => write!(f, "want-read"),
            Error::WantWrite => write!(f, "want-write"),
            Error::InvalidRecord(l) => write!(f, "invalid record ({:?})", l),
            Error::InvalidPadding => write!(f, "invalid padding"),
            Error::BadInput(what) => write!(f, "bad input: {}", what),
            Error::RetransmitTimeoutExhausted => {
                write!(f, "retransmission timeout exhausted")
            }
            Error::AlertSent(a) => write!(f, "fatal alert sent: {:?}", a),
            Error::AlertReceived(a) => write!(f, "fatal alert received: {:?}", a),
            Error::CloseNotify => write!(f, "close-notify received"),
            Error::Blocked => write!(f, "context is blocked"),
            Error::FlightTooLong => write!(f, "flight too long"),
            Error::CounterWrap => write!(f, "sequence counter wrapped"),
            Error::Internal(l, what) => write!(f, "internal error ({:?}): {}", l, what),
        }
    }
}

impl std::error::Error for Error {}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    fn from(_: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        Error::InvalidRecord(Layer::Record)
    }
}
