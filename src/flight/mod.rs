//! L4: the flight and retransmission state machine (datagram mode).
//!
//! Tracks whose turn it is in the handshake, remembers our last outgoing
//! flight for retransmission, recognizes peer retransmissions of its last
//! flight, and owns the reassembly of incoming handshake messages.

mod reassembly;

pub(crate) use reassembly::Reassembly;

use core::fmt;

use arrayvec::ArrayVec;

use crate::buffer::Buf;
use crate::epoch::EpochId;
use crate::error::Error;
use crate::writer::Writer;

/// Hard upper bound on messages per flight; the configured limit must be
/// at or below this.
pub const MAX_FLIGHT_LENGTH: usize = 8;

/// State of the flight exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum FlightState {
    /// No flight exchange in progress.
    #[default]
    Done,
    /// We are emitting our outgoing flight.
    Send,
    /// Flight sent; nothing of the next incoming flight seen yet. A
    /// timeout here retransmits our flight.
    Await,
    /// At least one message of the next incoming flight has arrived. A
    /// timeout here requests retransmission from the peer.
    Receive,
    /// The handshake ended with our outgoing flight; we retain it briefly
    /// in case the peer missed it.
    Finalize,
}

/// Orthogonal retransmission substate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum RetransmitState {
    #[default]
    None,
    /// Retransmitting our last outgoing flight.
    Resend,
    /// Asking the peer to retransmit; without per-message ACKs this also
    /// replays our last outgoing flight.
    RequestResend,
}

/// How a message relates to the current flight and handshake.
///
/// Bits 0..1 carry the contribution, bit 7 marks the flags as having been
/// set at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgFlags(u8);

impl MsgFlags {
    const VALID: u8 = 1 << 7;
    const CONTRIB_MASK: u8 = 0b11;

    /// The message does not belong to a flight.
    pub const NONE: MsgFlags = MsgFlags(Self::VALID);
    /// The message contributes to the current flight.
    pub const ADD: MsgFlags = MsgFlags(Self::VALID | 1);
    /// The message contributes to and ends the current flight.
    pub const END: MsgFlags = MsgFlags(Self::VALID | 2);
    /// The message ends the entire handshake.
    pub const FINISHED: MsgFlags = MsgFlags(Self::VALID | 3);

    /// Whether the flags were explicitly set.
    pub fn is_valid(&self) -> bool {
        self.0 & Self::VALID != 0
    }

    pub(crate) fn contribution(&self) -> u8 {
        self.0 & Self::CONTRIB_MASK
    }

    pub(crate) fn ends_flight(&self) -> bool {
        self.is_valid() && self.contribution() == 2
    }

    pub(crate) fn ends_handshake(&self) -> bool {
        self.is_valid() && self.contribution() == 3
    }
}

/// How an outgoing handshake message can be produced again.
pub enum Retransmit {
    /// The stack keeps a raw copy of the message body.
    Buffered,
    /// The stack calls back to regenerate the body. The callback must be
    /// deterministic: every invocation has to produce the same bytes.
    Callback(Box<dyn Fn(&mut Writer<'_>) -> Result<(), Error> + Send>),
}

impl Default for Retransmit {
    fn default() -> Self {
        Retransmit::Buffered
    }
}

impl fmt::Debug for Retransmit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retransmit::Buffered => write!(f, "Buffered"),
            Retransmit::Callback(_) => write!(f, "Callback"),
        }
    }
}

/// The stored shape of one message of our last outgoing flight.
pub(crate) enum BackupPayload {
    Raw(Buf),
    Callback(Box<dyn Fn(&mut Writer<'_>) -> Result<(), Error> + Send>),
    Ccs,
}

impl fmt::Debug for BackupPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupPayload::Raw(b) => write!(f, "Raw({})", b.len()),
            BackupPayload::Callback(_) => write!(f, "Callback"),
            BackupPayload::Ccs => write!(f, "Ccs"),
        }
    }
}

/// Retransmission handle for one message of the outgoing flight.
#[derive(Debug)]
pub(crate) struct BackupHandle {
    pub msg_type: u8,
    pub seq: u16,
    pub epoch: EpochId,
    pub len: usize,
    pub payload: BackupPayload,
}

impl Default for BackupHandle {
    fn default() -> Self {
        BackupHandle {
            msg_type: 0,
            seq: 0,
            epoch: 0,
            len: 0,
            payload: BackupPayload::Ccs,
        }
    }
}

/// Per-message retransmission-detection state.
///
/// `Enabled` entries trigger a retransmission of our flight when the peer
/// re-sends them; `OnHold` entries only re-arm. Together they guarantee at
/// most one local retransmission per peer retransmission of its entire
/// flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DetectionState {
    Enabled,
    OnHold,
}

/// Identity of one message of the last fully-received incoming flight.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DetectionEntry {
    pub epoch: EpochId,
    pub seq: u16,
    pub state: DetectionState,
}

impl Default for DetectionEntry {
    fn default() -> Self {
        DetectionEntry {
            epoch: 0,
            seq: 0,
            state: DetectionState::Enabled,
        }
    }
}

/// The datagram-mode flight machine state owned by the MPS context.
#[derive(Debug)]
pub(crate) struct FlightMachine {
    pub state: FlightState,
    pub retransmit: RetransmitState,

    /// True from the first message of a handshake until its `finished`
    /// message is consumed or dispatched and acknowledged.
    pub exchange_active: bool,

    /// Next outgoing handshake sequence number.
    pub out_seq: u16,
    /// Flags of the message currently being written.
    pub out_flags: MsgFlags,
    /// Backups of the current/last outgoing flight.
    pub backups: ArrayVec<BackupHandle, MAX_FLIGHT_LENGTH>,

    /// Flags of the message currently being read.
    pub in_flags: MsgFlags,
    /// Recognition records for the current/last incoming flight.
    pub detection: ArrayVec<DetectionEntry, MAX_FLIGHT_LENGTH>,

    pub reassembly: Reassembly,

    /// Resends still allowed while in [`FlightState::Finalize`].
    pub finalize_resends_left: usize,
}

impl FlightMachine {
    pub fn new(future_buffers: usize) -> Self {
        FlightMachine {
            state: FlightState::Done,
            retransmit: RetransmitState::None,
            exchange_active: false,
            out_seq: 0,
            out_flags: MsgFlags::default(),
            backups: ArrayVec::new(),
            in_flags: MsgFlags::default(),
            detection: ArrayVec::new(),
            reassembly: Reassembly::new(future_buffers, 0),

            finalize_resends_left: 0,
        }
    }

    /// Forget the backups of our last outgoing flight. Happens when the
    /// first message of the next incoming flight implicitly acknowledges
    /// it.
    pub fn forget_outgoing(&mut self) {
        self.backups.clear();
    }

    /// Forget the recognition records of the last incoming flight.
    pub fn forget_detection(&mut self) {
        self.detection.clear();
    }

    /// Remember `(epoch, seq)` of a consumed incoming message for
    /// retransmission detection.
    pub fn remember_incoming(&mut self, epoch: EpochId, seq: u16) -> Result<(), Error> {
        if self.detection.is_full() {
            return Err(Error::FlightTooLong);
        }
        self.detection.push(DetectionEntry {
            epoch,
            seq,
            state: DetectionState::Enabled,
        });
        Ok(())
    }

    /// Run the detection logic for a fragment recognized as belonging to
    /// the last incoming flight. Returns `true` if our last outgoing
    /// flight should be retransmitted.
    pub fn detect_retransmission(&mut self, epoch: EpochId, seq: u16) -> bool {
        let Some(idx) = self
            .detection
            .iter()
            .position(|e| e.epoch == epoch && e.seq == seq)
        else {
            return false;
        };

        match self.detection[idx].state {
            DetectionState::Enabled => {
                // One trigger per peer retransmission of its whole
                // flight: everything else goes on hold.
                for (i, entry) in self.detection.iter_mut().enumerate() {
                    if i != idx {
                        entry.state = DetectionState::OnHold;
                    }
                }
                true
            }
            DetectionState::OnHold => {
                self.detection[idx].state = DetectionState::Enabled;
                false
            }
        }
    }

    /// Whether `(epoch, seq)` belongs to the tracked last incoming flight.
    pub fn is_tracked(&self, epoch: EpochId, seq: u16) -> bool {
        self.detection
            .iter()
            .any(|e| e.epoch == epoch && e.seq == seq)
    }

    /// The smallest epoch still referenced by buffered messages, backups
    /// or detection records; bounds epoch purging.
    pub fn min_referenced_epoch(&self) -> Option<EpochId> {
        let backup = self.backups.iter().map(|b| b.epoch).min();
        let detect = self.detection.iter().map(|e| e.epoch).min();
        let reasm = self.reassembly.min_referenced_epoch();
        [backup, detect, reasm].into_iter().flatten().min()
    }

    /// Full teardown at handshake completion.
    pub fn reset(&mut self) {
        self.state = FlightState::Done;
        self.retransmit = RetransmitState::None;
        self.exchange_active = false;
        self.out_seq = 0;
        self.out_flags = MsgFlags::default();
        self.in_flags = MsgFlags::default();
        self.backups.clear();
        self.detection.clear();
        self.reassembly.reset(0);
        self.finalize_resends_left = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_encode_contribution_and_validity() {
        assert!(!MsgFlags::default().is_valid());
        assert!(MsgFlags::ADD.is_valid());
        assert!(MsgFlags::END.ends_flight());
        assert!(!MsgFlags::END.ends_handshake());
        assert!(MsgFlags::FINISHED.ends_handshake());
        assert!(!MsgFlags::NONE.ends_flight());
    }

    #[test]
    fn single_peer_retransmission_triggers_once() {
        let mut m = FlightMachine::new(4);
        m.remember_incoming(0, 0).unwrap();
        m.remember_incoming(0, 1).unwrap();
        m.remember_incoming(0, 2).unwrap();

        // Peer retransmits its whole flight: only the first recognized
        // message triggers.
        assert!(m.detect_retransmission(0, 0));
        assert!(!m.detect_retransmission(0, 1));
        assert!(!m.detect_retransmission(0, 2));

        // Second full peer retransmission: seq 1 and 2 were flipped back
        // to enabled, so the first of them triggers again.
        assert!(!m.detect_retransmission(0, 0));
        assert!(m.detect_retransmission(0, 1));
        assert!(!m.detect_retransmission(0, 2));
    }

    #[test]
    fn partial_peer_retransmissions_recover() {
        let mut m = FlightMachine::new(4);
        m.remember_incoming(0, 0).unwrap();
        m.remember_incoming(0, 1).unwrap();

        // Only message 0 of the peer flight reaches us, repeatedly.
        assert!(m.detect_retransmission(0, 0));
        // 0 stayed enabled: a re-receipt still triggers.
        assert!(m.detect_retransmission(0, 0));
        assert!(m.detect_retransmission(0, 0));
    }

    #[test]
    fn detection_is_keyed_by_epoch_too() {
        let mut m = FlightMachine::new(4);
        m.remember_incoming(1, 5).unwrap();
        assert!(!m.is_tracked(0, 5));
        assert!(m.is_tracked(1, 5));
    }

    #[test]
    fn min_referenced_epoch_spans_all_holders() {
        let mut m = FlightMachine::new(4);
        assert_eq!(m.min_referenced_epoch(), None);
        m.remember_incoming(3, 0).unwrap();
        m.backups.push(BackupHandle {
            epoch: 2,
            ..Default::default()
        });
        assert_eq!(m.min_referenced_epoch(), Some(2));
    }
}
