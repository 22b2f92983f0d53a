//! Handshake message reassembly and future-message buffering.
//!
//! Owns `1 + K` slots: slot 0 is the next expected handshake message,
//! slots `1..=K` buffer messages ahead of schedule. Fragments may arrive
//! out of order, duplicated or overlapping; overlapping bytes must agree.

use std::collections::VecDeque;

use crate::buffer::Buf;
use crate::epoch::EpochId;
use crate::error::{Error, Layer};
use crate::message::Fragment;

/// What feeding one fragment achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FeedOutcome {
    /// The next expected message is now complete.
    Available,
    /// Fragment stored, more are needed.
    NeedMore,
    /// Fragment belongs to an already-delivered sequence number.
    Old,
    /// Fragment lies beyond the buffering window and was dropped.
    Dropped,
}

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Empty,
    /// The whole message arrived in a single fragment; no bitmask needed.
    NoFragmentation { data: Buf },
    /// Partial fragments are being merged into an owned buffer.
    Window {
        data: Buf,
        bitmask: Vec<u8>,
        /// Distinct bytes received so far; the message is complete when
        /// this reaches the total length.
        received: usize,
    },
}

/// One reassembly slot: the state plus the message identity it must stay
/// consistent with across fragments.
#[derive(Debug, Default)]
struct Slot {
    state: SlotState,
    msg_type: u8,
    epoch: EpochId,
    total_len: usize,
}

impl Slot {
    fn is_empty(&self) -> bool {
        matches!(self.state, SlotState::Empty)
    }

    fn is_complete(&self) -> bool {
        match &self.state {
            SlotState::Empty => false,
            SlotState::NoFragmentation { .. } => true,
            SlotState::Window { received, .. } => *received == self.total_len,
        }
    }

    fn data(&self) -> Option<&[u8]> {
        match &self.state {
            SlotState::Empty => None,
            SlotState::NoFragmentation { data } => Some(data),
            SlotState::Window { data, .. } => Some(data),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Reassembly {
    slots: VecDeque<Slot>,
    next_seq: u16,
}

impl Reassembly {
    /// Create with `future_buffers` slots beyond the next-expected one,
    /// expecting `init_seq` as the first sequence number.
    pub fn new(future_buffers: usize, init_seq: u16) -> Self {
        let mut slots = VecDeque::with_capacity(1 + future_buffers);
        for _ in 0..1 + future_buffers {
            slots.push_back(Slot::default());
        }
        Reassembly {
            slots,
            next_seq: init_seq,
        }
    }

    pub fn next_seq(&self) -> u16 {
        self.next_seq
    }

    /// Feed one handshake fragment.
    pub fn feed(&mut self, frag: &Fragment<'_>, epoch: EpochId) -> Result<FeedOutcome, Error> {
        let h = frag.header;

        if h.message_seq < self.next_seq {
            return Ok(FeedOutcome::Old);
        }
        let offset = (h.message_seq - self.next_seq) as usize;
        if offset >= self.slots.len() {
            debug!(
                "Dropping fragment for seq {} beyond window [{}, {}]",
                h.message_seq,
                self.next_seq,
                self.next_seq as usize + self.slots.len() - 1
            );
            return Ok(FeedOutcome::Dropped);
        }

        let slot = &mut self.slots[offset];

        if slot.is_empty() {
            slot.msg_type = h.msg_type;
            slot.epoch = epoch;
            slot.total_len = h.length;

            let whole = h.fragment_offset == 0 && h.fragment_length == h.length;
            if offset == 0 && whole {
                slot.state = SlotState::NoFragmentation {
                    data: Buf::from(frag.body),
                };
                return Ok(FeedOutcome::Available);
            }

            // Partial fragment, or any fragment of a future message: set
            // up a reassembly window.
            slot.state = SlotState::Window {
                data: Buf::with_len(h.length),
                bitmask: vec![0; h.length.div_ceil(8)],
                received: 0,
            };
        } else {
            // All fragments of one message must agree on its identity.
            if slot.msg_type != h.msg_type || slot.epoch != epoch || slot.total_len != h.length {
                debug!(
                    "Fragment disagrees with buffered message {}: ({}, {}, {}) != ({}, {}, {})",
                    h.message_seq,
                    h.msg_type,
                    epoch,
                    h.length,
                    slot.msg_type,
                    slot.epoch,
                    slot.total_len
                );
                return Err(Error::InvalidRecord(Layer::Flight));
            }

            // A duplicate of a message received whole: upgrade to a
            // window so the overlap agreement check applies uniformly.
            if let SlotState::NoFragmentation { data } = &mut slot.state {
                let owned = std::mem::take(data);
                let received = owned.len();
                slot.state = SlotState::Window {
                    data: owned,
                    bitmask: vec![0xFF; h.length.div_ceil(8)],
                    received,
                };
            }
        }

        let SlotState::Window {
            data,
            bitmask,
            received,
        } = &mut slot.state
        else {
            return Err(Error::Internal(Layer::Flight, "slot not windowed"));
        };

        // Merge byte by byte: new bytes are recorded, previously received
        // bytes must match.
        for (i, byte) in frag.body.iter().enumerate() {
            let pos = h.fragment_offset + i;
            let mask = 1u8 << (pos % 8);
            if bitmask[pos / 8] & mask != 0 {
                if data[pos] != *byte {
                    debug!("Overlapping fragment bytes disagree at {}", pos);
                    return Err(Error::InvalidRecord(Layer::Flight));
                }
            } else {
                bitmask[pos / 8] |= mask;
                data[pos] = *byte;
                *received += 1;
            }
        }

        if offset == 0 && slot.is_complete() {
            Ok(FeedOutcome::Available)
        } else {
            Ok(FeedOutcome::NeedMore)
        }
    }

    /// The next expected message, if complete: `(type, epoch, bytes)`.
    pub fn available(&self) -> Option<(u8, EpochId, &[u8])> {
        let slot = self.slots.front()?;
        if !slot.is_complete() {
            return None;
        }
        Some((slot.msg_type, slot.epoch, slot.data()?))
    }

    /// Consume the completed front message: shift every slot down one and
    /// advance the expected sequence number. Returns `true` if the new
    /// front message is already complete.
    pub fn advance(&mut self) -> Result<bool, Error> {
        let front = self
            .slots
            .front()
            .ok_or(Error::Internal(Layer::Flight, "no reassembly slots"))?;
        if !front.is_complete() {
            return Err(Error::Internal(Layer::Flight, "advance on incomplete slot"));
        }

        self.slots.pop_front();
        self.slots.push_back(Slot::default());

        self.next_seq = self.next_seq.checked_add(1).ok_or(Error::CounterWrap)?;

        Ok(self.slots.front().map(|s| s.is_complete()).unwrap_or(false))
    }

    /// Drop all buffered future messages. Called at flight boundaries; a
    /// peer racing ahead of the flight structure loses its early messages
    /// and must retransmit them.
    pub fn forget_future(&mut self) {
        let dropped = self.slots.iter().skip(1).filter(|s| !s.is_empty()).count();
        if dropped > 0 {
            debug!("Dropping {} buffered future message(s) at flight end", dropped);
        }
        for slot in self.slots.iter_mut().skip(1) {
            *slot = Slot::default();
        }
    }

    /// Reset completely, expecting `init_seq` next.
    pub fn reset(&mut self, init_seq: u16) {
        for slot in self.slots.iter_mut() {
            *slot = Slot::default();
        }
        self.next_seq = init_seq;
    }

    /// The smallest epoch id still referenced by a buffered message.
    pub fn min_referenced_epoch(&self) -> Option<EpochId> {
        self.slots
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.epoch)
            .min()
    }
}
