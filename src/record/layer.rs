//! L2: the record layer engine.
//!
//! Consumes raw transport bytes and produces decrypted record payloads keyed
//! by epoch; frames, protects and coalesces outgoing records. Outbound
//! messages of the same content type and epoch are merged into one record up
//! to the configured maximum payload, and multiple records share a datagram
//! where the MTU allows.

use std::collections::VecDeque;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::buffer::{Buf, BufferPool};
use crate::config::Config;
use crate::epoch::{EpochId, EpochSlot, Transform};
use crate::error::{Error, Layer};
use crate::record::{record_aad, ContentType, ProtocolVersion, Record, Sequence};
use crate::transport::Transport;
use crate::Mode;

/// Metadata of the record backing the currently open read.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpenRecord {
    pub content_type: ContentType,
    pub sequence: Sequence,
}

/// The record currently being assembled on the write side.
#[derive(Debug)]
struct TxRecord {
    content_type: ContentType,
    epoch: EpochId,
    payload: Buf,
    /// Payload bytes this record may still take.
    capacity: usize,
}

pub(crate) struct RecordLayer {
    mode: Mode,
    config: Arc<Config>,
    pool: BufferPool,

    epochs: SmallVec<[EpochSlot; 4]>,
    next_epoch_id: EpochId,
    active_read: Option<EpochId>,
    active_write: Option<EpochId>,

    /// Raw incoming bytes: one datagram at a time in datagram mode, the
    /// growing receive buffer in stream mode.
    rx_raw: Buf,
    /// Parse position within `rx_raw`.
    rx_pos: usize,
    /// Decrypted payload of the currently open record.
    rx_plain: Buf,
    rx_open: Option<OpenRecord>,

    tx_open: Option<TxRecord>,
    /// The datagram under assembly (or the stream send buffer).
    tx_datagram: Buf,
    /// Finished datagrams awaiting the transport.
    queue_tx: VecDeque<Buf>,
    /// Sequence to force onto the next opened record.
    forced_seq: Option<Sequence>,
}

impl RecordLayer {
    pub fn new(config: Arc<Config>) -> Self {
        RecordLayer {
            mode: config.mode(),
            config,
            pool: BufferPool::default(),
            epochs: SmallVec::new(),
            next_epoch_id: 0,
            active_read: None,
            active_write: None,
            rx_raw: Buf::new(),
            rx_pos: 0,
            rx_plain: Buf::new(),
            rx_open: None,
            tx_open: None,
            tx_datagram: Buf::new(),
            queue_tx: VecDeque::new(),
            forced_seq: None,
        }
    }

    /*
     * Epoch management
     */

    pub fn register_epoch(&mut self, transform: Transform) -> Result<EpochId, Error> {
        let id = self.next_epoch_id;
        self.next_epoch_id = self
            .next_epoch_id
            .checked_add(1)
            .ok_or(Error::CounterWrap)?;
        self.epochs.push(EpochSlot::new(id, transform));
        debug!("Registered epoch {}", id);
        Ok(id)
    }

    pub fn activate_read_epoch(&mut self, id: EpochId) -> Result<(), Error> {
        self.slot(id)?;
        debug!("Activate read epoch {}", id);
        self.active_read = Some(id);
        Ok(())
    }

    pub fn activate_write_epoch(&mut self, id: EpochId) -> Result<(), Error> {
        self.slot(id)?;
        debug!("Activate write epoch {}", id);
        self.active_write = Some(id);
        Ok(())
    }

    pub fn active_read_epoch(&self) -> Option<EpochId> {
        self.active_read
    }

    pub fn active_write_epoch(&self) -> Option<EpochId> {
        self.active_write
    }

    pub fn is_registered(&self, id: EpochId) -> bool {
        self.epochs.iter().any(|s| s.id == id)
    }

    /// Drop epochs strictly older than every active direction and every
    /// buffered reference. `min_referenced` is the smallest epoch id still
    /// referenced by buffered messages or retransmission backups.
    pub fn purge_epochs(&mut self, min_referenced: Option<EpochId>) {
        let Some(read) = self.active_read else { return };
        let Some(write) = self.active_write else { return };

        let mut keep_from = read.min(write);
        if let Some(m) = min_referenced {
            keep_from = keep_from.min(m);
        }

        self.epochs.retain(|s| {
            if s.id >= keep_from {
                return true;
            }
            debug!("Purging epoch {}", s.id);
            false
        });
    }

    fn slot(&mut self, id: EpochId) -> Result<&mut EpochSlot, Error> {
        self.epochs
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(Error::BadInput("epoch not registered"))
    }

    /*
     * Read side
     */

    /// Pull the next record off the wire, authenticate and decrypt it.
    ///
    /// In datagram mode, malformed records, unknown epochs, replayed
    /// sequence numbers and authentication failures discard the offending
    /// record silently and scanning continues with the next record (or the
    /// next datagram). In stream mode any of these is fatal.
    pub fn open_read(&mut self, transport: &mut dyn Transport) -> Result<OpenRecord, Error> {
        if self.rx_open.is_some() {
            return Err(Error::Internal(Layer::Record, "read already open"));
        }

        loop {
            match self.mode {
                Mode::Datagram => {
                    if self.rx_pos >= self.rx_raw.len() {
                        self.recv_datagram(transport)?;
                    }
                    if let Some(open) = self.next_datagram_record()? {
                        return Ok(open);
                    }
                }
                Mode::Stream => {
                    if let Some(open) = self.next_stream_record()? {
                        return Ok(open);
                    }
                    self.recv_stream(transport)?;
                }
            }
        }
    }

    /// The decrypted payload of the record opened by
    /// [`RecordLayer::open_read`].
    pub fn payload(&self) -> &[u8] {
        &self.rx_plain
    }

    pub fn open_record(&self) -> Option<OpenRecord> {
        self.rx_open
    }

    /// Release the currently open record.
    pub fn consume_read(&mut self) {
        self.rx_open = None;
        let buf = std::mem::take(&mut self.rx_plain);
        self.pool.put(buf);
    }

    fn recv_datagram(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        let mut buf = std::mem::take(&mut self.rx_raw);
        buf.clear();
        buf.resize(self.config.mtu().max(2048), 0);

        match transport.recv(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                self.rx_raw = buf;
                self.rx_pos = 0;
                Ok(())
            }
            Err(e) => {
                buf.clear();
                self.rx_raw = buf;
                self.rx_pos = 0;
                Err(e)
            }
        }
    }

    /// Parse, validate and decrypt the record at `rx_pos`. Returns `None`
    /// when the record was discarded and scanning should continue.
    fn next_datagram_record(&mut self) -> Result<Option<OpenRecord>, Error> {
        let input = &self.rx_raw[self.rx_pos..];

        let (rest, record) = match Record::parse(input) {
            Ok(ok) => ok,
            Err(_) => {
                debug!("Dropping undecodable datagram tail ({} bytes)", input.len());
                self.rx_pos = self.rx_raw.len();
                return Ok(None);
            }
        };
        let consumed = input.len() - rest.len();
        self.rx_pos += consumed;

        let sequence = record.sequence;
        let content_type = record.content_type;
        let version = record.version;

        if matches!(content_type, ContentType::Unknown(_)) {
            debug!("Dropping record with unknown content type at {}", sequence);
            return Ok(None);
        }

        let overhead;
        {
            let Some(slot) = self.epochs.iter().find(|s| s.id == sequence.epoch) else {
                debug!("Dropping record for unregistered epoch {}", sequence.epoch);
                return Ok(None);
            };
            if !slot.replay.check(sequence.number) {
                debug!("Dropping replayed record {}", sequence);
                return Ok(None);
            }
            overhead = slot.transform.overhead();
        }

        if record.payload.len() < overhead {
            debug!("Dropping short record {}", sequence);
            return Ok(None);
        }
        let plaintext_len = (record.payload.len() - overhead) as u16;

        let mut plain = self.pool.take();
        plain.extend_from_slice(record.payload);

        let (aad, aad_len) = record_aad(self.mode, content_type, version, sequence, plaintext_len);

        let slot = self
            .epochs
            .iter_mut()
            .find(|s| s.id == sequence.epoch)
            .expect("epoch checked above");

        if slot
            .transform
            .open(sequence.to_wire(), &aad[..aad_len], &mut plain)
            .is_err()
        {
            debug!("Dropping record failing authentication {}", sequence);
            self.pool.put(plain);
            return Ok(None);
        }

        // Only authenticated records may advance the replay window.
        slot.replay.update(sequence.number);

        self.rx_plain = plain;
        let open = OpenRecord {
            content_type,
            sequence,
        };
        self.rx_open = Some(open);

        trace!("Opened record {} ({:?})", sequence, content_type);
        Ok(Some(open))
    }

    /// Try to cut one full record out of the stream buffer. Failures are
    /// fatal in stream mode.
    fn next_stream_record(&mut self) -> Result<Option<OpenRecord>, Error> {
        let avail = &self.rx_raw[self.rx_pos..];
        if avail.len() < Record::STREAM_HEADER_LEN {
            return Ok(None);
        }

        let content_type = ContentType::from_u8(avail[0]);
        let version = ProtocolVersion::from_u16(u16::from_be_bytes([avail[1], avail[2]]));
        let length = u16::from_be_bytes([avail[3], avail[4]]) as usize;

        if matches!(content_type, ContentType::Unknown(_)) {
            return Err(Error::InvalidRecord(Layer::Record));
        }
        if avail.len() < Record::STREAM_HEADER_LEN + length {
            return Ok(None);
        }

        let epoch_id = self
            .active_read
            .ok_or(Error::BadInput("no read epoch active"))?;
        let slot = self
            .epochs
            .iter_mut()
            .find(|s| s.id == epoch_id)
            .ok_or(Error::Internal(Layer::Record, "active epoch missing"))?;

        let overhead = slot.transform.overhead();
        if length < overhead {
            return Err(Error::InvalidRecord(Layer::Record));
        }
        let plaintext_len = (length - overhead) as u16;

        let sequence = Sequence {
            epoch: epoch_id,
            number: slot.next_read_seq,
        };

        let mut plain = self.pool.take();
        plain.extend_from_slice(
            &avail[Record::STREAM_HEADER_LEN..Record::STREAM_HEADER_LEN + length],
        );

        let (aad, aad_len) = record_aad(self.mode, content_type, version, sequence, plaintext_len);

        if slot
            .transform
            .open(sequence.to_wire(), &aad[..aad_len], &mut plain)
            .is_err()
        {
            self.pool.put(plain);
            return Err(Error::InvalidRecord(Layer::Record));
        }

        slot.next_read_seq = slot
            .next_read_seq
            .checked_add(1)
            .ok_or(Error::CounterWrap)?;

        self.rx_pos += Record::STREAM_HEADER_LEN + length;
        // Drop consumed bytes once the buffer has no unread data left.
        if self.rx_pos == self.rx_raw.len() {
            self.rx_raw.clear();
            self.rx_pos = 0;
        }

        self.rx_plain = plain;
        let open = OpenRecord {
            content_type,
            sequence,
        };
        self.rx_open = Some(open);
        Ok(Some(open))
    }

    fn recv_stream(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        let mut chunk = self.pool.take();
        chunk.resize(4096, 0);
        let res = transport.recv(&mut chunk);
        match res {
            Ok(0) => {
                self.pool.put(chunk);
                Err(Error::WantRead)
            }
            Ok(n) => {
                self.rx_raw.extend_from_slice(&chunk[..n]);
                self.pool.put(chunk);
                Ok(())
            }
            Err(e) => {
                self.pool.put(chunk);
                Err(e)
            }
        }
    }

    /*
     * Write side
     */

    /// Open (or extend) the outgoing record region for `content_type`
    /// under `epoch`. Returns the payload capacity still available in the
    /// open record.
    ///
    /// Messages of the same content type and epoch merge into the open
    /// record; a type or epoch change, or a forced sequence number, seals
    /// the open record and starts a fresh one.
    pub fn open_write(
        &mut self,
        content_type: ContentType,
        epoch: EpochId,
    ) -> Result<usize, Error> {
        if !self.is_registered(epoch) {
            return Err(Error::BadInput("epoch not registered"));
        }

        // Only handshake and application data coalesce; CCS and alert
        // payloads have exact-size invariants on the read side.
        let merge_type = matches!(
            content_type,
            ContentType::Handshake | ContentType::ApplicationData
        );
        let mergeable = merge_type
            && self.forced_seq.is_none()
            && self
                .tx_open
                .as_ref()
                .map(|r| r.content_type == content_type && r.epoch == epoch && r.capacity > 0)
                .unwrap_or(false);

        if !mergeable {
            self.seal_open_record()?;

            let overhead = {
                let slot = self.slot(epoch)?;
                slot.transform.overhead()
            };
            let capacity = self.fresh_record_capacity(overhead);
            if capacity == 0 {
                // Neither the current nor a fresh datagram has room, the
                // queue must drain first.
                return Err(Error::WantWrite);
            }

            self.tx_open = Some(TxRecord {
                content_type,
                epoch,
                payload: self.pool.take(),
                capacity,
            });
        }

        // Open record known present here.
        Ok(self.tx_open.as_ref().unwrap().capacity)
    }

    /// Payload buffer of the open record. Callers must respect the
    /// capacity returned from [`RecordLayer::open_write`].
    pub fn tx_payload_mut(&mut self) -> Result<&mut Buf, Error> {
        self.tx_open
            .as_mut()
            .map(|r| &mut r.payload)
            .ok_or(Error::Internal(Layer::Record, "no open write record"))
    }

    /// Note `written` payload bytes as consumed from the open record's
    /// capacity.
    pub fn tx_advance(&mut self, written: usize) -> Result<(), Error> {
        let r = self
            .tx_open
            .as_mut()
            .ok_or(Error::Internal(Layer::Record, "no open write record"))?;
        if written > r.capacity {
            return Err(Error::Internal(Layer::Record, "record capacity overrun"));
        }
        r.capacity -= written;
        Ok(())
    }

    /// Close the open record region: protect it and place it into the
    /// current datagram, opening a new datagram when the current one lacks
    /// space.
    pub fn dispatch_write(&mut self) -> Result<(), Error> {
        self.seal_open_record()
    }

    /// Force the 48-bit counter of `sequence` onto the next opened record.
    pub fn force_sequence(&mut self, sequence: Sequence) {
        self.forced_seq = Some(sequence);
    }

    /// Seal the open record and close the datagram under assembly, so the
    /// next record starts on a fresh datagram.
    pub fn break_datagram(&mut self) -> Result<(), Error> {
        self.seal_open_record()?;
        self.finish_datagram();
        Ok(())
    }

    /// Hand every prepared datagram to the transport.
    ///
    /// Returns `WantWrite` while the transport blocks; prepared data is
    /// retained and re-offered on the next call.
    pub fn flush(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        self.seal_open_record()?;
        self.finish_datagram();

        while let Some(front) = self.queue_tx.front() {
            match self.mode {
                Mode::Datagram => {
                    let n = transport.send(front)?;
                    if n != front.len() {
                        return Err(Error::Internal(Layer::Transport, "partial datagram send"));
                    }
                    let sent = self.queue_tx.pop_front().unwrap();
                    self.pool.put(sent);
                }
                Mode::Stream => {
                    let n = transport.send(front)?;
                    if n == front.len() {
                        let sent = self.queue_tx.pop_front().unwrap();
                        self.pool.put(sent);
                    } else {
                        self.queue_tx.front_mut().unwrap().drain(..n);
                    }
                }
            }
        }

        Ok(())
    }

    /// True if prepared output is still waiting for the transport.
    pub fn has_pending_output(&self) -> bool {
        !self.queue_tx.is_empty() || !self.tx_datagram.is_empty() || self.tx_open.is_some()
    }

    /// Payload capacity of a record opened now, given AEAD `overhead`.
    fn fresh_record_capacity(&self, overhead: usize) -> usize {
        let header = match self.mode {
            Mode::Datagram => Record::DATAGRAM_HEADER_LEN,
            Mode::Stream => Record::STREAM_HEADER_LEN,
        };
        let fixed = header + overhead;

        let room = match self.mode {
            // Prefer the current datagram; fall back to a fresh one,
            // which the transmit queue must have room for.
            Mode::Datagram => {
                let in_current = self.config.mtu().saturating_sub(self.tx_datagram.len());
                if !self.tx_datagram.is_empty() && in_current > fixed {
                    in_current - fixed
                } else if self.queue_tx.len() >= self.config.max_queue_tx() {
                    0
                } else {
                    self.config.mtu().saturating_sub(fixed)
                }
            }
            Mode::Stream => usize::MAX,
        };

        room.min(self.config.max_record_payload())
    }

    /// Protect the open record (if any) and serialize it into the current
    /// datagram.
    fn seal_open_record(&mut self) -> Result<(), Error> {
        let Some(rec) = self.tx_open.take() else {
            return Ok(());
        };
        let TxRecord {
            content_type,
            epoch,
            mut payload,
            ..
        } = rec;

        let plaintext_len = payload.len() as u16;
        let mode = self.mode;
        let version = match mode {
            Mode::Datagram => ProtocolVersion::Dtls1_2,
            Mode::Stream => ProtocolVersion::Tls1_2,
        };

        let forced = self.forced_seq.take();
        let slot = self.slot(epoch)?;

        let number = match forced {
            Some(f) => {
                // Keep write-side monotonicity for subsequent records.
                slot.next_seq = slot.next_seq.max(f.number + 1);
                f.number
            }
            None => {
                let n = slot.next_seq;
                if n >= 1 << 48 {
                    return Err(Error::CounterWrap);
                }
                slot.next_seq += 1;
                n
            }
        };

        let sequence = Sequence { epoch, number };
        let (aad, aad_len) = record_aad(mode, content_type, version, sequence, plaintext_len);
        slot.transform
            .seal(sequence.to_wire(), &aad[..aad_len], &mut payload)
            .map_err(|_| Error::Internal(Layer::Record, "seal failed"))?;

        trace!(
            "Sealed record {} ({:?}, {} bytes plaintext)",
            sequence,
            content_type,
            plaintext_len
        );

        let wire_len = match self.mode {
            Mode::Datagram => Record::DATAGRAM_HEADER_LEN + payload.len(),
            Mode::Stream => Record::STREAM_HEADER_LEN + payload.len(),
        };

        if self.mode == Mode::Datagram && self.tx_datagram.len() + wire_len > self.config.mtu() {
            self.finish_datagram();
        }

        match self.mode {
            Mode::Datagram => {
                let record = Record {
                    content_type,
                    version,
                    sequence,
                    payload: &payload,
                };
                record.serialize(&mut self.tx_datagram);
            }
            Mode::Stream => {
                self.tx_datagram.push(content_type.as_u8());
                version.serialize(&mut self.tx_datagram);
                self.tx_datagram
                    .extend_from_slice(&(payload.len() as u16).to_be_bytes());
                self.tx_datagram.extend_from_slice(&payload);
            }
        }

        self.pool.put(payload);
        Ok(())
    }

    /// Move the datagram under assembly to the transmit queue.
    fn finish_datagram(&mut self) {
        if self.tx_datagram.is_empty() {
            return;
        }
        let full = std::mem::replace(&mut self.tx_datagram, self.pool.take());
        self.queue_tx.push_back(full);
    }
}

impl std::fmt::Debug for RecordLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Metadata only; payloads may hold plaintext.
        f.debug_struct("RecordLayer")
            .field("mode", &self.mode)
            .field("epochs", &self.epochs.len())
            .field("active_read", &self.active_read)
            .field("active_write", &self.active_write)
            .field("rx_buffered", &(self.rx_raw.len() - self.rx_pos))
            .field("tx_open", &self.tx_open.is_some())
            .field("queue_tx", &self.queue_tx.len())
            .finish()
    }
}
