//! The user-facing MPS context.
//!
//! [`Mps`] ties the pipeline together: transport adapter, record layer,
//! message demux and (in datagram mode) the flight machine. The surface is
//! a small set of read/write primitives returning lazy [`Reader`] /
//! [`Writer`] handles onto the current message; `WantRead`/`WantWrite`
//! report backpressure, everything else is recorded and blocks the context.

use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::buffer::Buf;
use crate::config::Config;
use crate::epoch::{EpochId, Transform};
use crate::error::{BlockReason, BlockingInfo, Error, Layer};
use crate::flight::{
    BackupHandle, BackupPayload, FlightMachine, FlightState, MsgFlags, Retransmit, RetransmitState,
};
use crate::message::{check_ccs, split_fragments, Alert, AlertDescription, AlertLevel, MsgType};
use crate::message::{Fragment, HandshakeHeader};
use crate::reader::{Reader, ReaderState};
use crate::record::{ContentType, RecordLayer, Sequence};
use crate::timer::{Backoff, Timer, TimerState};
use crate::transport::{Dependencies, Mode, Transport};
use crate::writer::{Writer, WriterState};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Both directions usable.
    Open,
    /// The peer closed its writing side; we may still send.
    WriteOnly,
    /// We closed our writing side; the peer may still send.
    ReadOnly,
    /// Both directions closed.
    Closed,
    /// Terminal error state; see [`Mps::error_state`].
    Blocked,
}

/// Parameters for starting an outgoing handshake message.
#[derive(Debug, Default)]
pub struct HandshakeOut {
    /// Handshake message type, opaque to the stack.
    pub msg_type: u8,
    /// Total message length, or `None` if only known at write time. With
    /// an unknown length the message must fit a single record and the
    /// write cannot be paused.
    pub length: Option<usize>,
    /// How to reproduce the message on retransmission.
    pub retransmit: Retransmit,
}

/// An incoming handshake message handed to the user.
#[derive(Debug)]
pub struct HandshakeIn<'a> {
    /// Handshake message type, opaque to the stack.
    pub msg_type: u8,
    /// Total message length.
    pub length: usize,
    /// Streaming access to the message body.
    pub reader: Reader<'a>,
    /// Additional bytes that belong in transcript checksums: the
    /// handshake sequence number in datagram mode, empty in stream mode.
    pub additional: ArrayVec<u8, 8>,
}

/// The currently open inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InMsg {
    Handshake,
    Application,
    Alert(AlertDescription),
    Ccs,
}

impl InMsg {
    fn msg_type(&self) -> MsgType {
        match self {
            InMsg::Handshake => MsgType::Handshake,
            InMsg::Application => MsgType::ApplicationData,
            InMsg::Alert(_) => MsgType::Alert,
            InMsg::Ccs => MsgType::ChangeCipherSpec,
        }
    }
}

/// The currently open outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutMsg {
    Handshake,
    Application,
    Alert,
    Ccs,
}

/// An outgoing handshake message under construction.
struct PendingHs {
    msg_type: u8,
    seq: u16,
    epoch: EpochId,
    declared: Option<usize>,
    retransmit: Retransmit,
    buf: Buf,
    wstate: WriterState,
    paused: bool,
}

/// The message processing stack context.
pub struct Mps {
    config: Arc<Config>,
    transport: Box<dyn Transport>,
    timer: Box<dyn Timer>,

    record: RecordLayer,
    dtls: FlightMachine,
    backoff: Backoff,

    conn: ConnectionState,
    blocking: BlockingInfo,
    alert_pending: Option<Alert>,
    flush_pending: bool,

    in_state: Option<InMsg>,
    out_state: Option<OutMsg>,
    rd_state: ReaderState,
    wr_state: WriterState,
    pending_hs: Option<PendingHs>,
    hs_read_paused: bool,

    /// Stream-mode handshake currently being delivered (may span records).
    stream_hs: Option<HandshakeHeader>,
    /// Consumed offset into the open record payload (stream mode).
    stream_pos: usize,
    /// Stream-mode handshake header bytes split across records.
    hdr_partial: Buf,

    /// Wire sequence of the record backing the open inbound message. For
    /// reassembled messages this is the record that completed them.
    last_rx_seq: Option<[u8; 8]>,

    read_deps: Dependencies,
    write_deps: Dependencies,
}

impl Mps {
    /// Create a context over the given transport and timer.
    pub fn new(config: Arc<Config>, transport: Box<dyn Transport>, timer: Box<dyn Timer>) -> Mps {
        let record = RecordLayer::new(config.clone());
        let dtls = FlightMachine::new(config.future_message_buffers());
        let backoff = Backoff::new(
            config.retransmit_timeout_min(),
            config.retransmit_timeout_max(),
        );

        Mps {
            config,
            transport,
            timer,
            record,
            dtls,
            backoff,
            conn: ConnectionState::Open,
            blocking: BlockingInfo::default(),
            alert_pending: None,
            flush_pending: false,
            in_state: None,
            out_state: None,
            rd_state: ReaderState::default(),
            wr_state: WriterState::default(),
            pending_hs: None,
            hs_read_paused: false,
            stream_hs: None,
            stream_pos: 0,
            hdr_partial: Buf::new(),
            last_rx_seq: None,
            read_deps: Dependencies::default(),
            write_deps: Dependencies::default(),
        }
    }

    /// Replace the underlying transport.
    pub fn set_bio(&mut self, transport: Box<dyn Transport>) {
        self.transport = transport;
    }

    /*
     * Epochs
     */

    /// Register a new set of record-protection parameters. Ownership of
    /// the transform moves to the stack.
    pub fn register_epoch(&mut self, transform: Transform) -> Result<EpochId, Error> {
        self.guarded(|mps| mps.record.register_epoch(transform))
    }

    /// Use `epoch` for all subsequent reads. Takes effect on the next
    /// record opened, never retroactively.
    pub fn activate_read_epoch(&mut self, epoch: EpochId) -> Result<(), Error> {
        self.guarded(|mps| {
            mps.record.activate_read_epoch(epoch)?;
            mps.purge_epochs();
            Ok(())
        })
    }

    /// Use `epoch` for all subsequent writes. Records already prepared
    /// but not yet flushed keep their original protection.
    pub fn activate_write_epoch(&mut self, epoch: EpochId) -> Result<(), Error> {
        self.guarded(|mps| {
            mps.record.activate_write_epoch(epoch)?;
            mps.purge_epochs();
            Ok(())
        })
    }

    /*
     * Read interface
     */

    /// Attempt to fetch the next inbound message. On success, query the
    /// contents with the matching `read_*` accessor, then finish with
    /// [`Mps::read_consume`].
    pub fn read(&mut self) -> Result<MsgType, Error> {
        match self.read_inner() {
            Ok(t) => Ok(t),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn read_inner(&mut self) -> Result<MsgType, Error> {
        self.check_readable()?;

        if let Some(m) = self.in_state {
            return Ok(m.msg_type());
        }
        if self.out_state.is_some() {
            return Err(Error::BadInput("read while a write is open"));
        }
        if self.pending_hs.as_ref().map(|p| p.paused).unwrap_or(false) {
            return Err(Error::BadInput("read while a handshake write is paused"));
        }

        self.clear_pending()?;

        if self.config.mode() == Mode::Datagram {
            self.poll_timer()?;

            // A message may already be waiting: buffered reassembly
            // output, a paused read, or one held back for an epoch the
            // user had not activated yet.
            if let Some(t) = self.try_deliver_handshake() {
                return Ok(t);
            }
        }

        loop {
            let open = match self.record.open_record() {
                Some(o) => o,
                None => match self.record.open_read(self.transport.as_mut()) {
                    Ok(o) => o,
                    Err(Error::WantRead) => {
                        self.read_deps.insert(Dependencies::TRANSPORT_READ);
                        return Err(Error::WantRead);
                    }
                    Err(e) => return Err(e),
                },
            };

            self.read_deps.clear();

            if let Some(t) = self.process_record(open)? {
                return Ok(t);
            }
        }
    }

    /// Report the type of the currently open inbound message without
    /// doing any processing.
    pub fn read_check(&self) -> Result<Option<MsgType>, Error> {
        self.check_readable()?;
        Ok(self.in_state.map(|m| m.msg_type()))
    }

    /// Access the pending handshake message.
    pub fn read_handshake(&mut self) -> Result<HandshakeIn<'_>, Error> {
        if let Err(e) = self.check_read_handshake() {
            return Err(self.fail(e));
        }

        match self.config.mode() {
            Mode::Datagram => {
                let seq = self.dtls.reassembly.next_seq();
                let mut additional = ArrayVec::new();
                additional.extend(seq.to_be_bytes());

                let Some((msg_type, _, data)) = self.dtls.reassembly.available() else {
                    return Err(Error::Internal(Layer::Flight, "handshake vanished"));
                };
                Ok(HandshakeIn {
                    msg_type,
                    length: data.len(),
                    reader: Reader::new(data, &mut self.rd_state),
                    additional,
                })
            }
            Mode::Stream => {
                let Some(header) = self.stream_hs else {
                    return Err(Error::Internal(Layer::Message, "handshake vanished"));
                };
                let pos = self.stream_pos;
                let remaining_in_msg = header.length - self.rd_state.base;

                let payload = self.record.payload();
                let avail = (payload.len() - pos).min(remaining_in_msg);
                let data = &payload[pos..pos + avail];

                Ok(HandshakeIn {
                    msg_type: header.msg_type,
                    length: header.length,
                    reader: Reader::new(data, &mut self.rd_state),
                    additional: ArrayVec::new(),
                })
            }
        }
    }

    fn check_read_handshake(&self) -> Result<(), Error> {
        self.check_readable()?;
        if self.in_state != Some(InMsg::Handshake) {
            return Err(Error::BadInput("no handshake message open"));
        }
        Ok(())
    }

    /// Access the pending application data message.
    pub fn read_application(&mut self) -> Result<Reader<'_>, Error> {
        if let Err(e) = self.check_read_application() {
            return Err(self.fail(e));
        }
        let Self {
            record, rd_state, ..
        } = self;
        Ok(Reader::new(record.payload(), rd_state))
    }

    fn check_read_application(&self) -> Result<(), Error> {
        self.check_readable()?;
        if self.in_state != Some(InMsg::Application) {
            return Err(Error::BadInput("no application message open"));
        }
        Ok(())
    }

    /// The type of the pending (non-fatal) alert.
    pub fn read_alert(&self) -> Result<AlertDescription, Error> {
        self.check_readable()?;
        match self.in_state {
            Some(InMsg::Alert(d)) => Ok(d),
            _ => Err(Error::BadInput("no alert open")),
        }
    }

    /// Declare which position the just-read message occupies in the
    /// incoming flight.
    pub fn read_set_flags(&mut self, flags: MsgFlags) -> Result<(), Error> {
        self.guarded(|mps| {
            if mps.config.mode() != Mode::Datagram {
                return Err(Error::BadInput("flags are datagram-only"));
            }
            if mps.in_state.is_none() {
                return Err(Error::BadInput("no message open"));
            }
            mps.dtls.in_flags = flags;
            Ok(())
        })
    }

    /// Pause reading the current handshake message; the reader state is
    /// handed back on the next delivery of the same message.
    pub fn read_pause(&mut self) -> Result<(), Error> {
        self.guarded(|mps| {
            if mps.in_state != Some(InMsg::Handshake) {
                return Err(Error::BadInput("no handshake message open"));
            }
            match mps.config.mode() {
                Mode::Datagram => {
                    mps.hs_read_paused = true;
                }
                Mode::Stream => {
                    mps.stream_hs_window_done();
                }
            }
            mps.in_state = None;
            Ok(())
        })
    }

    /// Conclude the reading of the current message.
    pub fn read_consume(&mut self) -> Result<(), Error> {
        self.guarded(Self::read_consume_inner)
    }

    fn read_consume_inner(&mut self) -> Result<(), Error> {
        match self.in_state {
            None => return Err(Error::BadInput("no message open")),
            Some(InMsg::Handshake) => match self.config.mode() {
                Mode::Datagram => self.consume_handshake_datagram()?,
                Mode::Stream => self.consume_handshake_stream()?,
            },
            Some(InMsg::Application) => {
                self.record.consume_read();
            }
            // Alerts and CCS records were consumed during read().
            Some(InMsg::Alert(_)) | Some(InMsg::Ccs) => {}
        }
        self.in_state = None;
        self.last_rx_seq = None;
        Ok(())
    }

    /// External conditions that would allow a blocked read to progress.
    pub fn read_dependencies(&self) -> Dependencies {
        let mut deps = self.read_deps;
        if self.flush_pending {
            deps.insert(Dependencies::TRANSPORT_WRITE);
        }
        deps
    }

    /// External conditions that would allow a blocked write to progress.
    pub fn write_dependencies(&self) -> Dependencies {
        self.write_deps
    }

    /*
     * Sequence number abstraction break
     */

    /// The 8-byte wire sequence (epoch plus counter) of the record
    /// backing the currently open read.
    ///
    /// Only exists to let a HelloVerifyRequest reuse the sequence number
    /// of the ClientHello it answers; avoid for anything else.
    pub fn get_sequence_number(&self) -> Result<[u8; 8], Error> {
        self.check_readable()?;
        if self.in_state.is_none() {
            return Err(Error::BadInput("no message open"));
        }
        self.last_rx_seq.ok_or(Error::BadInput("no record open"))
    }

    /// Force the wire sequence counter of the next outgoing record. The
    /// next write always starts a fresh record.
    ///
    /// Counterpart of [`Mps::get_sequence_number`]; same warning applies.
    pub fn force_sequence_number(&mut self, seq: [u8; 8]) -> Result<(), Error> {
        self.guarded(|mps| {
            mps.record.force_sequence(Sequence::from_wire(seq));
            Ok(())
        })
    }

    /*
     * Write interface
     */

    /// Start writing a handshake message, or continue a paused one (same
    /// type and length).
    pub fn write_handshake(&mut self, out: HandshakeOut) -> Result<Writer<'_>, Error> {
        if let Err(e) = self.prep_write_handshake(out) {
            return Err(self.fail(e));
        }
        let Some(p) = self.pending_hs.as_mut() else {
            return Err(Error::Internal(Layer::Flight, "pending handshake missing"));
        };
        let PendingHs { buf, wstate, .. } = p;
        Ok(Writer::new(buf, wstate))
    }

    fn prep_write_handshake(&mut self, out: HandshakeOut) -> Result<(), Error> {
        self.prepare_write(true)?;

        if self.config.mode() == Mode::Datagram {
            self.begin_flight_if_needed()?;
        }

        // Continuation of a paused message?
        if let Some(p) = self.pending_hs.as_mut() {
            if !p.paused {
                return Err(Error::Internal(Layer::Flight, "unpaused pending handshake"));
            }
            if p.msg_type != out.msg_type || p.declared != out.length {
                return Err(Error::BadInput("continuation does not match paused message"));
            }
            p.paused = false;
            self.out_state = Some(OutMsg::Handshake);
            return Ok(());
        }

        let epoch = self
            .record
            .active_write_epoch()
            .ok_or(Error::BadInput("no write epoch active"))?;

        if self.config.mode() == Mode::Datagram {
            if self.dtls.backups.len() >= self.config.max_flight_length() {
                return Err(Error::FlightTooLong);
            }
            if self.dtls.out_seq == u16::MAX {
                return Err(Error::CounterWrap);
            }
        }

        if let Some(l) = out.length {
            if l > self.config.max_handshake_len() {
                return Err(Error::BadInput("handshake message too long"));
            }
        }

        // With a declared length the user writes the whole message into
        // its backing buffer and dispatch fragments it. Without one,
        // fragmentation is impossible (fragment headers carry the total
        // length), so the message must fit a single record.
        let limit = match out.length {
            Some(l) => l,
            None => self
                .config
                .max_record_payload()
                .saturating_sub(HandshakeHeader::DATAGRAM_LEN)
                .min(self.config.max_handshake_len()),
        };

        self.pending_hs = Some(PendingHs {
            msg_type: out.msg_type,
            seq: self.dtls.out_seq,
            epoch,
            declared: out.length,
            retransmit: out.retransmit,
            buf: Buf::new(),
            wstate: WriterState::start(0, limit, out.length),
            paused: false,
        });
        self.out_state = Some(OutMsg::Handshake);
        Ok(())
    }

    /// Start writing application data into the current record region.
    pub fn write_application(&mut self) -> Result<Writer<'_>, Error> {
        if let Err(e) = self.prep_write_application() {
            return Err(self.fail(e));
        }
        let Self {
            record, wr_state, ..
        } = self;
        let buf = record.tx_payload_mut()?;
        Ok(Writer::new(buf, wr_state))
    }

    fn prep_write_application(&mut self) -> Result<(), Error> {
        self.prepare_write(false)?;
        let epoch = self
            .record
            .active_write_epoch()
            .ok_or(Error::BadInput("no write epoch active"))?;

        let cap = self.record.open_write(ContentType::ApplicationData, epoch)?;
        let base = self.record.tx_payload_mut()?.len();
        self.wr_state = WriterState::start(base, base + cap, None);
        self.out_state = Some(OutMsg::Application);
        Ok(())
    }

    /// Queue a non-fatal (warning level) alert.
    pub fn write_alert(&mut self, description: AlertDescription) -> Result<(), Error> {
        self.guarded(|mps| {
            mps.prepare_write(false)?;
            let epoch = mps
                .record
                .active_write_epoch()
                .ok_or(Error::BadInput("no write epoch active"))?;

            let cap = mps.record.open_write(ContentType::Alert, epoch)?;
            if cap < 2 {
                return Err(Error::WantWrite);
            }
            let alert = Alert {
                level: AlertLevel::Warning,
                description,
            };
            alert.serialize(mps.record.tx_payload_mut()?);
            mps.record.tx_advance(2)?;
            mps.out_state = Some(OutMsg::Alert);
            Ok(())
        })
    }

    /// Queue a ChangeCipherSpec message.
    pub fn write_ccs(&mut self) -> Result<(), Error> {
        self.guarded(|mps| {
            mps.prepare_write(false)?;
            if mps.config.mode() == Mode::Datagram {
                mps.begin_flight_if_needed()?;
                if mps.dtls.backups.len() >= mps.config.max_flight_length() {
                    return Err(Error::FlightTooLong);
                }
            }
            let epoch = mps
                .record
                .active_write_epoch()
                .ok_or(Error::BadInput("no write epoch active"))?;

            let cap = mps.record.open_write(ContentType::ChangeCipherSpec, epoch)?;
            if cap < 1 {
                return Err(Error::WantWrite);
            }
            mps.record.tx_payload_mut()?.push(1);
            mps.record.tx_advance(1)?;
            mps.out_state = Some(OutMsg::Ccs);
            Ok(())
        })
    }

    /// Declare which position the message being written occupies in the
    /// outgoing flight.
    pub fn write_set_flags(&mut self, flags: MsgFlags) -> Result<(), Error> {
        self.guarded(|mps| {
            if mps.config.mode() != Mode::Datagram {
                return Err(Error::BadInput("flags are datagram-only"));
            }
            if mps.out_state.is_none() {
                return Err(Error::BadInput("no message open"));
            }
            mps.dtls.out_flags = flags;
            Ok(())
        })
    }

    /// Pause the current handshake write; continue later with a matching
    /// [`Mps::write_handshake`] call.
    pub fn write_pause(&mut self) -> Result<(), Error> {
        self.guarded(|mps| {
            if mps.out_state != Some(OutMsg::Handshake) {
                return Err(Error::BadInput("no handshake write open"));
            }
            let p = mps
                .pending_hs
                .as_mut()
                .ok_or(Error::Internal(Layer::Flight, "pending handshake missing"))?;
            if p.declared.is_none() {
                return Err(Error::BadInput("cannot pause a write of unknown length"));
            }
            if p.wstate.is_done() {
                return Err(Error::BadInput("message fully written, dispatch it"));
            }
            p.paused = true;
            mps.out_state = None;
            Ok(())
        })
    }

    /// Conclude the current outbound message. The message is framed into
    /// records; delivery to the transport happens on [`Mps::flush`].
    pub fn dispatch(&mut self) -> Result<(), Error> {
        self.guarded(Self::dispatch_inner)
    }

    fn dispatch_inner(&mut self) -> Result<(), Error> {
        let out = self
            .out_state
            .ok_or(Error::BadInput("no message open for dispatch"))?;

        match out {
            OutMsg::Handshake => {
                let mut p = self
                    .pending_hs
                    .take()
                    .ok_or(Error::Internal(Layer::Flight, "pending handshake missing"))?;

                if !p.wstate.is_done() {
                    return Err(Error::BadInput("handshake message incomplete"));
                }
                // Reserved-but-uncommitted space must not reach the wire.
                p.buf.truncate(p.wstate.committed);
                let body_len = p.wstate.written();

                match self.config.mode() {
                    Mode::Datagram => {
                        if let Err(e) =
                            self.emit_handshake_fragments(p.msg_type, p.seq, p.epoch, &p.buf)
                        {
                            if e.is_would_block() {
                                // Retryable. Fragments already emitted
                                // become duplicates on the retry; the
                                // receiving side merges them without harm.
                                self.pending_hs = Some(p);
                            }
                            return Err(e);
                        }

                        let payload = match p.retransmit {
                            Retransmit::Buffered => BackupPayload::Raw(p.buf),
                            Retransmit::Callback(cb) => BackupPayload::Callback(cb),
                        };
                        // Room was checked when the write was opened.
                        self.dtls.backups.push(BackupHandle {
                            msg_type: p.msg_type,
                            seq: p.seq,
                            epoch: p.epoch,
                            len: body_len,
                            payload,
                        });
                        self.dtls.out_seq += 1;
                    }
                    Mode::Stream => {
                        self.emit_stream_handshake(p.msg_type, &p.buf)?;
                    }
                }
            }
            OutMsg::Application => {
                let committed = self.wr_state.committed;
                let written = self.wr_state.written();
                // Reserved-but-uncommitted space must not reach the wire;
                // the record itself stays open so further messages of the
                // same type can merge into it. Protection happens when the
                // record fills up or on flush.
                self.record.tx_payload_mut()?.truncate(committed);
                self.record.tx_advance(written)?;
            }
            OutMsg::Alert => {}
            OutMsg::Ccs => {
                if self.config.mode() == Mode::Datagram {
                    let epoch = self
                        .record
                        .active_write_epoch()
                        .ok_or(Error::Internal(Layer::Record, "write epoch vanished"))?;
                    self.dtls.backups.push(BackupHandle {
                        msg_type: 0,
                        seq: 0,
                        epoch,
                        len: 0,
                        payload: BackupPayload::Ccs,
                    });
                }
            }
        }

        self.out_state = None;

        if self.config.mode() == Mode::Datagram
            && matches!(out, OutMsg::Handshake | OutMsg::Ccs)
        {
            self.apply_out_flags();
        }

        Ok(())
    }

    /// Deliver every record prepared since the last flush to the
    /// transport. Returns `WantWrite` until the transport accepted
    /// everything; prepared data is retained across calls.
    ///
    /// This is the one operation that stays available after the context
    /// blocks, so a pending fatal alert can still reach the wire.
    pub fn flush(&mut self) -> Result<(), Error> {
        // A handshake write lives in its own backing buffer and does not
        // prevent flushing (a dispatch stopped by backpressure relies on
        // this); a writer into the open record region does.
        if matches!(
            self.out_state,
            Some(OutMsg::Application) | Some(OutMsg::Alert) | Some(OutMsg::Ccs)
        ) {
            return Err(self.fail(Error::BadInput("flush with a write open")));
        }
        self.flush_pending = true;
        self.try_flush_pending()
    }

    /*
     * Shutdown and error interface
     */

    /// Send a fatal alert and block the context. Only [`Mps::flush`]
    /// remains usable afterwards (to finish delivering the alert).
    pub fn send_fatal_alert(&mut self, description: AlertDescription) -> Result<(), Error> {
        self.check_writable()?;

        self.blocking
            .record(BlockReason::AlertSent(description));
        self.conn = ConnectionState::Blocked;
        self.timer.cancel();

        self.alert_pending = Some(Alert {
            level: AlertLevel::Fatal,
            description,
        });
        self.flush_pending = true;
        self.try_flush_pending()
    }

    /// Close the writing side in an orderly fashion, notifying the peer.
    /// Idempotent: calling again after the write side is closed succeeds
    /// without further wire traffic.
    pub fn close(&mut self) -> Result<(), Error> {
        match self.conn {
            ConnectionState::Open => self.conn = ConnectionState::ReadOnly,
            ConnectionState::WriteOnly => self.conn = ConnectionState::Closed,
            ConnectionState::ReadOnly | ConnectionState::Closed => return Ok(()),
            ConnectionState::Blocked => return Err(Error::Blocked),
        }

        self.timer.cancel();
        self.alert_pending = Some(Alert {
            level: AlertLevel::Warning,
            description: AlertDescription::CloseNotify,
        });
        self.flush_pending = true;
        self.try_flush_pending()
    }

    /// The current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.conn
    }

    /// Why the context blocked, if it did.
    pub fn error_state(&self) -> BlockingInfo {
        self.blocking
    }

    /*
     * Internals: error handling
     */

    fn check_readable(&self) -> Result<(), Error> {
        match self.conn {
            ConnectionState::Open | ConnectionState::ReadOnly => Ok(()),
            _ => Err(Error::Blocked),
        }
    }

    fn check_writable(&self) -> Result<(), Error> {
        match self.conn {
            ConnectionState::Open | ConnectionState::WriteOnly => Ok(()),
            _ => Err(Error::Blocked),
        }
    }

    /// Run `f`, routing any failure through the blocking logic.
    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, Error>) -> Result<T, Error> {
        match f(self) {
            Ok(t) => Ok(t),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Record a failure: backpressure passes through, anything terminal
    /// blocks the context, and failures the peer must learn about pend a
    /// fatal alert.
    fn fail(&mut self, e: Error) -> Error {
        if e.is_would_block() {
            if e == Error::WantWrite {
                self.write_deps.insert(Dependencies::TRANSPORT_WRITE);
            }
            return e;
        }

        match e {
            // Orderly closure; connection state was already updated.
            Error::CloseNotify => e,
            Error::Blocked => e,
            Error::AlertReceived(d) => {
                self.blocking.record(BlockReason::AlertReceived(d));
                self.block();
                e
            }
            Error::RetransmitTimeoutExhausted => {
                // Closes silently, without an alert.
                self.blocking.record(BlockReason::TimeoutExhausted);
                self.block();
                e
            }
            other => {
                self.blocking.record(BlockReason::Failure(other));
                self.block();
                if let Some(desc) = alert_for(other) {
                    self.alert_pending = Some(Alert {
                        level: AlertLevel::Fatal,
                        description: desc,
                    });
                    self.flush_pending = true;
                    let _ = self.try_flush_pending();
                }
                other
            }
        }
    }

    fn block(&mut self) {
        debug!("Blocking context: {:?}", self.blocking.reason);
        self.conn = ConnectionState::Blocked;
        self.timer.cancel();
    }

    /*
     * Internals: pending output
     */

    /// Emit a pending alert and push prepared data to the transport.
    fn try_flush_pending(&mut self) -> Result<(), Error> {
        if let Some(alert) = self.alert_pending {
            // Without a write epoch the alert cannot be framed; drop it.
            if let Some(epoch) = self.record.active_write_epoch() {
                let cap = self.record.open_write(ContentType::Alert, epoch)?;
                if cap < 2 {
                    return Err(Error::Internal(Layer::Record, "no room for alert"));
                }
                alert.serialize(self.record.tx_payload_mut()?);
                self.record.tx_advance(2)?;
                self.record.dispatch_write()?;
            } else {
                debug!("Dropping pending alert: no write epoch active");
            }
            self.alert_pending = None;
            self.flush_pending = true;
        }

        if !self.flush_pending && !self.record.has_pending_output() {
            return Ok(());
        }

        match self.record.flush(self.transport.as_mut()) {
            Ok(()) => {
                self.flush_pending = false;
                self.write_deps.clear();
                Ok(())
            }
            Err(Error::WantWrite) => {
                self.flush_pending = true;
                self.write_deps.insert(Dependencies::TRANSPORT_WRITE);
                Err(Error::WantWrite)
            }
            Err(e) => Err(e),
        }
    }

    /// Clear anything that must reach the wire before a new read or
    /// write commences.
    fn clear_pending(&mut self) -> Result<(), Error> {
        if self.alert_pending.is_some() || self.flush_pending {
            self.try_flush_pending()?;
        }
        Ok(())
    }

    fn prepare_write(&mut self, allow_paused_hs: bool) -> Result<(), Error> {
        self.check_writable()?;

        if self.out_state.is_some() {
            return Err(Error::BadInput("write already open"));
        }
        if self.in_state.is_some() {
            return Err(Error::BadInput("write while a read is open"));
        }
        if !allow_paused_hs && self.pending_hs.is_some() {
            return Err(Error::BadInput("handshake write in progress"));
        }

        self.clear_pending()?;

        if self.config.mode() == Mode::Datagram {
            // Sending is allowed between exchanges, while building our
            // flight, and while we hold the final flight; not while the
            // peer's flight is incoming.
            match self.dtls.state {
                FlightState::Done | FlightState::Send | FlightState::Finalize => {}
                _ => return Err(Error::BadInput("write while receiving a flight")),
            }
        }

        Ok(())
    }

    /*
     * Internals: flight handling (write side)
     */

    /// Handle the `done`/`finalize` to `send` transitions when a new
    /// flight message is started.
    fn begin_flight_if_needed(&mut self) -> Result<(), Error> {
        if self.dtls.state == FlightState::Finalize {
            // Starting a new exchange while holding the final flight of
            // the previous one: assume the peer saw it.
            debug!("New flight while finalizing; wrapping up previous exchange");
            self.dtls.forget_outgoing();
            self.dtls.forget_detection();
            self.dtls.exchange_active = false;
            self.dtls.state = FlightState::Done;
            self.timer.cancel();
        }

        if self.dtls.state == FlightState::Done {
            if !self.dtls.exchange_active {
                // A fresh handshake: sequence numbers restart, stray
                // buffered fragments from a previous exchange are dropped.
                self.dtls.reassembly.reset(0);
                self.dtls.out_seq = 0;
                self.dtls.forget_outgoing();
                self.dtls.forget_detection();
                self.dtls.exchange_active = true;
            }
            debug!("Flight state: done -> send");
            self.dtls.state = FlightState::Send;
            self.backoff.reset();
            self.timer.cancel();
        }

        Ok(())
    }

    /// Apply the write-side flags after a message was dispatched.
    fn apply_out_flags(&mut self) {
        let flags = self.dtls.out_flags;
        self.dtls.out_flags = MsgFlags::default();

        if flags.ends_flight() {
            debug!("Flight state: send -> await");
            self.dtls.state = FlightState::Await;
            self.arm_timer();
        } else if flags.ends_handshake() {
            debug!("Flight state: send -> finalize");
            self.dtls.state = FlightState::Finalize;
            self.dtls.finalize_resends_left = self.config.finalize_resends();
            self.arm_timer();
        }
    }

    /// Slice a handshake message body into record-sized fragments.
    fn emit_handshake_fragments(
        &mut self,
        msg_type: u8,
        seq: u16,
        epoch: EpochId,
        body: &[u8],
    ) -> Result<(), Error> {
        let total = body.len();
        let mut offset = 0;
        let need = HandshakeHeader::DATAGRAM_LEN + usize::from(total > 0);

        loop {
            let mut cap = self.record.open_write(ContentType::Handshake, epoch)?;
            if cap < need {
                // The open record (or the room left in the datagram) is
                // too small for any progress: seal and start over on a
                // fresh datagram.
                self.record.break_datagram()?;
                cap = self.record.open_write(ContentType::Handshake, epoch)?;
                if cap < need {
                    return Err(Error::Internal(Layer::Record, "record capacity too small"));
                }
            }

            let chunk = (total - offset).min(cap - HandshakeHeader::DATAGRAM_LEN);
            let header = HandshakeHeader {
                msg_type,
                length: total,
                message_seq: seq,
                fragment_offset: offset,
                fragment_length: chunk,
            };

            let payload = self.record.tx_payload_mut()?;
            header.serialize_datagram(payload);
            payload.extend_from_slice(&body[offset..offset + chunk]);
            self.record
                .tx_advance(HandshakeHeader::DATAGRAM_LEN + chunk)?;

            offset += chunk;
            if offset >= total {
                // Leave the record open so a following message of the
                // same flight can merge into it.
                return Ok(());
            }
            self.record.dispatch_write()?;
        }
    }

    /// Stream-mode handshake emission: header plus body as a byte run
    /// spanning as many records as needed.
    fn emit_stream_handshake(&mut self, msg_type: u8, body: &[u8]) -> Result<(), Error> {
        let epoch = self
            .record
            .active_write_epoch()
            .ok_or(Error::BadInput("no write epoch active"))?;

        let header = HandshakeHeader {
            msg_type,
            length: body.len(),
            ..Default::default()
        };
        let mut msg = Buf::new();
        header.serialize_stream(&mut msg);
        msg.extend_from_slice(body);

        let mut offset = 0;
        while offset < msg.len() {
            let cap = self.record.open_write(ContentType::Handshake, epoch)?;
            if cap == 0 {
                self.record.dispatch_write()?;
                continue;
            }
            let chunk = (msg.len() - offset).min(cap);
            self.record
                .tx_payload_mut()?
                .extend_from_slice(&msg[offset..offset + chunk]);
            self.record.tx_advance(chunk)?;
            offset += chunk;
        }
        Ok(())
    }

    /*
     * Internals: flight handling (read side)
     */

    /// Process one opened record; `Some` means a message is ready for the
    /// user.
    fn process_record(
        &mut self,
        open: crate::record::OpenRecord,
    ) -> Result<Option<MsgType>, Error> {
        let active_read = self.record.active_read_epoch();
        let epoch_matches = Some(open.sequence.epoch) == active_read;

        self.last_rx_seq = Some(open.sequence.to_wire());

        match open.content_type {
            ContentType::ChangeCipherSpec => {
                check_ccs(self.record.payload())?;
                self.record.consume_read();
                if !epoch_matches {
                    debug!("Dropping CCS from inactive epoch {}", open.sequence.epoch);
                    return Ok(None);
                }
                self.in_state = Some(InMsg::Ccs);
                Ok(Some(MsgType::ChangeCipherSpec))
            }

            ContentType::Alert => {
                let alert = Alert::parse(self.record.payload())?;
                self.record.consume_read();
                if !epoch_matches {
                    debug!("Dropping alert from inactive epoch {}", open.sequence.epoch);
                    return Ok(None);
                }
                match (alert.level, alert.description) {
                    (AlertLevel::Fatal, d) => Err(Error::AlertReceived(d)),
                    (AlertLevel::Warning, AlertDescription::CloseNotify) => {
                        self.close_notify_received();
                        Err(Error::CloseNotify)
                    }
                    (AlertLevel::Warning, d) => {
                        self.in_state = Some(InMsg::Alert(d));
                        Ok(Some(MsgType::Alert))
                    }
                }
            }

            ContentType::ApplicationData => {
                if !epoch_matches {
                    debug!(
                        "Dropping application data from inactive epoch {}",
                        open.sequence.epoch
                    );
                    self.record.consume_read();
                    return Ok(None);
                }
                self.rd_state = ReaderState::start(self.record.payload().len());
                self.in_state = Some(InMsg::Application);
                Ok(Some(MsgType::ApplicationData))
            }

            ContentType::Handshake => match self.config.mode() {
                Mode::Datagram => self.process_handshake_datagram(open.sequence.epoch),
                Mode::Stream => self.process_handshake_stream(),
            },

            ContentType::Unknown(_) => {
                // The record layer already filters these.
                Err(Error::Internal(Layer::Record, "unknown content type"))
            }
        }
    }

    fn process_handshake_datagram(&mut self, epoch: EpochId) -> Result<Option<MsgType>, Error> {
        // Malformed handshake structure surviving record authentication
        // is a protocol violation, not line noise: fatal.
        let frags = split_fragments(self.record.payload(), Mode::Datagram)?;

        let mut trigger = false;
        for frag in &frags {
            trigger |= Self::handle_fragment(&mut self.dtls, frag, epoch)?;
        }
        drop(frags);
        self.record.consume_read();

        if trigger {
            debug!("Peer retransmission detected; replaying last flight");
            self.retransmit_flight(RetransmitState::Resend)?;
        }

        // Progress of the flight machine driven by reassembly output.
        if self.dtls.reassembly.available().is_some() {
            self.on_first_message_of_flight();
        }

        Ok(self.try_deliver_handshake())
    }

    /// Route one fragment through retransmission detection and into
    /// reassembly. Returns whether a flight retransmission fired.
    fn handle_fragment(
        machine: &mut FlightMachine,
        frag: &Fragment<'_>,
        epoch: EpochId,
    ) -> Result<bool, Error> {
        let seq = frag.header.message_seq;

        match machine.state {
            FlightState::Await | FlightState::Finalize => {
                if machine.is_tracked(epoch, seq) {
                    return Ok(machine.detect_retransmission(epoch, seq));
                }
                // Not a retransmission: feed towards the next flight.
                machine.reassembly.feed(frag, epoch)?;
                Ok(false)
            }

            FlightState::Receive => {
                machine.reassembly.feed(frag, epoch)?;
                Ok(false)
            }

            FlightState::Done => {
                if machine.exchange_active {
                    // Our turn to send; peer retransmissions of its just
                    // completed flight are not answered until our flight
                    // exists.
                    trace!("Dropping handshake fragment while holding the turn");
                    return Ok(false);
                }
                // Peer initiates a new exchange.
                machine.reassembly.feed(frag, epoch)?;
                Ok(false)
            }

            FlightState::Send => {
                trace!("Dropping handshake fragment while sending a flight");
                Ok(false)
            }
        }
    }

    /// A complete next-expected message exists; drive the flight state.
    fn on_first_message_of_flight(&mut self) {
        match self.dtls.state {
            FlightState::Await => {
                // The peer answering proves it holds our flight. The
                // outgoing backups stay around: a disrupted receipt of
                // the rest of its flight is signalled by replaying them.
                debug!("Flight state: await -> receive");
                self.dtls.forget_detection();
                self.dtls.state = FlightState::Receive;
                self.backoff.reset();
                self.arm_timer();
            }
            FlightState::Finalize => {
                // Anything that is not a retransmission of the old flight
                // means the peer moved on: wrap up, a new exchange begins.
                debug!("Flight state: finalize -> receive (new exchange)");
                self.dtls.forget_outgoing();
                self.dtls.forget_detection();
                self.dtls.exchange_active = true;
                self.dtls.out_seq = self.dtls.reassembly.next_seq();
                self.dtls.state = FlightState::Receive;
                self.backoff.reset();
                self.arm_timer();
            }
            FlightState::Done if !self.dtls.exchange_active => {
                // Peer-initiated exchange. Replies reuse the incoming
                // sequence number base.
                debug!("Flight state: done -> receive (peer initiated)");
                self.dtls.exchange_active = true;
                self.dtls.out_seq = self.dtls.reassembly.next_seq();
                self.dtls.state = FlightState::Receive;
                self.backoff.reset();
                self.arm_timer();
            }
            _ => {}
        }
    }

    /// Hand the completed next-expected message to the user if its epoch
    /// is the active read epoch.
    fn try_deliver_handshake(&mut self) -> Option<MsgType> {
        if self.in_state.is_some() {
            return None;
        }
        let active = self.record.active_read_epoch()?;
        let (len, epoch) = {
            let (_, epoch, data) = self.dtls.reassembly.available()?;
            (data.len(), epoch)
        };
        if epoch != active {
            debug!("Holding back handshake message for inactive epoch {}", epoch);
            return None;
        }

        if !self.hs_read_paused {
            self.rd_state = ReaderState::start(len);
        }
        self.hs_read_paused = false;
        self.in_state = Some(InMsg::Handshake);
        Some(MsgType::Handshake)
    }

    fn consume_handshake_datagram(&mut self) -> Result<(), Error> {
        if !self.rd_state.is_done() {
            return Err(Error::BadInput("handshake message not fully consumed"));
        }

        let seq = self.dtls.reassembly.next_seq();
        let epoch = self
            .dtls
            .reassembly
            .available()
            .map(|(_, e, _)| e)
            .ok_or(Error::Internal(Layer::Flight, "consume without message"))?;

        self.dtls.remember_incoming(epoch, seq)?;
        self.dtls.reassembly.advance()?;

        let flags = self.dtls.in_flags;
        self.dtls.in_flags = MsgFlags::default();

        if flags.ends_flight() {
            // The peer's flight is complete; the turn is ours. Detection
            // memory stays for recognizing its retransmissions later, the
            // backups of our previous flight are finally obsolete.
            debug!("Flight state: receive -> done (flight complete)");
            self.dtls.forget_outgoing();
            self.dtls.reassembly.forget_future();
            self.dtls.state = FlightState::Done;
            self.backoff.reset();
            self.timer.cancel();
        } else if flags.ends_handshake() {
            debug!("Flight state: receive -> done (handshake complete)");
            self.dtls.reset();
            self.backoff.reset();
            self.timer.cancel();
        }

        self.hs_read_paused = false;
        self.purge_epochs();
        Ok(())
    }

    /*
     * Internals: stream-mode handshake reading
     */

    fn process_handshake_stream(&mut self) -> Result<Option<MsgType>, Error> {
        if self.stream_hs.is_none() {
            // Accumulate the handshake header; it may straddle records.
            while self.hdr_partial.len() < HandshakeHeader::STREAM_LEN
                && self.stream_pos < self.record.payload().len()
            {
                let b = self.record.payload()[self.stream_pos];
                self.hdr_partial.push(b);
                self.stream_pos += 1;
            }
            if self.hdr_partial.len() < HandshakeHeader::STREAM_LEN {
                self.record.consume_read();
                self.stream_pos = 0;
                return Ok(None);
            }

            let (_, header) = HandshakeHeader::parse_stream(&self.hdr_partial)
                .map_err(|_| Error::InvalidRecord(Layer::Message))?;
            if header.length > self.config.max_handshake_len() {
                return Err(Error::BadInput("handshake message too long"));
            }
            self.hdr_partial.clear();
            self.stream_hs = Some(header);
            self.rd_state = ReaderState::start(header.length);
        }

        let header = self.stream_hs.unwrap_or_default();

        // No bytes for this message in the current record: fetch more.
        if self.stream_pos >= self.record.payload().len() && header.length > self.rd_state.offset {
            self.record.consume_read();
            self.stream_pos = 0;
            return Ok(None);
        }

        // The window the user sees starts at the current consumed point.
        self.rd_state.base = self.rd_state.offset;
        self.in_state = Some(InMsg::Handshake);
        Ok(Some(MsgType::Handshake))
    }

    /// Account for the bytes taken from the current record window and
    /// release the record if it is fully drained.
    fn stream_hs_window_done(&mut self) {
        let taken = self.rd_state.taken_from_window();
        self.stream_pos += taken;
        self.rd_state.base = self.rd_state.offset;
        if self.stream_pos >= self.record.payload().len() && self.record.open_record().is_some() {
            self.record.consume_read();
            self.stream_pos = 0;
        }
    }

    fn consume_handshake_stream(&mut self) -> Result<(), Error> {
        if !self.rd_state.is_done() {
            return Err(Error::BadInput("handshake message not fully consumed"));
        }
        self.stream_hs_window_done();
        self.stream_hs = None;
        Ok(())
    }

    /*
     * Internals: retransmission
     */

    fn arm_timer(&mut self) {
        let t = self.backoff.timeout();
        self.timer.set(t / 2, t);
    }

    /// React to an expired retransmission timer.
    fn poll_timer(&mut self) -> Result<(), Error> {
        if self.timer.get() != TimerState::Expired {
            return Ok(());
        }

        match self.dtls.state {
            FlightState::Await | FlightState::Receive => {
                if self.backoff.saturated_expiries() >= self.config.exhaust_after() {
                    debug!("Retransmission timeout exhausted");
                    self.timer.cancel();
                    return Err(Error::RetransmitTimeoutExhausted);
                }
                let sub = if self.dtls.state == FlightState::Await {
                    RetransmitState::Resend
                } else {
                    // Without per-message acknowledgements, asking the
                    // peer to resend means replaying our flight.
                    RetransmitState::RequestResend
                };
                debug!(
                    "Timer expired in {:?}; retransmitting ({:?})",
                    self.dtls.state, sub
                );
                self.retransmit_flight(sub)?;
                self.backoff.bump();
                self.arm_timer();
            }
            FlightState::Finalize => {
                if self.dtls.finalize_resends_left > 0 {
                    self.dtls.finalize_resends_left -= 1;
                    debug!("Timer expired in finalize; resending final flight");
                    self.retransmit_flight(RetransmitState::Resend)?;
                    self.backoff.bump();
                    self.arm_timer();
                } else {
                    // The peer stayed quiet long enough; the exchange is
                    // over for good.
                    debug!("Flight state: finalize -> done");
                    self.dtls.reset();
                    self.backoff.reset();
                    self.timer.cancel();
                }
            }
            _ => self.timer.cancel(),
        }

        Ok(())
    }

    /// Re-emit the whole last outgoing flight from its backup handles.
    fn retransmit_flight(&mut self, sub: RetransmitState) -> Result<(), Error> {
        if self.dtls.backups.is_empty() {
            return Ok(());
        }
        self.dtls.retransmit = sub;

        let backups = std::mem::take(&mut self.dtls.backups);
        let mut result = Ok(());
        for backup in &backups {
            result = self.emit_backup(backup);
            if result.is_err() {
                break;
            }
        }
        self.dtls.backups = backups;
        result?;

        // Best effort delivery; if the transport blocks, the records stay
        // queued and go out with the next flush.
        match self.try_flush_pending() {
            Ok(()) | Err(Error::WantWrite) => {}
            Err(e) => return Err(e),
        }

        self.dtls.retransmit = RetransmitState::None;
        Ok(())
    }

    fn emit_backup(&mut self, backup: &BackupHandle) -> Result<(), Error> {
        match &backup.payload {
            BackupPayload::Raw(body) => {
                self.emit_handshake_fragments(backup.msg_type, backup.seq, backup.epoch, body)
            }
            BackupPayload::Callback(cb) => {
                // The callback rebuilds the body; it must be
                // deterministic over its captured context.
                let mut body = Buf::new();
                let mut wstate = WriterState::start(0, backup.len, Some(backup.len));
                {
                    let mut writer = Writer::new(&mut body, &mut wstate);
                    cb(&mut writer)?;
                }
                if wstate.written() != backup.len {
                    return Err(Error::Internal(
                        Layer::Flight,
                        "retransmission callback produced wrong length",
                    ));
                }
                self.emit_handshake_fragments(backup.msg_type, backup.seq, backup.epoch, &body)
            }
            BackupPayload::Ccs => {
                let cap = self
                    .record
                    .open_write(ContentType::ChangeCipherSpec, backup.epoch)?;
                if cap < 1 {
                    return Err(Error::WantWrite);
                }
                self.record.tx_payload_mut()?.push(1);
                self.record.tx_advance(1)
            }
        }
    }

    /*
     * Internals: closure
     */

    fn close_notify_received(&mut self) {
        match self.conn {
            ConnectionState::Open => self.conn = ConnectionState::WriteOnly,
            ConnectionState::ReadOnly => self.conn = ConnectionState::Closed,
            _ => {}
        }
    }

    fn purge_epochs(&mut self) {
        self.record.purge_epochs(self.dtls.min_referenced_epoch());
    }
}

impl std::fmt::Debug for Mps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mps")
            .field("conn", &self.conn)
            .field("flight", &self.dtls.state)
            .field("retransmit", &self.dtls.retransmit)
            .field("in", &self.in_state)
            .field("out", &self.out_state)
            .field("record", &self.record)
            .finish()
    }
}

/// The alert the peer should see for a local failure, if any.
fn alert_for(e: Error) -> Option<AlertDescription> {
    match e {
        Error::InvalidRecord(Layer::Record) => Some(AlertDescription::BadRecordMac),
        Error::InvalidRecord(_) => Some(AlertDescription::DecodeError),
        Error::InvalidPadding => Some(AlertDescription::BadRecordMac),
        Error::BadInput(_) => None,
        _ => None,
    }
}
