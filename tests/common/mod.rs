#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use mstack::{Config, Error, HandshakeOut, Mps, MsgFlags, MsgType, Retransmit};
use mstack::{Timer, TimerState, Transform, Transport};

pub fn init_log() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/*
 * In-memory transport
 */

#[derive(Default)]
struct WireInner {
    tx: VecDeque<Vec<u8>>,
    rx: VecDeque<Vec<u8>>,
    /// Leftover from a partially consumed rx chunk (stream mode).
    rx_leftover: Vec<u8>,
    block_send: bool,
}

/// Test handle onto one endpoint's transport: inspect what it sent,
/// deliver bytes to it, or block its sends.
#[derive(Clone, Default)]
pub struct Wire(Rc<RefCell<WireInner>>);

impl Wire {
    /// Drain everything the endpoint has sent.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.0.borrow_mut().tx.drain(..).collect()
    }

    /// Make bytes available to the endpoint's receive side.
    pub fn deliver(&self, datagram: &[u8]) {
        self.0.borrow_mut().rx.push_back(datagram.to_vec());
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.0.borrow_mut().block_send = blocked;
    }

    pub fn sent_is_empty(&self) -> bool {
        self.0.borrow().tx.is_empty()
    }
}

struct PipeTransport(Rc<RefCell<WireInner>>);

impl Transport for PipeTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize, Error> {
        let mut inner = self.0.borrow_mut();
        if inner.block_send {
            return Err(Error::WantWrite);
        }
        inner.tx.push_back(data.to_vec());
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut inner = self.0.borrow_mut();
        let chunk = if !inner.rx_leftover.is_empty() {
            std::mem::take(&mut inner.rx_leftover)
        } else {
            inner.rx.pop_front().ok_or(Error::WantRead)?
        };

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            inner.rx_leftover = chunk[n..].to_vec();
        }
        Ok(n)
    }
}

/*
 * Manually driven timer
 */

#[derive(Default)]
struct TimerInner {
    state: Option<TimerState>,
    sets: Vec<(Duration, Duration)>,
}

/// Test handle onto one endpoint's timer.
#[derive(Clone, Default)]
pub struct TimerHandle(Rc<RefCell<TimerInner>>);

impl TimerHandle {
    /// Make the timer report expiry.
    pub fn expire(&self) {
        self.0.borrow_mut().state = Some(TimerState::Expired);
    }

    /// Final timeouts of every `set` call so far.
    pub fn armed_history(&self) -> Vec<Duration> {
        self.0.borrow().sets.iter().map(|s| s.1).collect()
    }

    pub fn is_armed(&self) -> bool {
        matches!(
            self.0.borrow().state,
            Some(TimerState::PreIntermediate | TimerState::PostIntermediate)
        )
    }
}

struct TestTimer(Rc<RefCell<TimerInner>>);

impl Timer for TestTimer {
    fn set(&mut self, intermediate: Duration, final_: Duration) {
        let mut inner = self.0.borrow_mut();
        inner.state = Some(TimerState::PreIntermediate);
        inner.sets.push((intermediate, final_));
    }

    fn cancel(&mut self) {
        self.0.borrow_mut().state = Some(TimerState::Cancelled);
    }

    fn get(&self) -> TimerState {
        self.0.borrow().state.unwrap_or(TimerState::Cancelled)
    }
}

/*
 * Endpoints
 */

/// An endpoint plus the test handles onto its transport and timer.
pub struct Endpoint {
    pub mps: Mps,
    pub wire: Wire,
    pub timer: TimerHandle,
}

pub fn endpoint(config: Config) -> Endpoint {
    init_log();
    let wire = Wire::default();
    let timer = TimerHandle::default();
    let mps = Mps::new(
        Arc::new(config),
        Box::new(PipeTransport(wire.0.clone())),
        Box::new(TestTimer(timer.0.clone())),
    );
    Endpoint { mps, wire, timer }
}

/// Endpoint with a registered, activated plaintext epoch 0.
pub fn plaintext_endpoint(config: Config) -> Endpoint {
    let mut ep = endpoint(config);
    let epoch = ep.mps.register_epoch(Transform::plaintext()).unwrap();
    ep.mps.activate_read_epoch(epoch).unwrap();
    ep.mps.activate_write_epoch(epoch).unwrap();
    ep
}

pub fn default_config() -> Config {
    Config::builder().build().unwrap()
}

/// Move everything `from` has sent into `to`'s receive queue.
pub fn shuttle(from: &Wire, to: &Wire) -> usize {
    let datagrams = from.sent();
    let n = datagrams.len();
    for d in &datagrams {
        to.deliver(d);
    }
    n
}

/*
 * Driving helpers
 */

/// Write, flag and dispatch one handshake message.
pub fn write_handshake(mps: &mut Mps, msg_type: u8, body: &[u8], flags: MsgFlags) {
    let mut writer = mps
        .write_handshake(HandshakeOut {
            msg_type,
            length: Some(body.len()),
            retransmit: Retransmit::Buffered,
        })
        .expect("write_handshake");
    writer.write_all(body).expect("write body");
    drop(writer);
    mps.write_set_flags(flags).expect("write_set_flags");
    mps.dispatch().expect("dispatch");
}

/// Read one handshake message to completion and consume it.
pub fn read_handshake(mps: &mut Mps, flags: MsgFlags) -> (u8, Vec<u8>) {
    let t = mps.read().expect("read");
    assert_eq!(t, MsgType::Handshake);
    mps.read_set_flags(flags).expect("read_set_flags");

    let (msg_type, body) = {
        let mut hs = mps.read_handshake().expect("read_handshake");
        let mut body = Vec::new();
        while hs.reader.remaining() > 0 {
            let chunk = hs.reader.peek(hs.reader.remaining()).expect("peek");
            body.extend_from_slice(chunk);
            let n = chunk.len();
            hs.reader.advance(n).expect("advance");
        }
        (hs.msg_type, body)
    };
    mps.read_consume().expect("read_consume");
    (msg_type, body)
}

/*
 * Wire inspection
 */

/// Header of one record as found on the wire (datagram framing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecHdr {
    pub ctype: u8,
    pub epoch: u16,
    pub seq: u64,
    pub payload: Vec<u8>,
}

/// Parse the records out of one datagram.
pub fn parse_records(datagram: &[u8]) -> Vec<RecHdr> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 13 <= datagram.len() {
        let ctype = datagram[i];
        let epoch = u16::from_be_bytes([datagram[i + 3], datagram[i + 4]]);
        let mut seq_bytes = [0u8; 8];
        seq_bytes[2..].copy_from_slice(&datagram[i + 5..i + 11]);
        let seq = u64::from_be_bytes(seq_bytes);
        let len = u16::from_be_bytes([datagram[i + 11], datagram[i + 12]]) as usize;
        out.push(RecHdr {
            ctype,
            epoch,
            seq,
            payload: datagram[i + 13..i + 13 + len].to_vec(),
        });
        i += 13 + len;
    }
    assert_eq!(i, datagram.len(), "trailing bytes after records");
    out
}

pub fn parse_all_records(datagrams: &[Vec<u8>]) -> Vec<RecHdr> {
    datagrams.iter().flat_map(|d| parse_records(d)).collect()
}

/// One handshake fragment as found inside a record payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragHdr {
    pub msg_type: u8,
    pub total_len: usize,
    pub msg_seq: u16,
    pub frag_off: usize,
    pub body: Vec<u8>,
}

/// Parse the handshake fragments out of one record payload.
pub fn parse_fragments(payload: &[u8]) -> Vec<FragHdr> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 12 <= payload.len() {
        let msg_type = payload[i];
        let total_len = be24(&payload[i + 1..i + 4]);
        let msg_seq = u16::from_be_bytes([payload[i + 4], payload[i + 5]]);
        let frag_off = be24(&payload[i + 6..i + 9]);
        let frag_len = be24(&payload[i + 9..i + 12]);
        out.push(FragHdr {
            msg_type,
            total_len,
            msg_seq,
            frag_off,
            body: payload[i + 12..i + 12 + frag_len].to_vec(),
        });
        i += 12 + frag_len;
    }
    assert_eq!(i, payload.len(), "trailing bytes after fragments");
    out
}

fn be24(b: &[u8]) -> usize {
    ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize
}

/*
 * Wire construction (for crafted inbound traffic)
 */

/// Build one plaintext record with datagram framing.
pub fn record_bytes(ctype: u8, epoch: u16, seq: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(ctype);
    out.extend_from_slice(&0xFEFDu16.to_be_bytes());
    out.extend_from_slice(&epoch.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes()[2..]);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Build one handshake fragment (header plus body slice).
pub fn fragment_bytes(
    msg_type: u8,
    total_len: usize,
    msg_seq: u16,
    frag_off: usize,
    frag: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(msg_type);
    out.extend_from_slice(&(total_len as u32).to_be_bytes()[1..]);
    out.extend_from_slice(&msg_seq.to_be_bytes());
    out.extend_from_slice(&(frag_off as u32).to_be_bytes()[1..]);
    out.extend_from_slice(&(frag.len() as u32).to_be_bytes()[1..]);
    out.extend_from_slice(frag);
    out
}
