mod common;

use std::time::Duration;

use common::*;

use mstack::{BlockReason, Config, ConnectionState, Error, MsgFlags, MsgType};
use mstack::{HandshakeOut, Retransmit};

fn short_timeouts() -> Config {
    Config::builder()
        .retransmit_timeout_min(Duration::from_millis(100))
        .retransmit_timeout_max(Duration::from_millis(400))
        .build()
        .unwrap()
}

#[test]
fn expiry_replays_flight_and_doubles_timeout() {
    let mut a = plaintext_endpoint(short_timeouts());

    write_handshake(&mut a.mps, 1, &[1; 30], MsgFlags::ADD);
    write_handshake(&mut a.mps, 2, &[2; 40], MsgFlags::END);
    a.mps.flush().unwrap();
    let initial = parse_all_records(&a.wire.sent());

    a.timer.expire();
    assert_eq!(a.mps.read(), Err(Error::WantRead));
    let resent = parse_all_records(&a.wire.sent());

    // Identical bytes modulo the record sequence numbers, which advance.
    assert_eq!(initial.len(), resent.len());
    for (orig, re) in initial.iter().zip(&resent) {
        assert_eq!(orig.ctype, re.ctype);
        assert_eq!(orig.epoch, re.epoch);
        assert_eq!(orig.payload, re.payload);
        assert!(re.seq > orig.seq);
    }

    assert_eq!(
        a.timer.armed_history(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
}

#[test]
fn backoff_is_geometric_capped_then_exhausts() {
    let mut a = plaintext_endpoint(short_timeouts());

    write_handshake(&mut a.mps, 1, &[9; 16], MsgFlags::END);
    a.mps.flush().unwrap();
    a.wire.sent();

    // 100 -> 200 -> 400 -> 400 -> 400, then give up (exhaust_after = 2).
    for _ in 0..4 {
        a.timer.expire();
        assert_eq!(a.mps.read(), Err(Error::WantRead));
        assert!(!a.wire.sent().is_empty(), "each expiry must retransmit");
    }
    assert_eq!(
        a.timer.armed_history(),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(400),
            Duration::from_millis(400),
        ]
    );

    a.timer.expire();
    assert_eq!(a.mps.read(), Err(Error::RetransmitTimeoutExhausted));
    assert_eq!(a.mps.connection_state(), ConnectionState::Blocked);
    assert_eq!(a.mps.error_state().reason, BlockReason::TimeoutExhausted);
    // Timeout exhaustion closes silently: no alert on the wire.
    assert!(a.wire.sent_is_empty());
}

#[test]
fn first_answer_resets_timeout() {
    let mut a = plaintext_endpoint(short_timeouts());
    let mut b = plaintext_endpoint(short_timeouts());

    write_handshake(&mut a.mps, 1, &[3; 25], MsgFlags::END);
    a.mps.flush().unwrap();
    shuttle(&a.wire, &b.wire);

    // One unanswered expiry first: timeout is at 200ms.
    a.timer.expire();
    assert_eq!(a.mps.read(), Err(Error::WantRead));
    a.wire.sent();

    // Peer answers; progress resets the timeout to the minimum.
    read_handshake(&mut b.mps, MsgFlags::END);
    write_handshake(&mut b.mps, 2, &[4; 25], MsgFlags::END);
    b.mps.flush().unwrap();
    shuttle(&b.wire, &a.wire);

    assert_eq!(a.mps.read().unwrap(), MsgType::Handshake);
    let hist = a.timer.armed_history();
    assert_eq!(*hist.last().unwrap(), Duration::from_millis(100));
}

#[test]
fn peer_retransmission_triggers_at_most_one_replay() {
    let mut a = plaintext_endpoint(default_config());
    let mut b = plaintext_endpoint(default_config());

    // a sends its flight, b answers; the answer never reaches a.
    write_handshake(&mut a.mps, 1, &[0x11; 50], MsgFlags::END);
    a.mps.flush().unwrap();
    let flight_a = a.wire.sent();
    for d in &flight_a {
        b.wire.deliver(d);
    }

    read_handshake(&mut b.mps, MsgFlags::END);
    write_handshake(&mut b.mps, 3, &[0x22; 60], MsgFlags::END);
    b.mps.flush().unwrap();
    let answer_1 = parse_all_records(&b.wire.sent());
    assert!(!answer_1.is_empty());

    // a did not see the answer and retransmits its flight; b must
    // recognize the retransmission and replay its answer exactly once.
    a.timer.expire();
    assert_eq!(a.mps.read(), Err(Error::WantRead));
    shuttle(&a.wire, &b.wire);

    assert_eq!(b.mps.read(), Err(Error::WantRead));
    let answer_2 = parse_all_records(&b.wire.sent());
    assert_eq!(answer_1.len(), answer_2.len());
    for (first, second) in answer_1.iter().zip(&answer_2) {
        assert_eq!(first.payload, second.payload);
        assert!(second.seq > first.seq);
    }
}

#[test]
fn stalled_incoming_flight_requests_retransmission() {
    let mut a = plaintext_endpoint(short_timeouts());

    write_handshake(&mut a.mps, 1, &[0x55; 20], MsgFlags::END);
    a.mps.flush().unwrap();
    let flight_a = parse_all_records(&a.wire.sent());

    // The first message of the peer's two-message answer arrives; the
    // second never does.
    a.wire.deliver(&record_bytes(
        22,
        0,
        0,
        &fragment_bytes(2, 20, 0, 0, &[0x66; 20]),
    ));
    let (ty, body) = read_handshake(&mut a.mps, MsgFlags::ADD);
    assert_eq!((ty, body.len()), (2, 20));

    // Timeout while mid-flight: without per-message acks, a replays its
    // own last flight to prompt the peer.
    a.timer.expire();
    assert_eq!(a.mps.read(), Err(Error::WantRead));
    let replay = parse_all_records(&a.wire.sent());
    assert_eq!(replay.len(), flight_a.len());
    for (orig, re) in flight_a.iter().zip(&replay) {
        assert_eq!(orig.payload, re.payload);
    }
}

#[test]
fn finalize_resends_then_settles() {
    let config = Config::builder()
        .retransmit_timeout_min(Duration::from_millis(100))
        .retransmit_timeout_max(Duration::from_millis(400))
        .finalize_resends(1)
        .build()
        .unwrap();
    let mut a = plaintext_endpoint(config);

    write_handshake(&mut a.mps, 20, &[0x33; 12], MsgFlags::FINISHED);
    a.mps.flush().unwrap();
    assert!(!a.wire.sent().is_empty());
    assert!(a.timer.is_armed(), "finalize holds the flight under a timer");

    // First expiry: one more transmission for a peer that missed it.
    a.timer.expire();
    assert_eq!(a.mps.read(), Err(Error::WantRead));
    assert!(!a.wire.sent().is_empty());

    // Second expiry: the wait is over, nothing further goes out.
    a.timer.expire();
    assert_eq!(a.mps.read(), Err(Error::WantRead));
    assert!(a.wire.sent_is_empty());
}

#[test]
fn callback_retransmission_regenerates_message() {
    let mut a = plaintext_endpoint(short_timeouts());

    let mut writer = a
        .mps
        .write_handshake(HandshakeOut {
            msg_type: 5,
            length: Some(50),
            retransmit: Retransmit::Callback(Box::new(|w| w.write_all(&[7; 50]))),
        })
        .unwrap();
    writer.write_all(&[7; 50]).unwrap();
    drop(writer);
    a.mps.write_set_flags(MsgFlags::END).unwrap();
    a.mps.dispatch().unwrap();
    a.mps.flush().unwrap();
    let initial = parse_all_records(&a.wire.sent());

    a.timer.expire();
    assert_eq!(a.mps.read(), Err(Error::WantRead));
    let resent = parse_all_records(&a.wire.sent());

    assert_eq!(initial.len(), resent.len());
    for (orig, re) in initial.iter().zip(&resent) {
        assert_eq!(orig.payload, re.payload);
    }
}
