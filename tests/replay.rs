mod common;

use common::*;

use mstack::{Error, MsgFlags, MsgType};

#[test]
fn duplicate_record_is_dropped_silently() {
    let mut b = plaintext_endpoint(default_config());

    let d = record_bytes(22, 0, 0, &fragment_bytes(1, 4, 0, 0, &[1, 2, 3, 4]));
    b.wire.deliver(&d);
    let (_, body) = read_handshake(&mut b.mps, MsgFlags::ADD);
    assert_eq!(body, vec![1, 2, 3, 4]);

    // Bit-identical duplicate: rejected by the replay window before it
    // reaches any higher layer. No output, no retransmission.
    b.wire.deliver(&d);
    assert_eq!(b.mps.read(), Err(Error::WantRead));
    assert!(b.wire.sent_is_empty());
}

#[test]
fn out_of_order_records_within_window_are_accepted_once() {
    let mut b = plaintext_endpoint(default_config());

    b.wire.deliver(&record_bytes(23, 0, 5, b"five"));
    assert_eq!(b.mps.read().unwrap(), MsgType::ApplicationData);
    b.mps.read_consume().unwrap();

    // Lower sequence number, not yet seen: accepted.
    b.wire.deliver(&record_bytes(23, 0, 3, b"three"));
    assert_eq!(b.mps.read().unwrap(), MsgType::ApplicationData);
    b.mps.read_consume().unwrap();

    // Replay of the accepted record: dropped.
    b.wire.deliver(&record_bytes(23, 0, 3, b"three"));
    assert_eq!(b.mps.read(), Err(Error::WantRead));
}

#[test]
fn window_advance_beyond_63_drops_older_positions() {
    let mut b = plaintext_endpoint(default_config());

    b.wire.deliver(&record_bytes(23, 0, 0, b"first"));
    assert_eq!(b.mps.read().unwrap(), MsgType::ApplicationData);
    b.mps.read_consume().unwrap();

    // Jump far ahead; the whole window shifts.
    b.wire.deliver(&record_bytes(23, 0, 100, b"ahead"));
    assert_eq!(b.mps.read().unwrap(), MsgType::ApplicationData);
    b.mps.read_consume().unwrap();

    // 36 is below 100 - 63: silently dropped, no fault.
    b.wire.deliver(&record_bytes(23, 0, 36, b"stale"));
    assert_eq!(b.mps.read(), Err(Error::WantRead));

    // 37 is the oldest tracked position and was never seen: accepted.
    b.wire.deliver(&record_bytes(23, 0, 37, b"edge"));
    assert_eq!(b.mps.read().unwrap(), MsgType::ApplicationData);
    {
        let mut rd = b.mps.read_application().unwrap();
        assert_eq!(rd.peek(4).unwrap(), b"edge");
        rd.advance(4).unwrap();
    }
    b.mps.read_consume().unwrap();
}
