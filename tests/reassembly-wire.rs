mod common;

use common::*;

use mstack::{BlockReason, Config, ConnectionState, Error, Layer, MsgFlags};

#[test]
fn reordered_fragments_deliver_one_message() {
    let mut b = plaintext_endpoint(default_config());
    let body: Vec<u8> = (0..=255u8).collect();

    let d1 = record_bytes(22, 0, 0, &fragment_bytes(1, 256, 0, 100, &body[100..200]));
    let d2 = record_bytes(22, 0, 1, &fragment_bytes(1, 256, 0, 0, &body[0..100]));
    let d3 = record_bytes(22, 0, 2, &fragment_bytes(1, 256, 0, 200, &body[200..256]));

    b.wire.deliver(&d1);
    assert_eq!(b.mps.read(), Err(Error::WantRead));
    b.wire.deliver(&d2);
    b.wire.deliver(&d3);

    let (ty, got) = read_handshake(&mut b.mps, MsgFlags::END);
    assert_eq!(ty, 1);
    assert_eq!(got, body);

    // Nothing left over.
    assert_eq!(b.mps.read(), Err(Error::WantRead));
}

#[test]
fn future_messages_buffer_until_expected_arrives() {
    let config = Config::builder().future_message_buffers(2).build().unwrap();
    let mut b = plaintext_endpoint(config);

    b.wire
        .deliver(&record_bytes(22, 0, 0, &fragment_bytes(1, 2, 1, 0, &[11, 11])));
    b.wire
        .deliver(&record_bytes(22, 0, 1, &fragment_bytes(1, 2, 2, 0, &[22, 22])));
    assert_eq!(b.mps.read(), Err(Error::WantRead));

    b.wire
        .deliver(&record_bytes(22, 0, 2, &fragment_bytes(1, 2, 0, 0, &[0, 0])));

    // All three deliver in order without any refetch.
    assert_eq!(read_handshake(&mut b.mps, MsgFlags::ADD).1, vec![0, 0]);
    assert_eq!(read_handshake(&mut b.mps, MsgFlags::ADD).1, vec![11, 11]);
    assert_eq!(read_handshake(&mut b.mps, MsgFlags::END).1, vec![22, 22]);
}

#[test]
fn excess_future_messages_drop_and_recover() {
    let config = Config::builder().future_message_buffers(2).build().unwrap();
    let mut b = plaintext_endpoint(config);

    // seq 3 is beyond the window [0, 2]: dropped without fault.
    b.wire
        .deliver(&record_bytes(22, 0, 0, &fragment_bytes(1, 1, 3, 0, &[33])));
    assert_eq!(b.mps.read(), Err(Error::WantRead));

    for (i, seq) in (0u16..3).enumerate() {
        b.wire.deliver(&record_bytes(
            22,
            0,
            1 + i as u64,
            &fragment_bytes(1, 1, seq, 0, &[seq as u8]),
        ));
    }
    assert_eq!(read_handshake(&mut b.mps, MsgFlags::ADD).1, vec![0]);
    assert_eq!(read_handshake(&mut b.mps, MsgFlags::ADD).1, vec![1]);
    assert_eq!(read_handshake(&mut b.mps, MsgFlags::ADD).1, vec![2]);

    // The dropped message arrives again (peer retransmission) and now fits.
    b.wire
        .deliver(&record_bytes(22, 0, 4, &fragment_bytes(1, 1, 3, 0, &[33])));
    assert_eq!(read_handshake(&mut b.mps, MsgFlags::END).1, vec![33]);
}

#[test]
fn fragment_overflowing_total_length_is_fatal() {
    let mut b = plaintext_endpoint(default_config());

    // offset 4 + len 4 > total 6
    b.wire
        .deliver(&record_bytes(22, 0, 0, &fragment_bytes(1, 6, 0, 4, &[0; 4])));
    assert_eq!(b.mps.read(), Err(Error::InvalidRecord(Layer::Message)));
    assert_eq!(b.mps.connection_state(), ConnectionState::Blocked);
}

#[test]
fn diverging_total_length_is_fatal() {
    let mut b = plaintext_endpoint(default_config());

    b.wire
        .deliver(&record_bytes(22, 0, 0, &fragment_bytes(1, 10, 0, 0, &[0; 4])));
    assert_eq!(b.mps.read(), Err(Error::WantRead));

    b.wire
        .deliver(&record_bytes(22, 0, 1, &fragment_bytes(1, 12, 0, 4, &[0; 4])));
    let err = b.mps.read();
    assert_eq!(err, Err(Error::InvalidRecord(Layer::Flight)));
    assert_eq!(b.mps.connection_state(), ConnectionState::Blocked);
    assert_eq!(
        b.mps.error_state().reason,
        BlockReason::Failure(Error::InvalidRecord(Layer::Flight))
    );
}

#[test]
fn overlapping_fragment_bytes_must_agree() {
    let mut b = plaintext_endpoint(default_config());

    b.wire
        .deliver(&record_bytes(22, 0, 0, &fragment_bytes(1, 8, 0, 0, &[1, 2, 3, 4])));
    assert_eq!(b.mps.read(), Err(Error::WantRead));

    // Same range, different bytes.
    b.wire
        .deliver(&record_bytes(22, 0, 1, &fragment_bytes(1, 8, 0, 0, &[9, 9, 9, 9])));
    assert_eq!(b.mps.read(), Err(Error::InvalidRecord(Layer::Flight)));
}

#[test]
fn duplicate_handshake_message_is_not_redelivered() {
    let mut b = plaintext_endpoint(default_config());

    b.wire
        .deliver(&record_bytes(22, 0, 0, &fragment_bytes(9, 3, 0, 0, &[1, 2, 3])));
    assert_eq!(read_handshake(&mut b.mps, MsgFlags::ADD).1, vec![1, 2, 3]);

    // The same message under a fresh record sequence number: the record
    // layer accepts it, the flight layer knows it was already delivered.
    b.wire
        .deliver(&record_bytes(22, 0, 1, &fragment_bytes(9, 3, 0, 0, &[1, 2, 3])));
    assert_eq!(b.mps.read(), Err(Error::WantRead));
    assert!(b.wire.sent_is_empty(), "no retransmission from mid-flight dupe");
}
