mod common;

use common::*;

use mstack::{Error, MsgType, Transform};

/// Write one application data message and dispatch it.
fn write_app(mps: &mut mstack::Mps, data: &[u8]) {
    let mut writer = mps.write_application().expect("write_application");
    writer.write_all(data).expect("write app body");
    drop(writer);
    mps.dispatch().expect("dispatch");
}

#[test]
fn write_epoch_switch_starts_fresh_counter_read_keeps_old() {
    let mut a = plaintext_endpoint(default_config());

    write_app(&mut a.mps, b"under zero");
    a.mps.flush().unwrap();
    let records = parse_all_records(&a.wire.sent());
    assert_eq!(records[0].epoch, 0);
    assert_eq!(records[0].seq, 0);

    // New keys for writing only.
    let e1 = a.mps.register_epoch(Transform::plaintext()).unwrap();
    a.mps.activate_write_epoch(e1).unwrap();

    write_app(&mut a.mps, b"under one");
    a.mps.flush().unwrap();
    let records = parse_all_records(&a.wire.sent());
    assert_eq!(records[0].epoch, 1);
    assert_eq!(records[0].seq, 0, "fresh epoch starts a fresh counter");

    // The read side still accepts epoch 0.
    a.wire.deliver(&record_bytes(23, 0, 9, b"old keys"));
    assert_eq!(a.mps.read().unwrap(), MsgType::ApplicationData);
    {
        let mut rd = a.mps.read_application().unwrap();
        assert_eq!(rd.peek(8).unwrap(), b"old keys");
        rd.advance(8).unwrap();
    }
    a.mps.read_consume().unwrap();
}

#[test]
fn activation_is_not_retroactive() {
    let mut a = plaintext_endpoint(default_config());

    // Prepared but not yet flushed under epoch 0.
    write_app(&mut a.mps, b"prepared first");

    let e1 = a.mps.register_epoch(Transform::plaintext()).unwrap();
    a.mps.activate_write_epoch(e1).unwrap();
    write_app(&mut a.mps, b"prepared second");
    a.mps.flush().unwrap();

    let records = parse_all_records(&a.wire.sent());
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].epoch, 0, "pending data is never re-encrypted");
    assert_eq!(records[1].epoch, 1);
}

#[test]
fn aes_gcm_roundtrip_and_tamper_rejection() {
    let key = [42u8; 16];
    let iv = [7u8; 12];

    let mut a = endpoint(default_config());
    let ea = a.mps.register_epoch(Transform::aes128_gcm(key, iv)).unwrap();
    a.mps.activate_read_epoch(ea).unwrap();
    a.mps.activate_write_epoch(ea).unwrap();

    let mut b = endpoint(default_config());
    let eb = b.mps.register_epoch(Transform::aes128_gcm(key, iv)).unwrap();
    b.mps.activate_read_epoch(eb).unwrap();
    b.mps.activate_write_epoch(eb).unwrap();

    write_app(&mut a.mps, b"secret payload");
    a.mps.flush().unwrap();
    let datagrams = a.wire.sent();
    assert_eq!(datagrams.len(), 1);

    // Ciphertext on the wire, not plaintext.
    assert!(!datagrams[0]
        .windows(14)
        .any(|w| w == b"secret payload"));

    // A tampered copy fails authentication and is dropped silently; the
    // replay window must not have been advanced by the forgery, so the
    // genuine record still gets through afterwards.
    let mut tampered = datagrams[0].clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    b.wire.deliver(&tampered);
    assert_eq!(b.mps.read(), Err(Error::WantRead));

    b.wire.deliver(&datagrams[0]);
    assert_eq!(b.mps.read().unwrap(), MsgType::ApplicationData);
    {
        let mut rd = b.mps.read_application().unwrap();
        assert_eq!(rd.peek(14).unwrap(), b"secret payload");
        rd.advance(14).unwrap();
    }
    b.mps.read_consume().unwrap();
}

#[test]
fn forced_sequence_number_applies_to_next_record() {
    let mut a = plaintext_endpoint(default_config());

    // As after answering a ClientHello: reuse its record sequence number.
    let forced = [0u8, 0, 0, 0, 0, 0, 0, 17];
    a.mps.force_sequence_number(forced).unwrap();

    write_app(&mut a.mps, b"reply");
    a.mps.flush().unwrap();
    let records = parse_all_records(&a.wire.sent());
    assert_eq!(records[0].seq, 17);

    // Monotonicity resumes above the forced value.
    write_app(&mut a.mps, b"next");
    a.mps.flush().unwrap();
    let records = parse_all_records(&a.wire.sent());
    assert_eq!(records[0].seq, 18);
}

#[test]
fn stale_epoch_is_purged_once_both_directions_moved_on() {
    let mut a = plaintext_endpoint(default_config());

    // Epoch 0 still accepts records.
    a.wire.deliver(&record_bytes(23, 0, 0, b"ok"));
    assert_eq!(a.mps.read().unwrap(), MsgType::ApplicationData);
    a.mps.read_consume().unwrap();

    // Both directions move to epoch 1; nothing references epoch 0.
    let e1 = a.mps.register_epoch(Transform::plaintext()).unwrap();
    a.mps.activate_read_epoch(e1).unwrap();
    a.mps.activate_write_epoch(e1).unwrap();

    // Epoch 0 is gone: its records are dropped like any unknown epoch.
    a.wire.deliver(&record_bytes(23, 0, 1, b"late"));
    assert_eq!(a.mps.read(), Err(Error::WantRead));

    // Epoch 1 works.
    a.wire.deliver(&record_bytes(23, 1, 0, b"new"));
    assert_eq!(a.mps.read().unwrap(), MsgType::ApplicationData);
    a.mps.read_consume().unwrap();
}

#[test]
fn incoming_record_sequence_is_observable_while_open() {
    let mut a = plaintext_endpoint(default_config());

    a.wire.deliver(&record_bytes(23, 0, 23, b"hello"));
    assert_eq!(a.mps.read().unwrap(), MsgType::ApplicationData);
    let seq = a.mps.get_sequence_number().unwrap();
    assert_eq!(seq, [0, 0, 0, 0, 0, 0, 0, 23]);
    a.mps.read_consume().unwrap();
}
