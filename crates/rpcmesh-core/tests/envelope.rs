//! Envelope packing, encryption, and key rotation.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::time::{Duration, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};

use rpcmesh_core::crypto::{CryptoKey, CryptoSettings};
use rpcmesh_core::protocol::codec::MAX_DEPTH;
use rpcmesh_core::protocol::{pack, unpack, Envelope, Timestamp, Value};
use rpcmesh_core::ErrorKind;

fn shapes() -> Vec<Value> {
    vec![
        Value::Int(-42),
        Value::Int(i64::MAX),
        Value::Float(3.25),
        Value::Str("héllo".into()),
        Value::Bool(true),
        Value::Null,
        Value::Absent,
        Value::Bytes(Bytes::from_static(&[0, 255, 1, 254, 0])),
        Value::Timestamp(Timestamp::new(1_700_000_000, 123_456_789).unwrap()),
        Value::List(vec![Value::Null, Value::Absent, Value::Int(1)]),
        Value::map([
            ("a", Value::Absent),
            ("b", Value::Null),
            ("nested", Value::map([("list", Value::List(vec![Value::from("x")]))])),
        ]),
    ]
}

#[test]
fn plain_roundtrip_all_shapes() {
    for v in shapes() {
        let env = pack(&v, false, None).unwrap();
        assert!(!env.encrypted);
        assert_eq!(unpack(&env, None).unwrap(), v, "shape={}", v.type_name());
    }
}

#[test]
fn null_and_absent_stay_distinct() {
    let null = pack(&Value::Null, false, None).unwrap();
    let absent = pack(&Value::Absent, false, None).unwrap();
    assert_ne!(null.payload, absent.payload);
    assert_eq!(unpack(&null, None).unwrap(), Value::Null);
    assert_eq!(unpack(&absent, None).unwrap(), Value::Absent);
}

#[test]
fn timestamp_keeps_nanoseconds() {
    let t = UNIX_EPOCH + Duration::new(1_650_000_000, 999_999_999);
    let env = pack(&Value::from(t), false, None).unwrap();
    match unpack(&env, None).unwrap() {
        Value::Timestamp(ts) => assert_eq!(ts.to_system_time(), t),
        other => panic!("expected timestamp, got {other:?}"),
    }

    let before_epoch = UNIX_EPOCH - Duration::new(10, 250);
    let ts = Timestamp::from(before_epoch);
    assert_eq!(ts.to_system_time(), before_epoch);
}

#[test]
fn encrypted_roundtrip_all_shapes() {
    let settings = CryptoSettings::new(vec![CryptoKey::generate()]);
    for v in shapes() {
        let env = pack(&v, true, Some(&settings)).unwrap();
        assert!(env.encrypted);
        assert_eq!(env.key_hint, settings.primary().map(|k| k.fingerprint()));
        assert_eq!(unpack(&env, Some(&settings)).unwrap(), v);
    }
}

#[test]
fn envelope_never_contains_the_key() {
    let key_bytes = [0x5au8; 32];
    let settings = CryptoSettings::new(vec![CryptoKey::from_bytes(key_bytes)]);
    let env = pack(&Value::from("secret payload"), true, Some(&settings)).unwrap();

    let mut wire = BytesMut::new();
    env.encode_into(&mut wire).unwrap();
    assert!(!wire.windows(key_bytes.len()).any(|w| w == key_bytes));
    assert!(!wire.windows(6).any(|w| w == b"secret"));
}

#[test]
fn old_envelopes_survive_rotation() {
    let old = CryptoKey::generate();
    let before = CryptoSettings::new(vec![old.clone()]);
    let env = pack(&Value::from("written before rotation"), true, Some(&before)).unwrap();

    let mut after = before.clone();
    after.rotate(CryptoKey::generate());
    assert_ne!(after.primary(), Some(&old));

    assert_eq!(unpack(&env, Some(&after)).unwrap(), Value::from("written before rotation"));

    // New data is sealed with the new primary, which the old settings cannot open.
    let fresh = pack(&Value::Int(1), true, Some(&after)).unwrap();
    let err = unpack(&fresh, Some(&before)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decryption);
}

#[test]
fn foreign_keys_fail_with_decryption_error() {
    let settings = CryptoSettings::new(vec![CryptoKey::generate()]);
    let env = pack(&Value::Int(7), true, Some(&settings)).unwrap();

    let strangers = CryptoSettings::new(vec![CryptoKey::generate(), CryptoKey::generate()]);
    let err = unpack(&env, Some(&strangers)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decryption);

    let err = unpack(&env, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decryption);
}

#[test]
fn tampered_ciphertext_is_rejected() {
    let settings = CryptoSettings::new(vec![CryptoKey::generate()]);
    let env = pack(&Value::Int(7), true, Some(&settings)).unwrap();
    let mut raw = env.payload.to_vec();
    let last = raw.len() - 1;
    raw[last] ^= 0x01;
    let tampered = Envelope {
        payload: Bytes::from(raw),
        ..env
    };
    assert_eq!(unpack(&tampered, Some(&settings)).unwrap_err().kind(), ErrorKind::Decryption);
}

#[test]
fn encrypt_without_keys_packs_in_the_clear() {
    let env = pack(&Value::Int(3), true, None).unwrap();
    assert!(!env.encrypted);
    let empty = CryptoSettings::default();
    let env = pack(&Value::Int(3), true, Some(&empty)).unwrap();
    assert!(!env.encrypted);
    assert_eq!(unpack(&env, Some(&empty)).unwrap(), Value::Int(3));
}

#[test]
fn envelope_wire_form_roundtrips() {
    let settings = CryptoSettings::new(vec![CryptoKey::generate()]);
    let env = pack(&Value::from(vec![1u8, 2, 3]), true, Some(&settings)).unwrap();
    let mut wire = BytesMut::new();
    env.encode_into(&mut wire).unwrap();
    let mut wire = wire.freeze();
    assert_eq!(Envelope::decode_from(&mut wire).unwrap(), env);
    assert!(wire.is_empty());
}

fn nested(depth: usize) -> Value {
    let mut v = Value::Int(7);
    for _ in 0..depth {
        v = Value::List(vec![v]);
    }
    v
}

#[test]
fn pack_and_unpack_agree_on_nesting_limit() {
    let deepest = nested(MAX_DEPTH);
    let env = pack(&deepest, false, None).unwrap();
    assert_eq!(unpack(&env, None).unwrap(), deepest);

    let too_deep = nested(MAX_DEPTH + 1);
    let err = pack(&too_deep, false, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Codec);

    // One list header per level, count 1, little-endian.
    let mut raw = BytesMut::new();
    for _ in 0..=MAX_DEPTH {
        raw.extend_from_slice(&[0x09, 1, 0, 0, 0]);
    }
    raw.extend_from_slice(&pack(&Value::Int(7), false, None).unwrap().payload);
    let hand_built = Envelope::plain(raw.freeze());
    assert_eq!(unpack(&hand_built, None).unwrap_err().kind(), ErrorKind::Codec);
}
