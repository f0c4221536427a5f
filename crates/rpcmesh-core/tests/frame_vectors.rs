//! Frame decoding vector tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::fs;

use bytes::Bytes;

use rpcmesh_core::protocol::{
    pack, Call, CallId, CallResult, ConnectionId, Frame, Handshake, Value,
};
use rpcmesh_core::ErrorDescriptor;

use vector_loader::TestVector;

fn load(name: &str) -> TestVector {
    let s = fs::read_to_string(format!("tests/vectors/{name}")).unwrap();
    serde_json::from_str(&s).unwrap()
}

#[test]
fn frame_vectors() {
    let files = [
        "frame_welcome.json",
        "frame_cancel.json",
        "frame_bad_version.json",
        "frame_truncated_call_id.json",
        "frame_unknown_kind.json",
        "frame_trailing_bytes.json",
    ];

    for f in files {
        let v = load(f);
        let res = Frame::decode(Bytes::from(v.frame.decode()));

        if let Some(err) = v.expect_error {
            let e = res.expect_err("expected error");
            assert_eq!(e.kind().as_str(), err.code, "vector={}", v.description);
            continue;
        }

        let frame = res.expect("expected ok frame");
        let ex = v.expect.expect("missing expect block");
        assert_eq!(frame.kind_str(), ex["kind"].as_str().unwrap(), "vector={}", v.description);

        match frame {
            Frame::Welcome { connection_id } => {
                assert_eq!(connection_id, ConnectionId(ex["connection_id"].as_u64().unwrap()));
            }
            Frame::Cancel { call_id } => {
                assert_eq!(call_id, CallId(ex["call_id"].as_u64().unwrap() as u128));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

#[test]
fn call_and_result_frames_survive_the_wire() {
    let call = Frame::Call(Call {
        call_id: CallId(u128::MAX - 3),
        service: "counter".into(),
        function: "incr".into(),
        args: vec![
            pack(&Value::Int(5), false, None).unwrap(),
            pack(&Value::Absent, false, None).unwrap(),
        ],
        machine_type: Some("counter".into()),
        deployment_id: None,
    });
    assert_eq!(Frame::decode(call.encode().unwrap()).unwrap(), call);

    let failed = Frame::Result(CallResult::err(
        CallId(9),
        ErrorDescriptor::new("NotFound", "no such key").with_stack("    at counter.get"),
    ));
    assert_eq!(Frame::decode(failed.encode().unwrap()).unwrap(), failed);
}

#[test]
fn hello_proof_verifies_only_with_the_right_secret() {
    let hello = Handshake {
        machine_id: "m-1".into(),
        machine_type: "greeter".into(),
        deployment_id: Some("v2".into()),
        environment: "prod".into(),
        access_key: "ak".into(),
        proof: Handshake::proof_for("s3cret", "m-1"),
    };
    assert!(hello.verify("s3cret"));
    assert!(!hello.verify("other"));
    assert!(!hello.proof.contains("s3cret"));

    let frame = Frame::Hello(hello);
    assert_eq!(Frame::decode(frame.encode().unwrap()).unwrap(), frame);
}
