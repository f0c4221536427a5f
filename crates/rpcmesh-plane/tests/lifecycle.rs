#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rpcmesh_core::{ErrorKind, RpcError, Value};
use rpcmesh_plane::config::{Credential, PlaneSection};
use rpcmesh_plane::{define_service, HandlerError};

use common::{echo_service, eventually, host, machine_cfg, plane, plane_with};

#[tokio::test]
async fn start_is_idempotent() {
    let plane = plane();
    let ctx = plane.attach(machine_cfg("worker")).await.unwrap();
    let svc = ctx.register(echo_service()).unwrap();
    assert!(!svc.is_started());

    svc.start().await.unwrap();
    svc.start().await.unwrap();
    assert!(svc.is_started());
    assert_eq!(plane.machines().services_of(ctx.connection_id()), vec!["echo".to_string()]);
}

#[tokio::test]
async fn registered_but_not_started_is_unroutable() {
    let plane = plane();
    let ctx = plane.attach(machine_cfg("worker")).await.unwrap();
    let _svc = ctx.register(echo_service()).unwrap();
    let caller = plane.attach(machine_cfg("client")).await.unwrap();

    let err = caller.client("echo").call::<Value>("echo", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Routing(_)), "{err:?}");
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let plane = plane();
    let ctx = plane.attach(machine_cfg("worker")).await.unwrap();
    ctx.register(echo_service()).unwrap();
    let err = ctx.register(echo_service()).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[tokio::test]
async fn stop_withdraws_and_start_restores() {
    let plane = plane();
    let (_host, svc) = host(&plane, machine_cfg("worker"), echo_service()).await;
    let caller = plane.attach(machine_cfg("client")).await.unwrap();
    let echo = caller.client("echo");

    assert_eq!(echo.call::<i64>("echo", vec![1i64.into()]).await.unwrap(), 1);
    svc.stop().await.unwrap();
    assert!(!svc.is_started());
    let err = echo.call::<i64>("echo", vec![1i64.into()]).await.unwrap_err();
    assert!(matches!(err, RpcError::Routing(_)), "{err:?}");

    svc.start().await.unwrap();
    assert_eq!(echo.call::<i64>("echo", vec![2i64.into()]).await.unwrap(), 2);
}

#[tokio::test]
async fn stop_waits_for_running_handlers() {
    let plane = plane();
    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    let slow = define_service("slow").function("work", move |_ctx, _args| {
        let flag = Arc::clone(&flag);
        async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            flag.store(true, Ordering::SeqCst);
            Ok::<_, HandlerError>("done")
        }
    });
    let (_host, svc) = host(&plane, machine_cfg("worker"), slow).await;
    let caller = plane.attach(machine_cfg("client")).await.unwrap();

    let client = caller.client("slow");
    let call = tokio::spawn(async move { client.call::<String>("work", vec![]).await });
    assert!(eventually(|| svc.in_flight() == 1).await);

    svc.stop().await.unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(svc.in_flight(), 0);
    assert_eq!(call.await.unwrap().unwrap(), "done");
}

#[tokio::test]
async fn drain_deadline_does_not_abort_handlers() {
    let plane = plane();
    let slow = define_service("slow").function("work", |_ctx, _args| async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        Ok::<_, HandlerError>(5i64)
    });
    let mut cfg = machine_cfg("worker");
    cfg.drain_timeout_ms = 50;
    let (_host, svc) = host(&plane, cfg, slow).await;
    let caller = plane.attach(machine_cfg("client")).await.unwrap();

    let client = caller.client("slow");
    let call = tokio::spawn(async move { client.call::<i64>("work", vec![]).await });
    assert!(eventually(|| svc.in_flight() == 1).await);

    svc.stop().await.unwrap();
    assert_eq!(svc.in_flight(), 1);
    assert_eq!(call.await.unwrap().unwrap(), 5);
}

#[tokio::test]
async fn handlers_run_concurrently() {
    let plane = plane();
    let slow = define_service("slow").function("work", |_ctx, _args| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok::<_, HandlerError>(())
    });
    let (_host, _svc) = host(&plane, machine_cfg("worker"), slow).await;
    let caller = plane.attach(machine_cfg("client")).await.unwrap();
    let client = caller.client("slow");

    let started = tokio::time::Instant::now();
    let calls = (0..20).map(|_| client.call::<()>("work", vec![]));
    for r in futures_util::future::join_all(calls).await {
        r.unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(1500));
}

fn secured_plane() -> rpcmesh_plane::ControlPlane {
    plane_with(PlaneSection {
        credentials: vec![Credential {
            access_key: "ak-1".into(),
            secret: "s3cret".into(),
            environment: "default".into(),
        }],
        machine_types: vec!["worker".into(), "client".into()],
        ..PlaneSection::default()
    })
}

#[tokio::test]
async fn valid_credentials_are_admitted() {
    let plane = secured_plane();
    let mut cfg = machine_cfg("worker");
    cfg.access_key = "ak-1".into();
    cfg.secret = "s3cret".into();
    let ctx = plane.attach(cfg).await.unwrap();
    assert!(plane.machines().contains(ctx.connection_id()));
    assert_eq!(plane.metrics().machines_active.get(), 1);
}

#[tokio::test]
async fn bad_credentials_are_rejected() {
    let plane = secured_plane();

    let mut wrong_secret = machine_cfg("worker");
    wrong_secret.access_key = "ak-1".into();
    wrong_secret.secret = "guess".into();
    let err = plane.attach(wrong_secret).await.err().unwrap();
    assert!(matches!(err, RpcError::Auth(_)), "{err:?}");

    let mut unknown = machine_cfg("worker");
    unknown.access_key = "ak-2".into();
    unknown.secret = "s3cret".into();
    assert!(matches!(plane.attach(unknown).await, Err(RpcError::Auth(_))));

    let mut wrong_type = machine_cfg("intruder");
    wrong_type.access_key = "ak-1".into();
    wrong_type.secret = "s3cret".into();
    assert!(matches!(plane.attach(wrong_type).await, Err(RpcError::Auth(_))));

    assert!(plane.machines().is_empty());
    assert_eq!(plane.metrics().handshake_rejections.total(), 3);
}

#[tokio::test]
async fn metrics_render_after_traffic() {
    let plane = plane();
    let (_host, _svc) = host(&plane, machine_cfg("worker"), echo_service()).await;
    let caller = plane.attach(machine_cfg("client")).await.unwrap();
    let _: i64 = caller.client("echo").call("echo", vec![3i64.into()]).await.unwrap();
    let _ = caller.client("nope").call::<Value>("x", vec![]).await;
    assert!(eventually(|| plane.metrics().results_delivered.total() == 1).await);

    let text = plane.metrics().render();
    assert!(text.contains("rpcmesh_machines_active 2"), "{text}");
    assert!(text.contains("rpcmesh_calls_routed_total{function=\"echo\",service=\"echo\"} 1"), "{text}");
    assert!(text.contains("rpcmesh_routing_failures_total{service=\"nope\"} 1"), "{text}");
    assert!(text.contains("rpcmesh_results_delivered_total{} 1"), "{text}");
}

#[tokio::test]
async fn close_fails_outstanding_calls_locally() {
    let plane = plane();
    let caller = plane.attach(machine_cfg("client")).await.unwrap();
    caller.close().await;
    assert!(caller.is_closed());

    let err = caller.client("echo").call::<Value>("echo", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Transport(_)), "{err:?}");
    assert!(eventually(|| plane.machines().is_empty()).await);
}
