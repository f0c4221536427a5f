#![allow(dead_code)]

use std::time::Duration;

use tracing_subscriber::EnvFilter;

use rpcmesh_core::Value;
use rpcmesh_plane::config::{MachineSection, PlaneSection};
use rpcmesh_plane::machine::FnService;
use rpcmesh_plane::{define_service, ControlPlane, HandlerError, RpcContext, ServiceHandle};

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn plane() -> ControlPlane {
    plane_with(PlaneSection::default())
}

pub fn plane_with(cfg: PlaneSection) -> ControlPlane {
    init_tracing();
    ControlPlane::new(cfg).unwrap()
}

pub fn machine_cfg(machine_type: &str) -> MachineSection {
    let mut cfg = MachineSection::typed(machine_type);
    cfg.call_timeout_ms = 5_000;
    cfg.drain_timeout_ms = 2_000;
    cfg
}

/// Echoes its first argument back.
pub fn echo_service() -> FnService {
    define_service("echo").function("echo", |_ctx, args: Vec<Value>| async move {
        Ok::<_, HandlerError>(args.into_iter().next().unwrap_or_default())
    })
}

/// Connect a machine, register `service` on it and start it.
pub async fn host(plane: &ControlPlane, cfg: MachineSection, service: FnService) -> (RpcContext, ServiceHandle) {
    let ctx = plane.attach(cfg).await.unwrap();
    let handle = ctx.register(service).unwrap();
    handle.start().await.unwrap();
    (ctx, handle)
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
