//! Control-plane runtime.
//!
//! Responsibilities:
//! - Admit machines (handshake) and record their identity per connection
//! - Track which services/functions each connection offers
//! - Route calls to an eligible instance and carry results back exactly once
//! - Fail calls whose target disconnects; cancel calls whose caller does

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tracing::Instrument;

use rpcmesh_core::error::{ErrorDescriptor, ErrorKind, Result, RpcError};
use rpcmesh_core::protocol::{Call, CallId, CallResult, ConnectionId, Frame, Handshake};

use crate::config::{MachineSection, PlaneSection};
use crate::control::handshake::admit;
use crate::control::inflight::{Inflight, InflightTable};
use crate::control::registry::{Connection, MachineInfo, MachineRegistry};
use crate::machine::RpcContext;
use crate::obs::PlaneMetrics;
use crate::transport::{link_pair, write_frames, Link};

/// How long a new connection has to present its `Hello`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared control plane. Cheap to clone.
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<PlaneInner>,
}

struct PlaneInner {
    cfg: PlaneSection,
    machines: MachineRegistry,
    inflight: InflightTable,
    metrics: PlaneMetrics,
    next_conn: AtomicU64,
    /// Woken whenever a service comes up (bounded routing waits).
    services_changed: Notify,
}

impl ControlPlane {
    pub fn new(cfg: PlaneSection) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            inner: Arc::new(PlaneInner {
                cfg,
                machines: MachineRegistry::new(),
                inflight: InflightTable::new(),
                metrics: PlaneMetrics::default(),
                next_conn: AtomicU64::new(1),
                services_changed: Notify::new(),
            }),
        })
    }

    pub fn machines(&self) -> &MachineRegistry {
        &self.inner.machines
    }

    pub fn inflight(&self) -> &InflightTable {
        &self.inner.inflight
    }

    pub fn metrics(&self) -> &PlaneMetrics {
        &self.inner.metrics
    }

    /// Serve one connection until its link closes.
    pub fn accept(&self, link: Link) -> JoinHandle<()> {
        let conn_id = ConnectionId(self.inner.next_conn.fetch_add(1, Ordering::Relaxed));
        let plane = self.clone();
        let span = tracing::info_span!("plane_session", conn = %conn_id);
        tokio::spawn(
            async move {
                if let Err(e) = plane.run_session(conn_id, link).await {
                    tracing::warn!(error = %e, "session ended with error");
                }
            }
            .instrument(span),
        )
    }

    /// Connect an in-process machine to this plane.
    pub async fn attach(&self, cfg: MachineSection) -> Result<RpcContext> {
        let (plane_end, machine_end) = link_pair(self.inner.cfg.outbound_queue);
        self.accept(plane_end);
        RpcContext::connect(machine_end, cfg).await
    }

    // --------------------
    // Session loop
    // --------------------
    async fn run_session(&self, conn_id: ConnectionId, mut link: Link) -> Result<()> {
        // ---- handshake
        let first = timeout(HANDSHAKE_TIMEOUT, link.recv())
            .await
            .map_err(|_| RpcError::Timeout("no hello within handshake timeout".into()))?
            .ok_or_else(|| RpcError::Transport("closed before hello".into()))?;
        let hello = match Frame::decode(first)? {
            Frame::Hello(h) => h,
            other => {
                return Err(RpcError::Codec(format!("expected hello, got {}", other.kind_str()).into()));
            }
        };
        if let Err(e) = admit(&self.inner.cfg, &hello) {
            self.inner.metrics.handshake_rejections.inc(&[("reason", e.kind().as_str())]);
            tracing::warn!(machine = %hello.machine_id, error = %e, "handshake rejected");
            let rejected = Frame::Rejected { reason: e.to_string() }.encode()?;
            let _ = link.send(rejected).await;
            return Err(e);
        }

        // ---- outbound writer
        let (link_tx, mut link_rx) = link.split();
        let (out_tx, out_rx) = mpsc::channel::<Frame>(self.inner.cfg.outbound_queue);
        tokio::spawn(write_frames(out_rx, link_tx).in_current_span());

        self.register_machine(conn_id, hello, Connection { tx: out_tx.clone() });
        out_tx
            .send(Frame::Welcome { connection_id: conn_id })
            .await
            .map_err(|_| RpcError::Transport("outbound queue closed".into()))?;

        // ---- inbound reader
        let outcome = loop {
            let Some(bytes) = link_rx.recv().await else { break Ok(()); };
            match Frame::decode(bytes) {
                Ok(frame) => self.handle_frame(conn_id, &out_tx, frame).await,
                Err(e) => break Err(e),
            }
        };

        self.disconnect(conn_id).await;
        outcome
    }

    fn register_machine(&self, conn_id: ConnectionId, hello: Handshake, conn: Connection) {
        tracing::info!(
            machine = %hello.machine_id,
            machine_type = %hello.machine_type,
            deployment = ?hello.deployment_id,
            environment = %hello.environment,
            "machine connected"
        );
        self.inner.machines.insert(
            MachineInfo {
                connection_id: conn_id,
                machine_id: hello.machine_id,
                machine_type: hello.machine_type,
                deployment_id: hello.deployment_id,
                environment: hello.environment,
            },
            conn,
        );
        self.inner.metrics.machines_active.inc();
    }

    async fn handle_frame(&self, conn_id: ConnectionId, out: &mpsc::Sender<Frame>, frame: Frame) {
        match frame {
            Frame::ServiceUp { service, functions } => {
                tracing::info!(%service, functions = functions.len(), "service up");
                self.inner.machines.add_service(conn_id, &service, functions);
                self.inner.services_changed.notify_waiters();
                let _ = out.send(Frame::ServiceAck { service, up: true }).await;
            }
            Frame::ServiceDown { service } => {
                tracing::info!(%service, "service down");
                self.inner.machines.remove_service(conn_id, &service);
                let _ = out.send(Frame::ServiceAck { service, up: false }).await;
            }
            Frame::Call(call) if self.inner.cfg.route_wait_ms == 0 => {
                self.route_call(conn_id, out, call).await
            }
            Frame::Call(call) => {
                // A bounded wait must not hold up the rest of this connection.
                let plane = self.clone();
                let out = out.clone();
                tokio::spawn(
                    async move { plane.route_call(conn_id, &out, call).await }.in_current_span(),
                );
            }
            Frame::Result(result) => self.deliver_result(conn_id, result).await,
            Frame::Cancel { call_id } => self.cancel_call(conn_id, call_id).await,
            other => {
                tracing::warn!(kind = other.kind_str(), "unexpected frame from machine");
            }
        }
    }

    // --------------------
    // Routing
    // --------------------
    async fn route_call(&self, caller: ConnectionId, out: &mpsc::Sender<Frame>, call: Call) {
        let call_id = call.call_id;
        let Some(info) = self.inner.machines.info(caller) else { return; };

        let target = match self.route(&call, &info.environment).await {
            Ok(t) => t,
            Err(e) => {
                self.inner.metrics.routing_failures.inc(&[("service", call.service.as_str())]);
                tracing::warn!(
                    service = %call.service,
                    function = %call.function,
                    machine_type = ?call.machine_type,
                    deployment = ?call.deployment_id,
                    "no eligible instance"
                );
                let _ = out.send(Frame::Result(CallResult::err(call_id, e.to_descriptor()))).await;
                return;
            }
        };

        if !self.inner.inflight.insert(call_id, Inflight { caller, target }) {
            self.inner.metrics.routing_failures.inc(&[("service", call.service.as_str())]);
            tracing::warn!(call = %call_id, service = %call.service, "call id already in flight");
            let desc = ErrorDescriptor::runtime(ErrorKind::Routing, format!("call id {call_id} is already in flight"));
            let _ = out.send(Frame::Result(CallResult::err(call_id, desc))).await;
            return;
        }
        let labels = [("service", call.service.as_str()), ("function", call.function.as_str())];
        self.inner.metrics.calls_routed.inc(&labels);
        tracing::debug!(call = %call_id, service = %call.service, function = %call.function, %target, "routed");

        // The target may have vanished between selection and insert.
        let conn = self.inner.machines.connection(target);
        let sent = match conn {
            Some(conn) => conn.tx.send(Frame::Call(call)).await.is_ok(),
            None => false,
        };
        if !sent && self.inner.inflight.complete(call_id, target).is_some() {
            self.fail_to_caller(caller, call_id, "target machine disconnected before dispatch").await;
        }
    }

    /// Choose a target, waiting up to `route_wait_ms` for one to appear.
    async fn route(&self, call: &Call, environment: &str) -> Result<ConnectionId> {
        let deadline = Instant::now() + self.inner.cfg.route_wait();
        loop {
            // Register interest before checking so a concurrent service-up is not missed.
            let changed = self.inner.services_changed.notified();
            if let Some(target) = self.inner.machines.select(call, environment) {
                return Ok(target);
            }
            if Instant::now() >= deadline {
                return Err(RpcError::Routing(format!(
                    "no eligible instance for {}.{}",
                    call.service, call.function
                ).into()));
            }
            let _ = timeout_at(deadline, changed).await;
        }
    }

    async fn deliver_result(&self, from: ConnectionId, result: CallResult) {
        let call_id = result.call_id;
        let Some(entry) = self.inner.inflight.complete(call_id, from) else {
            self.inner.metrics.late_results.inc(&[]);
            tracing::debug!(call = %call_id, "dropping late or unknown result");
            return;
        };
        match self.inner.machines.connection(entry.caller) {
            Some(conn) => {
                if conn.tx.send(Frame::Result(result)).await.is_ok() {
                    self.inner.metrics.results_delivered.inc(&[]);
                }
            }
            None => tracing::debug!(call = %call_id, "caller gone before result"),
        }
    }

    async fn cancel_call(&self, caller: ConnectionId, call_id: CallId) {
        let Some(entry) = self.inner.inflight.cancel(call_id, caller) else { return; };
        self.inner.metrics.cancellations.inc(&[]);
        if let Some(conn) = self.inner.machines.connection(entry.target) {
            let _ = conn.tx.send(Frame::Cancel { call_id }).await;
        }
    }

    async fn fail_to_caller(&self, caller: ConnectionId, call_id: CallId, message: &str) {
        self.inner.metrics.transport_failures.inc(&[]);
        let desc = ErrorDescriptor::runtime(ErrorKind::Transport, message);
        if let Some(conn) = self.inner.machines.connection(caller) {
            let _ = conn.tx.send(Frame::Result(CallResult::err(call_id, desc))).await;
        }
    }

    // --------------------
    // Disconnect
    // --------------------
    async fn disconnect(&self, conn_id: ConnectionId) {
        // Remove from routing first so no new call can pick this machine.
        let Some(info) = self.inner.machines.remove(conn_id) else { return; };
        self.inner.metrics.machines_active.dec();

        let failed = self.inner.inflight.drain_target(conn_id);
        let message = format!("machine {} disconnected", info.machine_id);
        for (call_id, caller) in &failed {
            self.fail_to_caller(*caller, *call_id, &message).await;
        }

        let abandoned = self.inner.inflight.drain_caller(conn_id);
        for (call_id, target) in &abandoned {
            if let Some(conn) = self.inner.machines.connection(*target) {
                let _ = conn.tx.send(Frame::Cancel { call_id: *call_id }).await;
            }
        }

        tracing::info!(
            machine = %info.machine_id,
            failed = failed.len(),
            abandoned = abandoned.len(),
            "machine disconnected"
        );
    }
}
