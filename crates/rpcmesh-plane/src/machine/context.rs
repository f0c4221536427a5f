//! Machine-side runtime: one connection to the control plane, hosting
//! services and issuing calls over it.
//!
//! Frame handling on the reader task never blocks: results resolve oneshots,
//! acks resolve oneshots, and inbound calls are dispatched on their own task.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::Instrument;

use rpcmesh_core::crypto::{CryptoKey, CryptoSettings};
use rpcmesh_core::error::{ErrorDescriptor, ErrorKind, Result, RpcError};
use rpcmesh_core::protocol::{pack, unpack, Call, CallId, CallIdGen, CallResult, ConnectionId, Frame, Handshake};
use rpcmesh_core::retry::{PatternClassifier, RetryPredictor};

use crate::config::MachineSection;
use crate::machine::client::ServiceClient;
use crate::machine::correlator::Correlator;
use crate::machine::errors::{ErrorRegistry, HandlerError, RemoteErrorKind};
use crate::machine::service::{CallCtx, LocalService, Service, ServiceHandle};
use crate::transport::{write_frames, Link};

/// How long to wait for `Welcome` after sending `Hello`.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a connected machine. Cheap to clone; the connection closes when
/// [`RpcContext::close`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct RpcContext {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) cfg: MachineSection,
    machine_id: String,
    connection_id: ConnectionId,
    crypto: RwLock<Arc<CryptoSettings>>,
    pub(crate) out_tx: mpsc::Sender<Frame>,
    pub(crate) ids: CallIdGen,
    pub(crate) pending: Correlator,
    services: DashMap<String, Arc<LocalService>>,
    /// (service, up) -> waiter for the plane's acknowledgement
    acks: DashMap<(String, bool), oneshot::Sender<()>>,
    /// running handlers, keyed by the call they serve
    handlers: DashMap<CallId, oneshot::Sender<()>>,
    pub(crate) errors: ErrorRegistry,
    pub(crate) predictor: Arc<dyn RetryPredictor>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcContext {
    /// Handshake over `link` and start the reader and writer tasks.
    pub async fn connect(link: Link, cfg: MachineSection) -> Result<Self> {
        Self::connect_with_predictor(link, cfg, Arc::new(PatternClassifier)).await
    }

    pub async fn connect_with_predictor(
        mut link: Link,
        cfg: MachineSection,
        predictor: Arc<dyn RetryPredictor>,
    ) -> Result<Self> {
        cfg.validate()?;
        let crypto = cfg.crypto_settings()?;
        let machine_id = cfg
            .machine_id
            .clone()
            .unwrap_or_else(|| format!("{}-{:016x}", cfg.machine_type, rand::random::<u64>()));

        let hello = Handshake {
            machine_id: machine_id.clone(),
            machine_type: cfg.machine_type.clone(),
            deployment_id: cfg.deployment_id.clone(),
            environment: cfg.environment.clone(),
            access_key: cfg.access_key.clone(),
            proof: Handshake::proof_for(&cfg.secret, &machine_id),
        };
        link.send(Frame::Hello(hello).encode()?)
            .await
            .map_err(|_| RpcError::Transport("link closed before hello".into()))?;

        let reply = timeout(CONNECT_TIMEOUT, link.recv())
            .await
            .map_err(|_| RpcError::Timeout("no welcome from control plane".into()))?
            .ok_or_else(|| RpcError::Transport("control plane closed during handshake".into()))?;
        let connection_id = match Frame::decode(reply)? {
            Frame::Welcome { connection_id } => connection_id,
            Frame::Rejected { reason } => return Err(RpcError::Auth(reason.into())),
            other => {
                return Err(RpcError::Codec(format!("expected welcome, got {}", other.kind_str()).into()));
            }
        };

        let (link_tx, link_rx) = link.split();
        let (out_tx, out_rx) = mpsc::channel::<Frame>(cfg.outbound_queue);
        let inner = Arc::new(Inner {
            cfg,
            machine_id,
            connection_id,
            crypto: RwLock::new(Arc::new(crypto)),
            out_tx,
            ids: CallIdGen::new(),
            pending: Correlator::new(),
            services: DashMap::new(),
            acks: DashMap::new(),
            handlers: DashMap::new(),
            errors: ErrorRegistry::new(),
            predictor,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let span = tracing::info_span!("machine", machine = %inner.machine_id, conn = %connection_id);
        let writer = tokio::spawn(write_frames(out_rx, link_tx).instrument(span.clone()));
        let reader = tokio::spawn(read_frames(Arc::downgrade(&inner), link_rx).instrument(span));
        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.push(writer);
            tasks.push(reader);
        }

        tracing::info!(machine = %inner.machine_id, conn = %connection_id, "connected to control plane");
        Ok(Self { inner })
    }

    pub fn machine_id(&self) -> &str {
        &self.inner.machine_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection_id
    }

    pub fn config(&self) -> &MachineSection {
        &self.inner.cfg
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Calls issued from this machine still waiting for a result.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Add a service to this machine. It is not routable until started.
    pub fn register<S: Service>(&self, service: S) -> Result<ServiceHandle> {
        let local = Arc::new(LocalService::new(Arc::new(service)));
        match self.inner.services.entry(local.name.to_string()) {
            Entry::Occupied(_) => Err(RpcError::Config(format!(
                "service {} is already registered",
                local.name
            ).into())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&local));
                Ok(ServiceHandle::new(self.clone(), local))
            }
        }
    }

    /// Proxy for calling `service` wherever it runs.
    pub fn client(&self, service: impl Into<String>) -> ServiceClient {
        ServiceClient::new(self.clone(), service.into())
    }

    /// Rebuild errors named `E::NAME` as `E` when they reach this machine.
    pub fn register_error<E: RemoteErrorKind>(&self) {
        self.inner.errors.register::<E>();
    }

    /// Make `key` the primary key. Older keys still decrypt.
    pub fn rotate_key(&self, key: CryptoKey) {
        let mut guard = match self.inner.crypto.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = CryptoSettings::clone(&guard);
        next.rotate(key);
        *guard = Arc::new(next);
    }

    pub(crate) fn crypto(&self) -> Arc<CryptoSettings> {
        match self.inner.crypto.read() {
            Ok(g) => Arc::clone(&g),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub(crate) fn inner(&self) -> &Inner {
        &self.inner
    }

    /// Stop every started service, then drop the connection. Outstanding calls
    /// fail with `TransportError`.
    pub async fn close(&self) {
        let handles: Vec<ServiceHandle> = self
            .inner
            .services
            .iter()
            .filter(|s| s.value().is_started())
            .map(|s| ServiceHandle::new(self.clone(), Arc::clone(s.value())))
            .collect();
        for handle in handles {
            if let Err(e) = handle.stop().await {
                tracing::warn!(service = handle.name(), error = %e, "stop during close failed");
            }
        }

        let tasks = match self.inner.tasks.lock() {
            Ok(mut t) => std::mem::take(&mut *t),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
        self.connection_lost("context closed");
    }

    /// Send `ServiceUp` (with functions) or `ServiceDown` and wait for the ack.
    pub(crate) async fn announce(&self, service: &str, functions: Option<Vec<String>>) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::Transport("connection to control plane is closed".into()));
        }
        let up = functions.is_some();
        let key = (service.to_string(), up);
        let (tx, rx) = oneshot::channel();
        self.inner.acks.insert(key.clone(), tx);

        let frame = match functions {
            Some(functions) => Frame::ServiceUp { service: service.to_string(), functions },
            None => Frame::ServiceDown { service: service.to_string() },
        };
        if self.inner.out_tx.send(frame).await.is_err() {
            self.inner.acks.remove(&key);
            return Err(RpcError::Transport("outbound queue closed".into()));
        }

        match timeout(self.inner.cfg.call_timeout(), rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RpcError::Transport(format!("connection lost before ack for {service}").into())),
            Err(_) => {
                self.inner.acks.remove(&key);
                Err(RpcError::Timeout(format!("no ack for service {service}").into()))
            }
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Result(result) => {
                let call_id = result.call_id;
                if !self.inner.pending.resolve(result) {
                    tracing::debug!(call = %call_id, "dropping late or unknown result");
                }
            }
            Frame::Call(call) => self.dispatch(call),
            Frame::Cancel { call_id } => {
                if let Some((_, abort)) = self.inner.handlers.remove(&call_id) {
                    tracing::debug!(call = %call_id, "handler cancelled");
                    let _ = abort.send(());
                }
            }
            Frame::ServiceAck { service, up } => {
                if let Some((_, tx)) = self.inner.acks.remove(&(service, up)) {
                    let _ = tx.send(());
                }
            }
            other => tracing::warn!(kind = other.kind_str(), "unexpected frame from control plane"),
        }
    }

    fn dispatch(&self, call: Call) {
        // Registered before the task starts so an early Cancel still finds it.
        let (abort_tx, abort_rx) = oneshot::channel::<()>();
        self.inner.handlers.insert(call.call_id, abort_tx);

        let ctx = self.clone();
        let span = tracing::debug_span!(
            "handle_call",
            call = %call.call_id,
            service = %call.service,
            function = %call.function
        );
        tokio::spawn(
            async move {
                let call_id = call.call_id;
                let outcome = tokio::select! {
                    _ = abort_rx => None,
                    res = ctx.invoke_local(&call) => Some(res),
                };
                ctx.inner.handlers.remove(&call_id);
                if let Some(result) = outcome {
                    if ctx.inner.out_tx.send(Frame::Result(result)).await.is_err() {
                        tracing::debug!(call = %call_id, "connection gone before result");
                    }
                }
            }
            .instrument(span),
        );
    }

    async fn invoke_local(&self, call: &Call) -> CallResult {
        let call_id = call.call_id;
        let local = self.inner.services.get(&call.service).map(|s| Arc::clone(s.value()));
        let Some(local) = local else {
            let desc = ErrorDescriptor::runtime(
                ErrorKind::Routing,
                format!("service {} is not hosted on {}", call.service, self.inner.machine_id),
            );
            return CallResult::err(call_id, desc);
        };
        let Some(_running) = local.enter() else {
            let desc = ErrorDescriptor::runtime(ErrorKind::Routing, format!("service {} is stopped", call.service));
            return CallResult::err(call_id, desc);
        };

        let crypto = self.crypto();
        let mut args = Vec::with_capacity(call.args.len());
        for env in &call.args {
            match unpack(env, Some(&crypto)) {
                Ok(v) => args.push(v),
                Err(e) => {
                    tracing::warn!(error = %e, "argument decode failed");
                    return CallResult::err(call_id, e.to_descriptor());
                }
            }
        }

        let where_ = format!("{}.{} on {}", call.service, call.function, self.inner.machine_id);
        let cctx = CallCtx::new(call_id, Arc::clone(&local.name), Arc::from(call.function.as_str()), self.clone());
        let handled = AssertUnwindSafe(local.service.call(cctx, &call.function, args))
            .catch_unwind()
            .await;

        match handled {
            Ok(Ok(value)) => match pack(&value, self.inner.cfg.crypto.encrypt, Some(&crypto)) {
                Ok(env) => CallResult::ok(call_id, env),
                Err(e) => CallResult::err(call_id, e.to_descriptor()),
            },
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "handler failed");
                CallResult::err(call_id, e.into_descriptor(&where_))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(%message, "handler panicked");
                CallResult::err(call_id, HandlerError::new("PanicError", message).into_descriptor(&where_))
            }
        }
    }

    fn connection_lost(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the ack senders wakes any start/stop still waiting.
        self.inner.acks.clear();
        let desc = ErrorDescriptor::runtime(ErrorKind::Transport, reason);
        let failed = self.inner.pending.fail_all(&desc);
        tracing::warn!(reason, failed, "connection to control plane lost");
    }
}

async fn read_frames(weak: Weak<Inner>, mut link_rx: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = link_rx.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        let ctx = RpcContext { inner };
        match Frame::decode(bytes) {
            Ok(frame) => ctx.handle_frame(frame),
            Err(e) => {
                tracing::warn!(error = %e, "undecodable frame from control plane");
                ctx.connection_lost("protocol error on control-plane link");
                return;
            }
        }
    }
    if let Some(inner) = weak.upgrade() {
        RpcContext { inner }.connection_lost("connection to control plane lost");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
