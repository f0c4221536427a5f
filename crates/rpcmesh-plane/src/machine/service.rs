//! Services: named function tables hosted by a machine.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};

use rpcmesh_core::error::{ErrorKind, Result};
use rpcmesh_core::protocol::{CallId, Value};

use crate::machine::context::RpcContext;
use crate::machine::errors::HandlerError;

/// A hosted service. The function table is fixed for the life of the value.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn functions(&self) -> Vec<String>;
    async fn call(&self, ctx: CallCtx, function: &str, args: Vec<Value>) -> std::result::Result<Value, HandlerError>;
}

/// Per-invocation context handed to handlers.
#[derive(Clone)]
pub struct CallCtx {
    call_id: CallId,
    service: Arc<str>,
    function: Arc<str>,
    rpc: RpcContext,
}

impl CallCtx {
    pub(crate) fn new(call_id: CallId, service: Arc<str>, function: Arc<str>, rpc: RpcContext) -> Self {
        Self { call_id, service, function, rpc }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// The hosting machine's context, for nested calls.
    pub fn rpc(&self) -> &RpcContext {
        &self.rpc
    }
}

type BoxedHandler =
    Arc<dyn Fn(CallCtx, Vec<Value>) -> BoxFuture<'static, std::result::Result<Value, HandlerError>> + Send + Sync>;

/// Service built from closures; the dispatch table is assembled once here.
pub struct FnService {
    name: String,
    table: HashMap<String, BoxedHandler>,
}

/// Start defining a closure-backed service.
pub fn define_service(name: impl Into<String>) -> FnService {
    FnService {
        name: name.into(),
        table: HashMap::new(),
    }
}

impl FnService {
    pub fn function<F, Fut, R>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallCtx, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
        R: Into<Value>,
    {
        let handler: BoxedHandler = Arc::new(
            move |ctx: CallCtx, args: Vec<Value>| -> BoxFuture<'static, std::result::Result<Value, HandlerError>> {
                f(ctx, args).map(|r| r.map(Into::into)).boxed()
            },
        );
        self.table.insert(name.into(), handler);
        self
    }
}

#[async_trait]
impl Service for FnService {
    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.keys().cloned().collect();
        names.sort();
        names
    }

    async fn call(&self, ctx: CallCtx, function: &str, args: Vec<Value>) -> std::result::Result<Value, HandlerError> {
        let handler = self.table.get(function).cloned().ok_or_else(|| {
            HandlerError::new(
                ErrorKind::Routing.as_str(),
                format!("{} has no function {function}", self.name),
            )
        })?;
        handler(ctx, args).await
    }
}

/// A service registered on a context, plus its lifecycle state.
pub(crate) struct LocalService {
    pub(crate) service: Arc<dyn Service>,
    pub(crate) name: Arc<str>,
    started: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    /// Serializes start/stop on this service.
    lifecycle: Mutex<()>,
}

impl LocalService {
    pub(crate) fn new(service: Arc<dyn Service>) -> Self {
        let name: Arc<str> = Arc::from(service.name());
        Self {
            service,
            name,
            started: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            lifecycle: Mutex::new(()),
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Count an invocation for draining. `None` if the service is stopped.
    pub(crate) fn enter(self: &Arc<Self>) -> Option<InvocationGuard> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if !self.is_started() {
            self.leave();
            return None;
        }
        Some(InvocationGuard { svc: Arc::clone(self) })
    }

    fn leave(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait for in-flight invocations to finish. Returns how many were still
    /// running at the deadline.
    async fn drain(&self, deadline: Instant) -> usize {
        loop {
            let idle = self.idle.notified();
            let running = self.in_flight();
            if running == 0 {
                return 0;
            }
            if timeout_at(deadline, idle).await.is_err() {
                return self.in_flight();
            }
        }
    }
}

/// Held for the duration of one handler invocation.
pub(crate) struct InvocationGuard {
    svc: Arc<LocalService>,
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        self.svc.leave();
    }
}

/// Lifecycle handle returned by [`RpcContext::register`].
#[derive(Clone)]
pub struct ServiceHandle {
    ctx: RpcContext,
    local: Arc<LocalService>,
}

impl ServiceHandle {
    pub(crate) fn new(ctx: RpcContext, local: Arc<LocalService>) -> Self {
        Self { ctx, local }
    }

    pub fn name(&self) -> &str {
        &self.local.name
    }

    pub fn is_started(&self) -> bool {
        self.local.is_started()
    }

    pub fn in_flight(&self) -> usize {
        self.local.in_flight()
    }

    /// Make the service routable. No-op if already started.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.local.lifecycle.lock().await;
        if self.local.is_started() {
            return Ok(());
        }
        self.local.started.store(true, Ordering::Release);
        let functions = self.local.service.functions();
        if let Err(e) = self.ctx.announce(&self.local.name, Some(functions)).await {
            self.local.started.store(false, Ordering::Release);
            return Err(e);
        }
        tracing::info!(service = %self.local.name, "service started");
        Ok(())
    }

    /// Withdraw the service and wait for running handlers to finish (up to the
    /// drain timeout). Running handlers are never aborted.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.local.lifecycle.lock().await;
        if !self.local.is_started() {
            return Ok(());
        }
        self.local.started.store(false, Ordering::Release);
        let announced = self.ctx.announce(&self.local.name, None).await;

        let deadline = Instant::now() + self.ctx.config().drain_timeout();
        let still_running = self.local.drain(deadline).await;
        if still_running > 0 {
            tracing::warn!(service = %self.local.name, still_running, "drain deadline elapsed");
        } else {
            tracing::info!(service = %self.local.name, "service stopped");
        }
        announced
    }
}
