//! Handler-side errors and caller-side error reconstruction.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use dashmap::DashMap;

use rpcmesh_core::error::{AppError, ErrorDescriptor, ErrorKind, RpcError};

/// A custom error type that keeps its identity across machines.
///
/// `NAME` travels on the wire; the receiving side rebuilds the value with
/// `from_descriptor` when the kind is registered in its [`ErrorRegistry`].
pub trait RemoteErrorKind: std::error::Error + Send + Sync + Sized + 'static {
    const NAME: &'static str;

    fn from_descriptor(desc: &ErrorDescriptor) -> Self;
}

/// Failure returned by a service handler.
#[derive(Debug, Clone)]
pub struct HandlerError {
    name: String,
    message: String,
    stack: String,
}

impl HandlerError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: capture_backtrace(),
        }
    }

    /// Generic error without a custom kind.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Describe for the wire, prefixing the handler location.
    pub fn into_descriptor(self, frame: &str) -> ErrorDescriptor {
        let mut stack = format!("    at {frame}");
        if !self.stack.is_empty() {
            stack.push('\n');
            stack.push_str(&self.stack);
        }
        ErrorDescriptor::new(self.name, self.message).with_stack(stack)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl<E: RemoteErrorKind> From<E> for HandlerError {
    fn from(e: E) -> Self {
        Self::new(E::NAME, e.to_string())
    }
}

/// Nested call failures keep their own name.
impl From<RpcError> for HandlerError {
    fn from(e: RpcError) -> Self {
        Self {
            name: e.name().to_string(),
            message: e.message().to_string(),
            stack: e.stack(),
        }
    }
}

type Rebuild = fn(&ErrorDescriptor) -> Arc<dyn std::error::Error + Send + Sync>;

fn rebuild<E: RemoteErrorKind>(desc: &ErrorDescriptor) -> Arc<dyn std::error::Error + Send + Sync> {
    Arc::new(E::from_descriptor(desc))
}

/// Known custom error kinds on the receiving side.
#[derive(Default)]
pub struct ErrorRegistry {
    kinds: DashMap<String, Rebuild>,
}

impl ErrorRegistry {
    pub fn new() -> Self {
        Self { kinds: DashMap::new() }
    }

    pub fn register<E: RemoteErrorKind>(&self) {
        self.kinds.insert(E::NAME.to_string(), rebuild::<E>);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }

    /// Turn a descriptor into the error surfaced to the caller, appending the
    /// local call site to the remote stack.
    pub fn reconstruct(&self, desc: ErrorDescriptor, site: &CallSite) -> RpcError {
        if ErrorKind::from_name(&desc.name).is_some() {
            return site.attach(RpcError::from_descriptor(desc));
        }
        let typed = self.kinds.get(&desc.name).map(|r| (*r.value())(&desc));
        let mut app = AppError::from_descriptor(desc);
        if let Some(typed) = typed {
            app = app.with_typed(typed);
        }
        site.attach(app.into())
    }
}

/// Where a remote call was issued from.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub service: String,
    pub function: String,
    pub location: &'static Location<'static>,
}

impl CallSite {
    /// Append this call site to an error surfaced to the caller.
    pub(crate) fn attach(&self, err: RpcError) -> RpcError {
        err.with_local_stack(self.render())
    }

    fn render(&self) -> String {
        let mut out = format!(
            "    at {}.{} (called at {}:{}:{})",
            self.service,
            self.function,
            self.location.file(),
            self.location.line(),
            self.location.column()
        );
        let bt = capture_backtrace();
        if !bt.is_empty() {
            out.push('\n');
            out.push_str(&bt);
        }
        out
    }
}

/// Backtrace text if backtraces are enabled (`RUST_BACKTRACE`), else empty.
fn capture_backtrace() -> String {
    let bt = Backtrace::capture();
    match bt.status() {
        BacktraceStatus::Captured => bt.to_string(),
        _ => String::new(),
    }
}
