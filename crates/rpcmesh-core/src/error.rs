//! Shared error type across rpcmesh crates.
//!
//! Every variant carries a stable wire name (see [`ErrorKind::as_str`]) so an
//! error raised on one machine can be described, shipped, and rebuilt on
//! another without losing its identity.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Stable error kinds (wire names are part of the protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Raised by a remote handler.
    Application,
    /// Connection lost or target unreachable.
    Transport,
    /// No eligible instance for the call.
    Routing,
    /// No configured key could decrypt an envelope.
    Decryption,
    /// No response within the call's deadline.
    Timeout,
    /// Malformed bytes on the wire.
    Codec,
    /// Handshake credentials rejected.
    Auth,
    /// Invalid configuration.
    Config,
    /// Call abandoned by its caller.
    Cancelled,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Name used in [`ErrorDescriptor::name`].
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Application => "ApplicationError",
            ErrorKind::Transport => "TransportError",
            ErrorKind::Routing => "RoutingError",
            ErrorKind::Decryption => "DecryptionError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Codec => "CodecError",
            ErrorKind::Auth => "AuthError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Cancelled => "CancelledError",
            ErrorKind::Internal => "InternalError",
        }
    }

    /// Reverse of [`ErrorKind::as_str`] for the runtime-owned kinds.
    ///
    /// `ApplicationError` is deliberately not matched: any name that is not a
    /// runtime kind belongs to the application.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "TransportError" => Some(ErrorKind::Transport),
            "RoutingError" => Some(ErrorKind::Routing),
            "DecryptionError" => Some(ErrorKind::Decryption),
            "TimeoutError" => Some(ErrorKind::Timeout),
            "CodecError" => Some(ErrorKind::Codec),
            "AuthError" => Some(ErrorKind::Auth),
            "ConfigError" => Some(ErrorKind::Config),
            "CancelledError" => Some(ErrorKind::Cancelled),
            "InternalError" => Some(ErrorKind::Internal),
            _ => None,
        }
    }
}

/// Error as it travels inside a `CallResult`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDescriptor {
    pub name: String,
    pub message: String,
    pub remote_stack: String,
}

impl ErrorDescriptor {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            remote_stack: String::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.remote_stack = stack.into();
        self
    }

    /// Descriptor for a runtime-owned failure (routing, transport, ...).
    pub fn runtime(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind.as_str(), message)
    }
}

/// Message and stack context carried by every runtime error variant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorDetail {
    message: String,
    remote_stack: String,
    local_stack: String,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_remote_stack(mut self, stack: impl Into<String>) -> Self {
        self.remote_stack = stack.into();
        self
    }

    pub fn with_local_stack(mut self, stack: impl Into<String>) -> Self {
        self.local_stack = stack.into();
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stack reported by the machine that raised the error, if any.
    pub fn remote_stack(&self) -> &str {
        &self.remote_stack
    }

    pub fn local_stack(&self) -> &str {
        &self.local_stack
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<String> for ErrorDetail {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ErrorDetail {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

fn join_stacks(remote: &str, local: &str) -> String {
    let mut out = String::with_capacity(remote.len() + local.len() + 32);
    out.push_str(remote);
    if !local.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("    --- called from ---\n");
        out.push_str(local);
    }
    out
}

/// Application error reconstructed on the calling side.
#[derive(Clone)]
pub struct AppError {
    name: String,
    message: String,
    remote_stack: String,
    local_stack: String,
    typed: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    pub fn from_descriptor(desc: ErrorDescriptor) -> Self {
        Self {
            name: desc.name,
            message: desc.message,
            remote_stack: desc.remote_stack,
            local_stack: String::new(),
            typed: None,
        }
    }

    /// Append caller-side context. Never replaces the remote stack.
    pub fn with_local_stack(mut self, stack: impl Into<String>) -> Self {
        self.local_stack = stack.into();
        self
    }

    /// Attach the concrete error rebuilt from a known kind.
    pub fn with_typed(mut self, typed: Arc<dyn std::error::Error + Send + Sync>) -> Self {
        self.typed = Some(typed);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn remote_stack(&self) -> &str {
        &self.remote_stack
    }

    pub fn local_stack(&self) -> &str {
        &self.local_stack
    }

    /// Remote stack followed by the local call-site context.
    pub fn stack(&self) -> String {
        join_stacks(&self.remote_stack, &self.local_stack)
    }

    /// Whether a registered error kind rebuilt this error as a concrete type.
    pub fn is_typed(&self) -> bool {
        self.typed.is_some()
    }

    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.typed.as_deref()?.downcast_ref::<E>()
    }

    pub fn to_descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            name: self.name.clone(),
            message: self.message.clone(),
            remote_stack: self.remote_stack.clone(),
        }
    }
}

impl fmt::Debug for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppError")
            .field("name", &self.name)
            .field("message", &self.message)
            .field("typed", &self.typed.is_some())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for AppError {}

/// Shared result type.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Unified error type used by core and plane.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("codec: {0}")]
    Codec(ErrorDetail),
    #[error("decryption failed: {0}")]
    Decryption(ErrorDetail),
    #[error("config: {0}")]
    Config(ErrorDetail),
    #[error("auth failed: {0}")]
    Auth(ErrorDetail),
    #[error("routing: {0}")]
    Routing(ErrorDetail),
    #[error("transport: {0}")]
    Transport(ErrorDetail),
    #[error("timed out: {0}")]
    Timeout(ErrorDetail),
    #[error("{0}")]
    Application(Box<AppError>),
    #[error("cancelled: {0}")]
    Cancelled(ErrorDetail),
    #[error("internal: {0}")]
    Internal(ErrorDetail),
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Codec(_) => ErrorKind::Codec,
            RpcError::Decryption(_) => ErrorKind::Decryption,
            RpcError::Config(_) => ErrorKind::Config,
            RpcError::Auth(_) => ErrorKind::Auth,
            RpcError::Routing(_) => ErrorKind::Routing,
            RpcError::Transport(_) => ErrorKind::Transport,
            RpcError::Timeout(_) => ErrorKind::Timeout,
            RpcError::Application(_) => ErrorKind::Application,
            RpcError::Cancelled(_) => ErrorKind::Cancelled,
            RpcError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Runtime error of `kind`. Application errors are built from descriptors.
    pub fn runtime(kind: ErrorKind, detail: impl Into<ErrorDetail>) -> Self {
        let detail = detail.into();
        match kind {
            ErrorKind::Transport => RpcError::Transport(detail),
            ErrorKind::Routing => RpcError::Routing(detail),
            ErrorKind::Decryption => RpcError::Decryption(detail),
            ErrorKind::Timeout => RpcError::Timeout(detail),
            ErrorKind::Codec => RpcError::Codec(detail),
            ErrorKind::Auth => RpcError::Auth(detail),
            ErrorKind::Config => RpcError::Config(detail),
            ErrorKind::Cancelled => RpcError::Cancelled(detail),
            ErrorKind::Internal => RpcError::Internal(detail),
            ErrorKind::Application => {
                let desc = ErrorDescriptor::new(kind.as_str(), detail.message).with_stack(detail.remote_stack);
                AppError::from_descriptor(desc).with_local_stack(detail.local_stack).into()
            }
        }
    }

    fn detail(&self) -> Option<&ErrorDetail> {
        match self {
            RpcError::Codec(d)
            | RpcError::Decryption(d)
            | RpcError::Config(d)
            | RpcError::Auth(d)
            | RpcError::Routing(d)
            | RpcError::Transport(d)
            | RpcError::Timeout(d)
            | RpcError::Cancelled(d)
            | RpcError::Internal(d) => Some(d),
            RpcError::Application(_) => None,
        }
    }

    /// Wire name of this error. Application errors keep their own name.
    pub fn name(&self) -> &str {
        match self {
            RpcError::Application(app) => app.name(),
            other => other.kind().as_str(),
        }
    }

    /// Message without the kind prefix used by `Display`.
    pub fn message(&self) -> &str {
        match self {
            RpcError::Application(app) => app.message(),
            other => other.detail().map_or("", ErrorDetail::message),
        }
    }

    pub fn remote_stack(&self) -> &str {
        match self {
            RpcError::Application(app) => app.remote_stack(),
            other => other.detail().map_or("", ErrorDetail::remote_stack),
        }
    }

    pub fn local_stack(&self) -> &str {
        match self {
            RpcError::Application(app) => app.local_stack(),
            other => other.detail().map_or("", ErrorDetail::local_stack),
        }
    }

    /// Remote stack followed by the local call-site context.
    pub fn stack(&self) -> String {
        join_stacks(self.remote_stack(), self.local_stack())
    }

    /// Attach caller-side context to any kind of error.
    pub fn with_local_stack(self, stack: impl Into<String>) -> Self {
        match self {
            RpcError::Application(app) => RpcError::Application(Box::new((*app).with_local_stack(stack))),
            other => {
                let kind = other.kind();
                let detail = other.detail().cloned().unwrap_or_default().with_local_stack(stack);
                RpcError::runtime(kind, detail)
            }
        }
    }

    /// Describe this error for a `CallResult`.
    pub fn to_descriptor(&self) -> ErrorDescriptor {
        match self {
            RpcError::Application(app) => app.to_descriptor(),
            other => {
                let d = other.detail().cloned().unwrap_or_default();
                ErrorDescriptor::runtime(other.kind(), d.message).with_stack(d.remote_stack)
            }
        }
    }

    /// Rebuild a runtime error from its descriptor; anything unknown is an
    /// application error.
    pub fn from_descriptor(desc: ErrorDescriptor) -> Self {
        match ErrorKind::from_name(&desc.name) {
            Some(kind) => {
                RpcError::runtime(kind, ErrorDetail::new(desc.message).with_remote_stack(desc.remote_stack))
            }
            None => RpcError::Application(Box::new(AppError::from_descriptor(desc))),
        }
    }

    /// Borrow the application error, if this is one.
    pub fn as_application(&self) -> Option<&AppError> {
        match self {
            RpcError::Application(app) => Some(app),
            _ => None,
        }
    }
}

impl From<AppError> for RpcError {
    fn from(app: AppError) -> Self {
        RpcError::Application(Box::new(app))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_detail_survives_the_wire() {
        let desc = ErrorDescriptor::runtime(ErrorKind::Transport, "peer gone").with_stack("    at plane");
        let err = RpcError::from_descriptor(desc.clone()).with_local_stack("    at caller");
        assert_eq!(err.to_string(), "transport: peer gone");
        assert_eq!(err.remote_stack(), "    at plane");
        assert_eq!(err.stack(), "    at plane\n    --- called from ---\n    at caller");
        assert_eq!(err.to_descriptor(), desc);
    }

    #[test]
    fn routing_display_has_one_prefix() {
        let err = RpcError::Routing("no eligible instance for a.b".into());
        assert_eq!(err.to_string(), "routing: no eligible instance for a.b");
    }
}
