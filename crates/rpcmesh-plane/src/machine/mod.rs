//! Machine runtime: hosting services and calling them through the plane.

pub mod client;
pub mod context;
pub mod correlator;
pub mod errors;
pub mod service;

pub use client::{CallOptions, RetryPolicy, ServiceClient};
pub use context::RpcContext;
pub use correlator::{Correlator, Pending};
pub use errors::{CallSite, ErrorRegistry, HandlerError, RemoteErrorKind};
pub use service::{define_service, CallCtx, FnService, Service, ServiceHandle};
