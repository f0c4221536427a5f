//! Top-level facade crate for rpcmesh.
//!
//! Re-exports the core wire types and the plane runtime so users can depend on
//! a single crate.

pub mod core {
    pub use rpcmesh_core::*;
}

pub mod plane {
    pub use rpcmesh_plane::*;
}

pub use rpcmesh_core::{AppError, ErrorDetail, ErrorKind, FromValue, Result, RpcError, Timestamp, Value};
pub use rpcmesh_plane::{
    define_service, CallCtx, CallOptions, ControlPlane, HandlerError, RemoteErrorKind, RetryPolicy,
    RpcContext, Service, ServiceClient, ServiceHandle,
};
pub use rpcmesh_plane::service_client;
