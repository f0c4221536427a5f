//! rpcmesh plane: the control-plane router and the machine runtime.
//!
//! A [`ControlPlane`] admits machines, tracks the services they offer, and
//! routes calls between them. An [`RpcContext`] is one machine's connection:
//! it hosts services and issues calls through [`ServiceClient`]s.

pub mod config;
pub mod control;
pub mod machine;
pub mod obs;
pub mod transport;

pub use control::ControlPlane;
pub use machine::{
    define_service, CallCtx, CallOptions, HandlerError, RemoteErrorKind, RetryPolicy, RpcContext, Service,
    ServiceClient, ServiceHandle,
};

#[doc(hidden)]
pub mod __private {
    pub use rpcmesh_core::{Result, Value};
}
