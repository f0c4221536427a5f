//! rpcmesh core: transport-agnostic values, envelopes, frames, and errors.
//!
//! This crate defines the wire-level contracts shared by the control plane
//! and the machines that host or call services. It carries no runtime or
//! transport dependencies.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here. Every fallible path
//! surfaces as `RpcError` so a malformed frame from one peer cannot take a
//! process down.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod crypto;
pub mod error;
pub mod protocol;
pub mod retry;

/// Shared result type.
pub use error::{AppError, ErrorDescriptor, ErrorDetail, ErrorKind, Result, RpcError};
pub use protocol::{pack, unpack, Envelope, FromValue, Timestamp, Value};
