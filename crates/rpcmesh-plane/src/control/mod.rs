//! Control-plane router.
//!
//! Machine registry, in-flight call table, handshake admission, and the
//! per-connection session runtime that ties them together.

pub mod handshake;
pub mod inflight;
pub mod plane;
pub mod registry;

pub use inflight::{Inflight, InflightTable};
pub use plane::ControlPlane;
pub use registry::{Connection, MachineInfo, MachineRegistry};
