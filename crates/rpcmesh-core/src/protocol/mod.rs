//! Protocol modules.
//!
//! - `value` / `codec`: dynamic values and their canonical binary form.
//! - `envelope`: one packed, optionally encrypted value.
//! - `frame`: control-plane frames carrying calls, results, and lifecycle.
//!
//! All decoders are panic-free: malformed input is reported as `RpcError`.

pub mod codec;
pub mod envelope;
pub mod frame;
pub mod value;

pub use envelope::{pack, unpack, Envelope};
pub use frame::{Call, CallId, CallIdGen, CallResult, ConnectionId, Frame, Handshake};
pub use value::{FromValue, Timestamp, Value};
