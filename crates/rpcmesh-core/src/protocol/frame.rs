//! Control-plane frames (binary, panic-free).
//!
//! Header: `[v: u8 = 1][kind: u8]`, followed by the kind-specific body.
//! Argument and result values travel as [`Envelope`]s so the control plane
//! can route them without ever holding keys.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorDescriptor, Result, RpcError};
use crate::protocol::codec::{
    get_count, get_opt_str, get_str, get_u8, need, put_len, put_opt_str, put_str,
};
use crate::protocol::envelope::Envelope;

/// Frame format version.
pub const FRAME_VERSION: u8 = 1;

const KIND_HELLO: u8 = 0x10;
const KIND_WELCOME: u8 = 0x11;
const KIND_REJECTED: u8 = 0x12;
const KIND_SERVICE_UP: u8 = 0x20;
const KIND_SERVICE_DOWN: u8 = 0x21;
const KIND_SERVICE_ACK: u8 = 0x22;
const KIND_CALL: u8 = 0x30;
const KIND_RESULT: u8 = 0x31;
const KIND_CANCEL: u8 = 0x32;

const HANDSHAKE_PROOF_CONTEXT: &str = "rpcmesh handshake proof v1";

/// Transport-assigned connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Unique call token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(pub u128);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Call id source: random per-process prefix, monotonically increasing suffix.
#[derive(Debug)]
pub struct CallIdGen {
    prefix: u64,
    next: AtomicU64,
}

impl CallIdGen {
    pub fn new() -> Self {
        Self {
            prefix: rand::random(),
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> CallId {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        CallId(((self.prefix as u128) << 64) | seq as u128)
    }
}

impl Default for CallIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity a machine presents when it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub machine_id: String,
    pub machine_type: String,
    pub deployment_id: Option<String>,
    pub environment: String,
    pub access_key: String,
    /// Keyed hash of `machine_id` under the access key's secret.
    pub proof: String,
}

impl Handshake {
    /// Proof of secret possession; the secret itself never leaves the machine.
    pub fn proof_for(secret: &str, machine_id: &str) -> String {
        let key = blake3::derive_key(HANDSHAKE_PROOF_CONTEXT, secret.as_bytes());
        blake3::keyed_hash(&key, machine_id.as_bytes()).to_hex().to_string()
    }

    pub fn verify(&self, secret: &str) -> bool {
        Self::proof_for(secret, &self.machine_id) == self.proof
    }
}

/// One remote invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub call_id: CallId,
    pub service: String,
    pub function: String,
    pub args: Vec<Envelope>,
    pub machine_type: Option<String>,
    pub deployment_id: Option<String>,
}

/// Outcome of a [`Call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    pub call_id: CallId,
    pub outcome: std::result::Result<Envelope, ErrorDescriptor>,
}

impl CallResult {
    pub fn ok(call_id: CallId, env: Envelope) -> Self {
        Self { call_id, outcome: Ok(env) }
    }

    pub fn err(call_id: CallId, desc: ErrorDescriptor) -> Self {
        Self { call_id, outcome: Err(desc) }
    }
}

/// Everything exchanged between a machine and the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello(Handshake),
    Welcome { connection_id: ConnectionId },
    Rejected { reason: String },
    ServiceUp { service: String, functions: Vec<String> },
    ServiceDown { service: String },
    ServiceAck { service: String, up: bool },
    Call(Call),
    Result(CallResult),
    Cancel { call_id: CallId },
}

impl Frame {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Rejected { .. } => "rejected",
            Frame::ServiceUp { .. } => "service_up",
            Frame::ServiceDown { .. } => "service_down",
            Frame::ServiceAck { .. } => "service_ack",
            Frame::Call(_) => "call",
            Frame::Result(_) => "result",
            Frame::Cancel { .. } => "cancel",
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u8(FRAME_VERSION);
        match self {
            Frame::Hello(h) => {
                buf.put_u8(KIND_HELLO);
                put_str(&mut buf, &h.machine_id)?;
                put_str(&mut buf, &h.machine_type)?;
                put_opt_str(&mut buf, h.deployment_id.as_deref())?;
                put_str(&mut buf, &h.environment)?;
                put_str(&mut buf, &h.access_key)?;
                put_str(&mut buf, &h.proof)?;
            }
            Frame::Welcome { connection_id } => {
                buf.put_u8(KIND_WELCOME);
                buf.put_u64_le(connection_id.0);
            }
            Frame::Rejected { reason } => {
                buf.put_u8(KIND_REJECTED);
                put_str(&mut buf, reason)?;
            }
            Frame::ServiceUp { service, functions } => {
                buf.put_u8(KIND_SERVICE_UP);
                put_str(&mut buf, service)?;
                put_len(&mut buf, functions.len())?;
                for f in functions {
                    put_str(&mut buf, f)?;
                }
            }
            Frame::ServiceDown { service } => {
                buf.put_u8(KIND_SERVICE_DOWN);
                put_str(&mut buf, service)?;
            }
            Frame::ServiceAck { service, up } => {
                buf.put_u8(KIND_SERVICE_ACK);
                put_str(&mut buf, service)?;
                buf.put_u8(u8::from(*up));
            }
            Frame::Call(call) => {
                buf.put_u8(KIND_CALL);
                buf.put_u128_le(call.call_id.0);
                put_str(&mut buf, &call.service)?;
                put_str(&mut buf, &call.function)?;
                put_opt_str(&mut buf, call.machine_type.as_deref())?;
                put_opt_str(&mut buf, call.deployment_id.as_deref())?;
                put_len(&mut buf, call.args.len())?;
                for arg in &call.args {
                    arg.encode_into(&mut buf)?;
                }
            }
            Frame::Result(res) => {
                buf.put_u8(KIND_RESULT);
                buf.put_u128_le(res.call_id.0);
                match &res.outcome {
                    Ok(env) => {
                        buf.put_u8(0);
                        env.encode_into(&mut buf)?;
                    }
                    Err(desc) => {
                        buf.put_u8(1);
                        put_str(&mut buf, &desc.name)?;
                        put_str(&mut buf, &desc.message)?;
                        put_str(&mut buf, &desc.remote_stack)?;
                    }
                }
            }
            Frame::Cancel { call_id } => {
                buf.put_u8(KIND_CANCEL);
                buf.put_u128_le(call_id.0);
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let v = get_u8(&mut buf, "frame version")?;
        if v != FRAME_VERSION {
            return Err(RpcError::Codec(format!("unsupported frame version: {v}").into()));
        }
        let kind = get_u8(&mut buf, "frame kind")?;
        let frame = match kind {
            KIND_HELLO => Frame::Hello(Handshake {
                machine_id: get_str(&mut buf)?,
                machine_type: get_str(&mut buf)?,
                deployment_id: get_opt_str(&mut buf)?,
                environment: get_str(&mut buf)?,
                access_key: get_str(&mut buf)?,
                proof: get_str(&mut buf)?,
            }),
            KIND_WELCOME => {
                need(&buf, 8, "connection id")?;
                Frame::Welcome {
                    connection_id: ConnectionId(buf.get_u64_le()),
                }
            }
            KIND_REJECTED => Frame::Rejected {
                reason: get_str(&mut buf)?,
            },
            KIND_SERVICE_UP => {
                let service = get_str(&mut buf)?;
                let count = get_count(&mut buf)?;
                let mut functions = Vec::with_capacity(count);
                for _ in 0..count {
                    functions.push(get_str(&mut buf)?);
                }
                Frame::ServiceUp { service, functions }
            }
            KIND_SERVICE_DOWN => Frame::ServiceDown {
                service: get_str(&mut buf)?,
            },
            KIND_SERVICE_ACK => Frame::ServiceAck {
                service: get_str(&mut buf)?,
                up: get_u8(&mut buf, "ack flag")? != 0,
            },
            KIND_CALL => {
                let call_id = get_call_id(&mut buf)?;
                let service = get_str(&mut buf)?;
                let function = get_str(&mut buf)?;
                let machine_type = get_opt_str(&mut buf)?;
                let deployment_id = get_opt_str(&mut buf)?;
                let count = get_count(&mut buf)?;
                let mut args = Vec::with_capacity(count);
                for _ in 0..count {
                    args.push(Envelope::decode_from(&mut buf)?);
                }
                Frame::Call(Call {
                    call_id,
                    service,
                    function,
                    args,
                    machine_type,
                    deployment_id,
                })
            }
            KIND_RESULT => {
                let call_id = get_call_id(&mut buf)?;
                let outcome = match get_u8(&mut buf, "outcome flag")? {
                    0 => Ok(Envelope::decode_from(&mut buf)?),
                    1 => Err(ErrorDescriptor {
                        name: get_str(&mut buf)?,
                        message: get_str(&mut buf)?,
                        remote_stack: get_str(&mut buf)?,
                    }),
                    other => return Err(RpcError::Codec(format!("bad outcome flag: {other}").into())),
                };
                Frame::Result(CallResult { call_id, outcome })
            }
            KIND_CANCEL => Frame::Cancel {
                call_id: get_call_id(&mut buf)?,
            },
            other => return Err(RpcError::Codec(format!("unknown frame kind: {other:#04x}").into())),
        };
        if buf.has_remaining() {
            return Err(RpcError::Codec(format!(
                "{} trailing bytes after {} frame",
                buf.remaining(),
                frame.kind_str()
            ).into()));
        }
        Ok(frame)
    }
}

fn get_call_id(buf: &mut Bytes) -> Result<CallId> {
    need(buf, 16, "call id")?;
    Ok(CallId(buf.get_u128_le()))
}
