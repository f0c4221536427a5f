//! Handshake admission.
//!
//! Credentials only scope who may register and call; nothing past the
//! handshake looks at them again.

use rpcmesh_core::error::{Result, RpcError};
use rpcmesh_core::protocol::Handshake;

use crate::config::PlaneSection;

/// Check a `Hello` against the plane's accepted identities.
pub fn admit(cfg: &PlaneSection, hello: &Handshake) -> Result<()> {
    if hello.machine_id.is_empty() {
        return Err(RpcError::Auth("machine_id must not be empty".into()));
    }
    if !cfg.machine_types.is_empty() && !cfg.machine_types.contains(&hello.machine_type) {
        return Err(RpcError::Auth(format!(
            "machine type not accepted: {}",
            hello.machine_type
        ).into()));
    }
    if cfg.credentials.is_empty() {
        return Ok(());
    }

    let cred = cfg
        .credentials
        .iter()
        .find(|c| c.access_key == hello.access_key)
        .ok_or_else(|| RpcError::Auth("unknown access key".into()))?;
    if cred.environment != hello.environment {
        return Err(RpcError::Auth(format!(
            "access key is not valid for environment {}",
            hello.environment
        ).into()));
    }
    if !hello.verify(&cred.secret) {
        return Err(RpcError::Auth("bad handshake proof".into()));
    }
    Ok(())
}
