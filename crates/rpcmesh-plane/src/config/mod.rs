//! Mesh config loader (strict parsing).

pub mod schema;

use std::fs;

use rpcmesh_core::error::{Result, RpcError};

pub use schema::{
    Credential, CryptoSection, MachineSection, MeshConfig, PlaneSection, RetrySection,
};

pub fn load_from_file(path: &str) -> Result<MeshConfig> {
    let s = fs::read_to_string(path)
        .map_err(|e| RpcError::Config(format!("read config failed: {e}").into()))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<MeshConfig> {
    let cfg: MeshConfig = serde_yaml::from_str(s)
        .map_err(|e| RpcError::Config(format!("invalid yaml: {e}").into()))?;
    cfg.validate()?;
    Ok(cfg)
}
