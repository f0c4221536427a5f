use std::time::Duration;

use serde::Deserialize;
use rpcmesh_core::crypto::CryptoSettings;
use rpcmesh_core::error::{Result, RpcError};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    pub version: u32,

    #[serde(default)]
    pub plane: PlaneSection,

    #[serde(default)]
    pub machine: MachineSection,
}

impl MeshConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(RpcError::Config(format!("unsupported config version: {}", self.version).into()));
        }

        self.plane.validate()?;
        self.machine.validate()?;

        Ok(())
    }
}

/// Control-plane settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaneSection {
    /// Bounded wait for an eligible instance; 0 fails routing immediately.
    #[serde(default)]
    pub route_wait_ms: u64,

    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Empty means any machine may connect.
    #[serde(default)]
    pub credentials: Vec<Credential>,

    /// Machine types allowed to connect. Empty means any.
    #[serde(default)]
    pub machine_types: Vec<String>,
}

impl Default for PlaneSection {
    fn default() -> Self {
        Self {
            route_wait_ms: 0,
            outbound_queue: default_outbound_queue(),
            credentials: Vec::new(),
            machine_types: Vec::new(),
        }
    }
}

impl PlaneSection {
    pub fn validate(&self) -> Result<()> {
        if self.route_wait_ms > 30_000 {
            return Err(RpcError::Config("plane.route_wait_ms must be at most 30000".into()));
        }
        if self.outbound_queue == 0 {
            return Err(RpcError::Config("plane.outbound_queue must be positive".into()));
        }
        for c in &self.credentials {
            if c.access_key.is_empty() || c.secret.is_empty() {
                return Err(RpcError::Config(
                    "plane.credentials entries need access_key and secret".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn route_wait(&self) -> Duration {
        Duration::from_millis(self.route_wait_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credential {
    pub access_key: String,
    pub secret: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Settings for one machine (caller and/or service host).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineSection {
    /// Generated at connect time when absent.
    #[serde(default)]
    pub machine_id: Option<String>,

    #[serde(default = "default_machine_type")]
    pub machine_type: String,

    #[serde(default)]
    pub deployment_id: Option<String>,

    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret: String,

    /// Machine types this client may target. Empty means any.
    #[serde(default)]
    pub machine_types: Vec<String>,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    #[serde(default)]
    pub crypto: CryptoSection,

    #[serde(default)]
    pub retry: RetrySection,
}

impl Default for MachineSection {
    fn default() -> Self {
        Self {
            machine_id: None,
            machine_type: default_machine_type(),
            deployment_id: None,
            environment: default_environment(),
            access_key: String::new(),
            secret: String::new(),
            machine_types: Vec::new(),
            call_timeout_ms: default_call_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            outbound_queue: default_outbound_queue(),
            crypto: CryptoSection::default(),
            retry: RetrySection::default(),
        }
    }
}

impl MachineSection {
    /// Defaults with the given machine type.
    pub fn typed(machine_type: impl Into<String>) -> Self {
        Self {
            machine_type: machine_type.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.machine_type.is_empty() {
            return Err(RpcError::Config("machine.machine_type must not be empty".into()));
        }
        if !(100..=600_000).contains(&self.call_timeout_ms) {
            return Err(RpcError::Config(
                "machine.call_timeout_ms must be between 100 and 600000".into(),
            ));
        }
        if self.drain_timeout_ms > 600_000 {
            return Err(RpcError::Config("machine.drain_timeout_ms must be at most 600000".into()));
        }
        if self.outbound_queue == 0 {
            return Err(RpcError::Config("machine.outbound_queue must be positive".into()));
        }
        self.retry.validate()?;
        let crypto = self.crypto_settings()?;
        if self.crypto.encrypt && crypto.is_empty() {
            return Err(RpcError::Config("machine.crypto.encrypt requires at least one key".into()));
        }
        Ok(())
    }

    pub fn crypto_settings(&self) -> Result<CryptoSettings> {
        CryptoSettings::from_hex_keys(&self.crypto.keys)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CryptoSection {
    #[serde(default)]
    pub encrypt: bool,

    /// Hex-encoded 32-byte keys, newest first.
    #[serde(default)]
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default)]
    pub retry_application_errors: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            retry_application_errors: false,
        }
    }
}

impl RetrySection {
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.max_attempts) {
            return Err(RpcError::Config("machine.retry.max_attempts must be between 1 and 10".into()));
        }
        if self.backoff_ms > 60_000 {
            return Err(RpcError::Config("machine.retry.backoff_ms must be at most 60000".into()));
        }
        Ok(())
    }
}

fn default_outbound_queue() -> usize {
    1024
}
fn default_machine_type() -> String {
    "default".into()
}
fn default_environment() -> String {
    "default".into()
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_drain_timeout_ms() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    1
}
fn default_backoff_ms() -> u64 {
    50
}
