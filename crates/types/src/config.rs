//! §6 "Configuration (recognized options)" plus the ambient pieces (store
//! connection strings, telemetry) that a runnable orchestrator needs.

use serde::Deserialize;

fn default_max_block_batch() -> u64 {
    10_000
}
fn default_reconnect_delay_ms() -> u64 {
    5_000
}
fn default_executor_concurrency() -> usize {
    8
}
fn default_job_retry_attempts() -> u32 {
    3
}
fn default_job_stall_timeout_ms() -> u64 {
    30_000
}
fn default_shutdown_grace_ms() -> u64 {
    30_000
}
fn default_rpc_deadline_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub rpc_url: String,
    pub dao_governor_address: String,
    pub voting_agent_address: String,
    /// Disables voting when absent, per §6.
    #[serde(default)]
    pub backend_private_key: Option<String>,
    pub chain_id: u64,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_max_block_batch")]
    pub max_block_batch: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_executor_concurrency")]
    pub executor_concurrency: usize,
    #[serde(default = "default_job_retry_attempts")]
    pub job_retry_attempts: u32,
    #[serde(default = "default_job_stall_timeout_ms")]
    pub job_stall_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_rpc_deadline_ms")]
    pub rpc_deadline_ms: u64,

    /// Ambient: where C1 (Redis) and C2 (Postgres) live. Not named in §6's
    /// table (that table only covers chain/job-bus knobs) but required to
    /// construct a runnable deployment.
    pub redis_url: String,
    pub database_url: String,
    #[serde(default = "default_telemetry_addr")]
    pub telemetry_addr: String,
}

fn default_telemetry_addr() -> String {
    "127.0.0.1:9615".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration key: {0}")]
    MissingKey(&'static str),
    #[error("malformed address in '{field}': {value}")]
    MalformedAddress { field: &'static str, value: String },
}

impl OrchestratorConfig {
    /// §7: "Configuration errors... fatal at startup; the scanner never
    /// enters `starting`."
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc_url.trim().is_empty() {
            return Err(ConfigError::MissingKey("rpc_url"));
        }
        crate::address::Address::parse(&self.dao_governor_address).map_err(|_| {
            ConfigError::MalformedAddress {
                field: "dao_governor_address",
                value: self.dao_governor_address.clone(),
            }
        })?;
        crate::address::Address::parse(&self.voting_agent_address).map_err(|_| {
            ConfigError::MalformedAddress {
                field: "voting_agent_address",
                value: self.voting_agent_address.clone(),
            }
        })?;
        if self.max_block_batch == 0 {
            return Err(ConfigError::MissingKey("max_block_batch"));
        }
        Ok(())
    }

    pub fn voting_enabled(&self) -> bool {
        self.backend_private_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> OrchestratorConfig {
        OrchestratorConfig {
            rpc_url: "wss://example.invalid".to_string(),
            dao_governor_address: "0x1111111111111111111111111111111111111111".to_string(),
            voting_agent_address: "0x2222222222222222222222222222222222222222".to_string(),
            backend_private_key: None,
            chain_id: 1,
            start_block: 0,
            max_block_batch: default_max_block_batch(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            executor_concurrency: default_executor_concurrency(),
            job_retry_attempts: default_job_retry_attempts(),
            job_stall_timeout_ms: default_job_stall_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            rpc_deadline_ms: default_rpc_deadline_ms(),
            redis_url: "redis://127.0.0.1".to_string(),
            database_url: "postgres://localhost/aegis".to_string(),
            telemetry_addr: default_telemetry_addr(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn malformed_address_is_fatal() {
        let mut cfg = base_config();
        cfg.dao_governor_address = "not-an-address".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn voting_disabled_without_key() {
        assert!(!base_config().voting_enabled());
        let mut cfg = base_config();
        cfg.backend_private_key = Some("0xdeadbeef".to_string());
        assert!(cfg.voting_enabled());
    }
}
