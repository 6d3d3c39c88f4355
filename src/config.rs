//! Configuration management for the HTLC relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::error::{RelayerError, RelayerResult};
use crate::types::ChainId;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    pub chains: HashMap<String, ChainConfig>,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    #[serde(default = "default_finality_interval_ms")]
    pub finality_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub finality_max_retries: u32,
    /// Hex ed25519 key for signing outbound messages; a fresh key when unset
    pub signing_key: Option<String>,
}

impl RelayerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_min_timelock")]
    pub min_timelock_secs: u64,
    #[serde(default = "default_max_timelock")]
    pub max_timelock_secs: u64,
    #[serde(default = "default_max_message_age")]
    pub max_message_age_secs: u64,
    #[serde(default = "default_max_clock_skew")]
    pub max_clock_skew_secs: u64,
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: usize,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    /// Hex ed25519 public keys whose signatures are accepted.
    /// Empty disables signature checks.
    #[serde(default)]
    pub trusted_relayers: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            min_timelock_secs: default_min_timelock(),
            max_timelock_secs: default_max_timelock(),
            max_message_age_secs: default_max_message_age(),
            max_clock_skew_secs: default_max_clock_skew(),
            min_confirmations: default_min_confirmations(),
            protocol_version: default_protocol_version(),
            trusted_relayers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingConfig {
    /// Price tolerance in basis points (500 = 5%)
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: u32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_slippage_bps: default_max_slippage_bps(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain: ChainId,
    #[serde(default = "default_adapter")]
    pub adapter: String,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    pub required_confirmations: u64,
    #[serde(default)]
    pub escrow_factory: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

/// Adapter kinds the binary can construct on its own
pub const BUILTIN_ADAPTERS: &[&str] = &["simulated"];

fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_call_timeout_ms() -> u64 {
    10_000
}
fn default_shutdown_grace_ms() -> u64 {
    5000
}
fn default_health_check_interval_secs() -> u64 {
    30
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_finality_interval_ms() -> u64 {
    1000
}
fn default_min_timelock() -> u64 {
    3600
}
fn default_max_timelock() -> u64 {
    604_800
}
fn default_max_message_age() -> u64 {
    3600
}
fn default_max_clock_skew() -> u64 {
    300
}
fn default_min_confirmations() -> usize {
    2
}
fn default_protocol_version() -> u32 {
    crate::relay::PROTOCOL_VERSION
}
fn default_max_slippage_bps() -> u32 {
    500
}
fn default_adapter() -> String {
    "simulated".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_connections() -> u32 {
    5
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> RelayerResult<Self> {
        let config_path = env::var("RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path).map_err(|e| {
            RelayerError::Config(format!("Failed to read config file {:?}: {}", config_path, e))
        })?;

        Self::from_toml_str(&config_str)
    }

    /// Parse, substitute `${VAR}` references and validate
    pub fn from_toml_str(raw: &str) -> RelayerResult<Self> {
        let config_str = substitute_env_vars(raw);

        let settings: Settings = toml::from_str(&config_str)
            .map_err(|e| RelayerError::Config(format!("Failed to parse configuration: {}", e)))?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> RelayerResult<()> {
        if self.enabled_chains().is_empty() {
            return Err(RelayerError::Config(
                "At least one chain must be enabled".to_string(),
            ));
        }

        for (name, chain) in self.enabled_chains() {
            if chain.required_confirmations == 0 {
                return Err(RelayerError::Config(format!(
                    "Chain {} must require at least one confirmation",
                    name
                )));
            }
            if !BUILTIN_ADAPTERS.contains(&chain.adapter.as_str()) {
                return Err(RelayerError::Config(format!(
                    "Chain {} uses unknown adapter kind '{}'",
                    name, chain.adapter
                )));
            }
            if chain.escrow_factory.is_empty() {
                tracing::warn!("Chain {} has no escrow factory address", name);
            }
        }

        let mut seen = Vec::new();
        for (_, chain) in self.enabled_chains() {
            if seen.contains(&chain.chain) {
                return Err(RelayerError::Config(format!(
                    "Chain {} is configured more than once",
                    chain.chain
                )));
            }
            seen.push(chain.chain);
        }

        let security = &self.security;
        if security.min_timelock_secs >= security.max_timelock_secs {
            return Err(RelayerError::Config(format!(
                "min_timelock_secs ({}) must be below max_timelock_secs ({})",
                security.min_timelock_secs, security.max_timelock_secs
            )));
        }
        if security.min_confirmations == 0 {
            return Err(RelayerError::Config(
                "min_confirmations must be at least 1".to_string(),
            ));
        }
        if self.matching.max_slippage_bps > 10_000 {
            return Err(RelayerError::Config(format!(
                "max_slippage_bps ({}) exceeds 100%",
                self.matching.max_slippage_bps
            )));
        }
        if self.relayer.max_backoff_ms < self.relayer.base_backoff_ms {
            return Err(RelayerError::Config(
                "max_backoff_ms must not be below base_backoff_ms".to_string(),
            ));
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        let mut chains: Vec<_> = self.chains.iter().filter(|(_, c)| c.enabled).collect();
        chains.sort_by_key(|(_, c)| c.chain);
        chains
    }

    /// Get chain config by chain ID
    pub fn get_chain(&self, chain: ChainId) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.enabled && c.chain == chain)
    }

    /// Required finality depth per enabled chain
    pub fn required_confirmations(&self) -> HashMap<ChainId, u64> {
        self.enabled_chains()
            .into_iter()
            .map(|(_, c)| (c.chain, c.required_confirmations))
            .collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
