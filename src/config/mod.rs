//! Runtime configuration (spec §6 "Configuration (enumerated)").
//!
//! A `Config` struct deserialized from TOML with environment-variable
//! overrides, `Default` giving every value in the spec's table — the
//! same load pattern the teacher crate uses for its own `Config`, scaled
//! down to only the sections this engine needs: the exchange-policy keys
//! §6 names, plus the ambient `app`/`network`/`database`/`security`
//! sections every deployment of the teacher's stack carries regardless
//! of feature scope.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub network: NetworkConfig,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    pub exchange: ExchangeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("rangzen"),
            log_level: "info".to_string(),
        }
    }
}

/// Transport-facing toggles and DNS-SD advertisement values (spec §6
/// `wifi_direct_service_type` / `port`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub enable_ble: bool,
    pub enable_wifi_direct: bool,
    pub enable_wifi_aware: bool,
    pub enable_lan: bool,
    pub wifi_direct_service_type: String,
    pub wifi_direct_port: u16,
    /// Transport staleness threshold (spec §6 `stale_ms`).
    pub stale_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enable_ble: true,
            enable_wifi_direct: true,
            enable_wifi_aware: true,
            enable_lan: true,
            wifi_direct_service_type: "_rangzen._tcp".to_string(),
            wifi_direct_port: 0, // 0 = let the OS choose an ephemeral port
            stale_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub message_store_path: PathBuf,
    pub friend_store_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let base = AppConfig::default().data_dir;
        Self {
            message_store_path: base.join("messages.db"),
            friend_store_path: base.join("friends.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Where the long-lived identity keypair is persisted (spec §3
    /// "DeviceIdentity" — "persisted on first use").
    pub identity_key_path: PathBuf,
    /// Minimum trust required to surface a message to a peer with zero
    /// shared friends (spec §4.2 "installer-configured minimum-trust
    /// gate").
    pub min_trust_gate: f64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            identity_key_path: AppConfig::default().data_dir.join("identity.key"),
            min_trust_gate: 0.0,
        }
    }
}

/// Exchange-policy keys enumerated verbatim in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub use_trust: bool,
    pub min_shared_contacts_for_exchange: u32,
    pub max_messages_per_exchange: u32,
    pub exchange_session_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Global cap on concurrently active sessions (spec §5 "Mutual
    /// exclusion").
    pub max_concurrent_exchanges: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            use_trust: true,
            min_shared_contacts_for_exchange: 0,
            max_messages_per_exchange: 100,
            exchange_session_timeout_ms: 30_000,
            backoff_base_ms: 10_000,
            backoff_max_ms: 320_000,
            max_concurrent_exchanges: 4,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            network: NetworkConfig::default(),
            database: DatabaseConfig::default(),
            security: SecurityConfig::default(),
            exchange: ExchangeConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults for any key the
    /// file omits, then apply environment-variable overrides.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// `RANGZEN_<SECTION>_<KEY>` environment variables override any
    /// loaded or default value, e.g. `RANGZEN_EXCHANGE_USE_TRUST=false`.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RANGZEN_EXCHANGE_USE_TRUST") {
            if let Ok(parsed) = v.parse() {
                self.exchange.use_trust = parsed;
            }
        }
        if let Ok(v) = std::env::var("RANGZEN_EXCHANGE_MIN_SHARED_CONTACTS") {
            if let Ok(parsed) = v.parse() {
                self.exchange.min_shared_contacts_for_exchange = parsed;
            }
        }
        if let Ok(v) = std::env::var("RANGZEN_EXCHANGE_MAX_MESSAGES") {
            if let Ok(parsed) = v.parse() {
                self.exchange.max_messages_per_exchange = parsed;
            }
        }
        if let Ok(v) = std::env::var("RANGZEN_APP_DATA_DIR") {
            self.app.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("RANGZEN_APP_LOG_LEVEL") {
            self.app.log_level = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = Config::default();
        assert_eq!(config.exchange.min_shared_contacts_for_exchange, 0);
        assert_eq!(config.exchange.max_messages_per_exchange, 100);
        assert_eq!(config.exchange.exchange_session_timeout_ms, 30_000);
        assert_eq!(config.exchange.backoff_base_ms, 10_000);
        assert_eq!(config.exchange.backoff_max_ms, 320_000);
        assert_eq!(config.network.stale_ms, 30_000);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load("/nonexistent/path/rangzen.toml").unwrap();
        assert_eq!(
            config.exchange.max_messages_per_exchange,
            ExchangeConfig::default().max_messages_per_exchange
        );
    }

    #[test]
    fn env_override_changes_use_trust() {
        std::env::set_var("RANGZEN_EXCHANGE_USE_TRUST", "false");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert!(!config.exchange.use_trust);
        std::env::remove_var("RANGZEN_EXCHANGE_USE_TRUST");
    }
}
