//! Configuration management module
//!
//! Handles loading, validation, and management of application configuration.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::gateway::client::GatewayConfig;
use crate::store::StoreConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Trading symbols to subscribe on startup
    pub symbols: Vec<String>,

    /// Logging level
    pub log_level: String,

    /// File-based logging configuration
    pub log: LogConfig,

    /// Gateway connection configuration
    pub gateway: GatewaySettings,

    /// State store bounds
    pub store: StoreSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// WebSocket base URL
    pub url: String,

    /// Heartbeat liveness window in milliseconds (ping interval plus
    /// tolerance)
    pub heartbeat_timeout_ms: u64,

    /// Maximum subscriptions per connection
    pub max_subscriptions: usize,

    /// Initial reconnect backoff in milliseconds
    pub reconnect_initial_ms: u64,

    /// Reconnect backoff ceiling in milliseconds
    pub reconnect_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Trades retained per symbol
    pub trade_tape_cap: usize,

    /// Deltas buffered per stream before forcing a resync
    pub delta_buffer_cap: usize,

    /// Event ids retained per stream for duplicate suppression
    pub seen_ids_cap: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Absolute or relative path to the rolling log file
    pub file_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTC_USD".to_string()],
            log_level: "info".to_string(),
            log: LogConfig::default(),
            gateway: GatewaySettings::default(),
            store: StoreSettings::default(),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: "wss://gateway.example.com/ws".to_string(),
            heartbeat_timeout_ms: 20_000,
            max_subscriptions: 50,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 16_000,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            trade_tape_cap: 500,
            delta_buffer_cap: 10_000,
            seen_ids_cap: 10_000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file_path: "logs/dexsync.log".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file with environment variable overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        // DEXSYNC_SYMBOLS - comma-separated list of symbols
        if let Ok(symbols) = env::var("DEXSYNC_SYMBOLS") {
            self.symbols = symbols
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // DEXSYNC_LOG_LEVEL - logging level
        if let Ok(log_level) = env::var("DEXSYNC_LOG_LEVEL") {
            self.log_level = log_level;
        }

        // DEXSYNC_LOG_FILE_PATH - logging destination file
        if let Ok(file_path) = env::var("DEXSYNC_LOG_FILE_PATH") {
            if !file_path.trim().is_empty() {
                self.log.file_path = file_path;
            }
        }

        // DEXSYNC_GATEWAY_URL - WebSocket URL
        if let Ok(url) = env::var("DEXSYNC_GATEWAY_URL") {
            self.gateway.url = url;
        }

        // DEXSYNC_GATEWAY_HEARTBEAT_TIMEOUT_MS - liveness window
        if let Ok(timeout) = env::var("DEXSYNC_GATEWAY_HEARTBEAT_TIMEOUT_MS") {
            if let Ok(value) = timeout.parse::<u64>() {
                self.gateway.heartbeat_timeout_ms = value;
            }
        }

        // DEXSYNC_GATEWAY_MAX_SUBSCRIPTIONS - subscriptions per connection
        if let Ok(max) = env::var("DEXSYNC_GATEWAY_MAX_SUBSCRIPTIONS") {
            if let Ok(value) = max.parse::<usize>() {
                self.gateway.max_subscriptions = value;
            }
        }

        // DEXSYNC_GATEWAY_RECONNECT_INITIAL_MS - first backoff delay
        if let Ok(initial) = env::var("DEXSYNC_GATEWAY_RECONNECT_INITIAL_MS") {
            if let Ok(value) = initial.parse::<u64>() {
                self.gateway.reconnect_initial_ms = value;
            }
        }

        // DEXSYNC_GATEWAY_RECONNECT_MAX_MS - backoff ceiling
        if let Ok(max) = env::var("DEXSYNC_GATEWAY_RECONNECT_MAX_MS") {
            if let Ok(value) = max.parse::<u64>() {
                self.gateway.reconnect_max_ms = value;
            }
        }

        // DEXSYNC_STORE_TRADE_TAPE_CAP - trades retained per symbol
        if let Ok(cap) = env::var("DEXSYNC_STORE_TRADE_TAPE_CAP") {
            if let Ok(value) = cap.parse::<usize>() {
                self.store.trade_tape_cap = value;
            }
        }
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Load configuration with fallback to default
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load_from_file(path).unwrap_or_else(|err| {
            tracing::warn!("Failed to load config: {}, using defaults", err);
            let mut config = Self::default();
            config.apply_env_overrides();
            config
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.gateway.url.trim().is_empty() {
            anyhow::bail!("Gateway URL must not be empty");
        }

        if self.gateway.heartbeat_timeout_ms == 0 {
            anyhow::bail!("Heartbeat timeout must be greater than 0");
        }

        if self.gateway.reconnect_initial_ms == 0
            || self.gateway.reconnect_max_ms < self.gateway.reconnect_initial_ms
        {
            anyhow::bail!("Reconnect backoff bounds are inconsistent");
        }

        if self.store.trade_tape_cap == 0
            || self.store.delta_buffer_cap == 0
            || self.store.seen_ids_cap == 0
        {
            anyhow::bail!("Store bounds must all be greater than 0");
        }

        if self.log.file_path.trim().is_empty() {
            anyhow::bail!("Log file path must not be empty");
        }

        for symbol in &self.symbols {
            if symbol.len() < 3 {
                anyhow::bail!("Invalid symbol format: {}", symbol);
            }
        }

        Ok(())
    }

    /// Gateway client settings derived from this configuration
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            url: self.gateway.url.clone(),
            heartbeat_timeout: Duration::from_millis(self.gateway.heartbeat_timeout_ms),
            max_subscriptions: self.gateway.max_subscriptions,
            reconnect_initial: Duration::from_millis(self.gateway.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.gateway.reconnect_max_ms),
        }
    }

    /// Store bounds derived from this configuration
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            trade_tape_cap: self.store.trade_tape_cap,
            delta_buffer_cap: self.store.delta_buffer_cap,
            seen_ids_cap: self.store.seen_ids_cap,
        }
    }

    /// Display formatted configuration
    pub fn display(&self) -> Result<()> {
        println!("Current configuration:");
        println!("{:#?}", self);
        Ok(())
    }
}
