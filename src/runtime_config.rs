// =============================================================================
// Runtime Configuration — feed settings with atomic save
// =============================================================================
//
// Everything an operator can change without a rebuild: what to watch, what to
// chart, and where the exchange lives.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::candle_buffer::MAX_BARS;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_watchlist() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_chart_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_chart_interval() -> String {
    "1m".to_string()
}

fn default_stream_base_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_reconnect_settle_ms() -> u64 {
    500
}

fn default_seed_limit() -> u32 {
    MAX_BARS as u32
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Subscriptions ------------------------------------------------------

    /// Symbols shown in the live price board.
    #[serde(default = "default_watchlist")]
    pub watchlist: Vec<String>,

    #[serde(default = "default_chart_symbol")]
    pub chart_symbol: String,

    #[serde(default = "default_chart_interval")]
    pub chart_interval: String,

    // --- Exchange endpoints -------------------------------------------------

    /// Push-feed base URL; streams are appended as `/stream?streams=...`.
    #[serde(default = "default_stream_base_url")]
    pub stream_base_url: String,

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    // --- Connection & seeding -----------------------------------------------

    /// Pause between the disconnect and connect halves of a reconnect.
    #[serde(default = "default_reconnect_settle_ms")]
    pub reconnect_settle_ms: u64,

    /// Bars requested for the chart seed (clamped to 1..=200).
    #[serde(default = "default_seed_limit")]
    pub seed_limit: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            watchlist: default_watchlist(),
            chart_symbol: default_chart_symbol(),
            chart_interval: default_chart_interval(),
            stream_base_url: default_stream_base_url(),
            rest_base_url: default_rest_base_url(),
            reconnect_settle_ms: default_reconnect_settle_ms(),
            seed_limit: default_seed_limit(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        config.seed_limit = config.seed_limit.clamp(1, MAX_BARS as u32);

        info!(
            path = %path.display(),
            watchlist = ?config.watchlist,
            chart_symbol = %config.chart_symbol,
            chart_interval = %config.chart_interval,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `PULSE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(list) = std::env::var("PULSE_WATCHLIST") {
            let symbols = parse_symbol_list(&list);
            if !symbols.is_empty() {
                self.watchlist = symbols;
            }
        }
        if let Ok(symbol) = std::env::var("PULSE_CHART_SYMBOL") {
            if !symbol.trim().is_empty() {
                self.chart_symbol = symbol.trim().to_uppercase();
            }
        }
        if let Ok(interval) = std::env::var("PULSE_CHART_INTERVAL") {
            if !interval.trim().is_empty() {
                self.chart_interval = interval.trim().to_string();
            }
        }
    }
}

/// Split a comma-separated symbol list.
pub fn parse_symbol_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}
