// =============================================================================
// Central Application State — Market Pulse
// =============================================================================
//
// Ties the two live feeds together and provides a unified snapshot for the
// REST API and the WebSocket push feed.
//
//   - `watchlist`: one combined ticker connection for every watched symbol.
//   - `chart`: one kline session for the selected (symbol, interval). It is
//     replaced wholesale when the selection changes.
//
// Thread safety:
//   - `StateVersion` is an atomic counter shared with every feed.
//   - parking_lot::RwLock for the config and the swappable chart session.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::binance::client::clamp_limit;
use crate::binance::BinanceClient;
use crate::feeds::watchlist::normalize_symbols;
use crate::feeds::{ChartSession, ChartSnapshot, FeedSettings, FeedStatus, WatchlistFeed};
use crate::market_data::{CandleKey, PriceSnapshot, SUPPORTED_INTERVALS};
use crate::runtime_config::RuntimeConfig;
use crate::stream::WsConnector;
use crate::types::StateVersion;

/// Which feed a manual reconnect applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedTarget {
    Watchlist,
    Chart,
}

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Bumped on every observable change; the WebSocket feed pushes when it
    /// moves.
    pub version: StateVersion,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    client: BinanceClient,
    settings: FeedSettings,

    pub watchlist: WatchlistFeed,
    chart: RwLock<ChartSession>,

    /// Used for uptime reporting.
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build the state and start both feeds. Must be called inside a Tokio
    /// runtime.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let version = StateVersion::default();
        let settings = FeedSettings::from_config(&config);
        let client = BinanceClient::new(config.rest_base_url.clone())?;

        let key = validate_selection(&config.chart_symbol, &config.chart_interval)
            .context("invalid chart selection in runtime config")?;

        let watchlist = WatchlistFeed::start(&config.watchlist, &settings, WsConnector, version.clone());
        let chart = start_chart(&client, &settings, &version, key, config.seed_limit);

        Ok(Self {
            version,
            runtime_config: Arc::new(RwLock::new(config)),
            client,
            settings,
            watchlist,
            chart: RwLock::new(chart),
            start_time: std::time::Instant::now(),
        })
    }

    // ── Commands ────────────────────────────────────────────────────────

    /// Replace the watched symbols. Snapshots for removed symbols disappear
    /// immediately; the ticker connection is resubscribed.
    pub fn set_watchlist(&self, symbols: &[String]) -> Result<Vec<String>> {
        let symbols = normalize_symbols(symbols);
        if symbols.is_empty() {
            anyhow::bail!("watchlist must contain at least one symbol");
        }
        if let Some(bad) = symbols.iter().find(|s| !is_valid_symbol(s)) {
            anyhow::bail!("invalid symbol '{bad}'");
        }
        let applied = self.watchlist.set_symbols(&symbols);
        self.runtime_config.write().watchlist = applied.clone();
        self.version.bump();
        Ok(applied)
    }

    /// Point the chart at a new (symbol, interval). The previous session is
    /// shut down and its buffer discarded.
    pub fn switch_chart(&self, symbol: &str, interval: &str) -> Result<CandleKey> {
        let key = validate_selection(symbol, interval)?;

        let mut chart = self.chart.write();
        if chart.key() == &key {
            return Ok(key);
        }

        let limit = self.runtime_config.read().seed_limit;
        let next = start_chart(&self.client, &self.settings, &self.version, key.clone(), limit);
        let previous = std::mem::replace(&mut *chart, next);
        drop(chart);
        previous.shutdown();

        {
            let mut config = self.runtime_config.write();
            config.chart_symbol = key.symbol.clone();
            config.chart_interval = key.interval.clone();
        }
        info!(from = %previous.key(), to = %key, "chart selection switched");
        self.version.bump();
        Ok(key)
    }

    pub fn reconnect(&self, target: FeedTarget) {
        info!(target = ?target, "manual reconnect requested");
        match target {
            FeedTarget::Watchlist => self.watchlist.reconnect(),
            FeedTarget::Chart => self.chart.read().reconnect(),
        }
    }

    /// Close both connections.
    pub fn shutdown(&self) {
        self.watchlist.shutdown();
        self.chart.read().shutdown();
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn prices(&self) -> Vec<PriceSnapshot> {
        self.watchlist.prices()
    }

    pub fn price(&self, symbol: &str) -> Option<PriceSnapshot> {
        self.watchlist.price(symbol)
    }

    pub fn chart_snapshot(&self) -> ChartSnapshot {
        self.chart.read().snapshot()
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Build a complete, serialisable snapshot of both feeds.
    ///
    /// This is the payload of `GET /api/v1/state` and of every WebSocket
    /// push.
    pub fn build_snapshot(&self) -> StateSnapshot {
        // Read the version first so a concurrent change triggers another push.
        let state_version = self.version.current();

        StateSnapshot {
            state_version,
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            watchlist: WatchlistSnapshot {
                symbols: self.watchlist.symbols(),
                status: self.watchlist.status(),
                prices: self.watchlist.prices(),
            },
            chart: self.chart_snapshot(),
        }
    }
}

fn start_chart(
    client: &BinanceClient,
    settings: &FeedSettings,
    version: &StateVersion,
    key: CandleKey,
    seed_limit: u32,
) -> ChartSession {
    let client = client.clone();
    let limit = clamp_limit(seed_limit);
    let (symbol, interval) = (key.symbol.clone(), key.interval.clone());
    let seed = async move { client.get_klines(&symbol, &interval, limit).await };
    ChartSession::start(key, settings, WsConnector, version.clone(), seed)
}

fn is_valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty() && symbol.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Validate a chart selection and normalise it into a key.
pub fn validate_selection(symbol: &str, interval: &str) -> Result<CandleKey> {
    let key = CandleKey::new(symbol, interval);
    if !is_valid_symbol(&key.symbol) {
        warn!(symbol, "rejected chart symbol");
        anyhow::bail!("invalid symbol '{symbol}'");
    }
    if !SUPPORTED_INTERVALS.contains(&key.interval.as_str()) {
        warn!(interval, "rejected chart interval");
        anyhow::bail!(
            "unsupported interval '{interval}', expected one of {}",
            SUPPORTED_INTERVALS.join(", ")
        );
    }
    Ok(key)
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub watchlist: WatchlistSnapshot,
    pub chart: ChartSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchlistSnapshot {
    pub symbols: Vec<String>,
    #[serde(flatten)]
    pub status: FeedStatus,
    pub prices: Vec<PriceSnapshot>,
}
