pub mod candle_buffer;
pub mod ticker;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use candle_buffer::{BarEntry, CandleAggregator, KlineUpdate, MergeOutcome};
pub use ticker::{PriceSnapshot, TickerBoard};

/// Kline intervals accepted for the chart subscription.
pub const SUPPORTED_INTERVALS: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

/// A single OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[cfg(test)]
impl Candle {
    /// One-minute bar with every price equal to `close`.
    pub fn flat(open_time: i64, close: f64) -> Self {
        Self {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }
}

/// Identifies one bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl CandleKey {
    pub fn new(symbol: &str, interval: &str) -> Self {
        Self {
            symbol: symbol.trim().to_uppercase(),
            interval: interval.trim().to_string(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Push-feed stream name for a symbol's 24h ticker.
pub fn ticker_stream(symbol: &str) -> String {
    format!("{}@ticker", symbol.to_lowercase())
}

/// Push-feed stream name for a symbol's kline series.
pub fn kline_stream(key: &CandleKey) -> String {
    format!("{}@kline_{}", key.symbol.to_lowercase(), key.interval)
}

/// Unwrap a combined-stream `{ "stream": ..., "data": {...} }` envelope, or
/// return the frame itself for single-stream payloads.
pub fn payload(frame: &serde_json::Value) -> &serde_json::Value {
    match frame.get("data") {
        Some(data) if data.is_object() => data,
        _ => frame,
    }
}

/// Binance sends most numeric values as JSON strings.
pub fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}
