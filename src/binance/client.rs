// =============================================================================
// Binance REST API Client — public market-data endpoints
// =============================================================================
//
// Only unsigned endpoints are used: the historical kline seed for the chart
// session. No API key is sent.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::market_data::candle_buffer::MAX_BARS;
use crate::market_data::{parse_string_f64, Candle};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Binance public REST client.
#[derive(Debug, Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self { base_url, client })
    }

    /// GET /api/v3/klines (public — no signature required).
    ///
    /// `limit` is clamped to `1..=200`, the size of the bar buffer.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = klines_url(&self.base_url, symbol, interval, limit);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        let candles = parse_klines(&body)?;
        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

/// Clamp a requested seed size to what the bar buffer can hold.
pub fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_BARS as u32)
}

pub fn klines_url(base_url: &str, symbol: &str, interval: &str, limit: u32) -> String {
    format!(
        "{}/api/v3/klines?symbol={}&interval={}&limit={}",
        base_url.trim_end_matches('/'),
        symbol.to_uppercase(),
        interval,
        clamp_limit(limit)
    )
}

/// Parse Binance's array-of-arrays kline response, oldest first.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, then quote volume, trade count and taker volumes
pub fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;

        if arr.len() < 7 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        candles.push(Candle {
            open_time: arr[0].as_i64().context("kline openTime is not an integer")?,
            open: parse_string_f64(&arr[1], "open")?,
            high: parse_string_f64(&arr[2], "high")?,
            low: parse_string_f64(&arr[3], "low")?,
            close: parse_string_f64(&arr[4], "close")?,
            volume: parse_string_f64(&arr[5], "volume")?,
            close_time: arr[6].as_i64().context("kline closeTime is not an integer")?,
        });
    }

    candles.sort_by_key(|c| c.open_time);
    Ok(candles)
}
