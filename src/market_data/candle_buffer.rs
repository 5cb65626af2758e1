use std::collections::VecDeque;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use super::{parse_string_f64, payload, Candle, CandleKey};
use crate::indicators::{compute_current, compute_indicators, IndicatorPoint, IndicatorSet};

/// Maximum bars retained per chart series.
pub const MAX_BARS: usize = 200;

/// Event type carried by kline push frames.
pub const KLINE_EVENT: &str = "kline";

// ---------------------------------------------------------------------------
// Bar entries
// ---------------------------------------------------------------------------

/// A buffer entry as exposed to consumers: either the single still-forming
/// bar at the tail, or an immutable closed bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum BarEntry {
    Forming(Candle),
    Closed(Candle),
}

#[cfg(test)]
impl BarEntry {
    pub fn candle(&self) -> &Candle {
        match self {
            Self::Forming(c) | Self::Closed(c) => c,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

// ---------------------------------------------------------------------------
// BarBuffer -- sliding window of closed bars plus at most one forming bar
// ---------------------------------------------------------------------------

/// Sliding window of bars for one (symbol, interval).
///
/// Closed bars live in a deque; the forming bar, if any, is held separately so
/// that "at most one forming bar, always last" holds by construction. The
/// capacity counts both. Eviction drops closed bars from the front only.
#[derive(Debug, Clone)]
pub struct BarBuffer {
    closed: VecDeque<Candle>,
    forming: Option<Candle>,
    capacity: usize,
}

impl BarBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            closed: VecDeque::with_capacity(capacity + 1),
            forming: None,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.closed.len() + usize::from(self.forming.is_some())
    }

    pub fn forming(&self) -> Option<&Candle> {
        self.forming.as_ref()
    }

    /// All bars oldest-first, forming bar last.
    pub fn candles(&self) -> Vec<Candle> {
        self.closed.iter().chain(self.forming.iter()).cloned().collect()
    }

    pub fn entries(&self) -> Vec<BarEntry> {
        self.closed
            .iter()
            .cloned()
            .map(BarEntry::Closed)
            .chain(self.forming.iter().cloned().map(BarEntry::Forming))
            .collect()
    }

    fn clear(&mut self) {
        self.closed.clear();
        self.forming = None;
    }

    /// Append a closed bar. A pending forming bar is finalized in place when it
    /// shares the open time, or promoted to closed first when it is older.
    fn push_closed(&mut self, candle: Candle) {
        if let Some(forming) = self.forming.take() {
            if forming.open_time != candle.open_time {
                self.closed.push_back(forming);
            }
        }
        self.closed.push_back(candle);
        self.trim();
    }

    /// Install a new forming bar, promoting any older forming bar to closed.
    ///
    /// Returns `true` when the closed set changed, either by a promotion or by
    /// front eviction.
    fn push_forming(&mut self, candle: Candle) -> bool {
        let promoted = match self.forming.take() {
            Some(previous) => {
                self.closed.push_back(previous);
                true
            }
            None => false,
        };
        self.forming = Some(candle);
        let evicted = self.trim();
        promoted || evicted
    }

    /// Evict from the front down to capacity. Returns whether anything went.
    fn trim(&mut self) -> bool {
        let before = self.closed.len();
        while self.len() > self.capacity && self.closed.pop_front().is_some() {}
        self.closed.len() != before
    }
}

// ---------------------------------------------------------------------------
// Kline push messages
// ---------------------------------------------------------------------------

/// One decoded kline push message.
#[derive(Debug, Clone, PartialEq)]
pub struct KlineUpdate {
    pub key: CandleKey,
    pub candle: Candle,
    pub is_closed: bool,
}

/// Decode a kline frame (single-stream or combined envelope).
///
/// Returns `Ok(None)` when the frame is some other event type, and an error
/// when a kline frame is missing or has malformed fields.
///
/// Expected shape:
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { "t": .., "T": .., "i": "1m", "o": "..", "x": false, .. } }
/// ```
pub fn parse_kline(frame: &serde_json::Value) -> Result<Option<KlineUpdate>> {
    let data = payload(frame);

    match data["e"].as_str() {
        Some(KLINE_EVENT) => {}
        other => {
            warn!(event = ?other, "dropping non-kline frame on kline feed");
            return Ok(None);
        }
    }

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let k = &data["k"];

    let interval = k["i"].as_str().context("missing field k.i")?.to_string();
    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let close_time = k["T"].as_i64().context("missing field k.T")?;

    let candle = Candle {
        open_time,
        close_time,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
    };
    let is_closed = k["x"].as_bool().context("missing field k.x")?;

    Ok(Some(KlineUpdate {
        key: CandleKey { symbol, interval },
        candle,
        is_closed,
    }))
}

// ---------------------------------------------------------------------------
// CandleAggregator
// ---------------------------------------------------------------------------

/// What [`CandleAggregator::apply`] did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Symbol or interval belongs to another subscription.
    Rejected,
    /// The forming bar was refreshed in place.
    Refreshed,
    /// A new forming bar was appended.
    Opened,
    /// The forming bar of the same open time became closed.
    Finalized,
    /// A new closed bar was appended.
    Appended,
    /// A forming echo of a bar that is already closed.
    Ignored,
}

/// Reconciles the REST seed with live kline updates for one (symbol,
/// interval) and keeps the indicator set in step with the buffer.
///
/// Not thread-safe on its own; one pump task owns all mutation.
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    key: CandleKey,
    buffer: BarBuffer,
    /// Open time of the most recent bar taken from the stream.
    last_seen: Option<i64>,
    indicators: Option<IndicatorSet>,
    history: Vec<IndicatorPoint>,
}

impl CandleAggregator {
    pub fn new(key: CandleKey) -> Self {
        Self {
            key,
            buffer: BarBuffer::new(MAX_BARS),
            last_seen: None,
            indicators: None,
            history: Vec::new(),
        }
    }

    pub fn key(&self) -> &CandleKey {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn bars(&self) -> Vec<BarEntry> {
        self.buffer.entries()
    }

    pub fn indicators(&self) -> Option<&IndicatorSet> {
        self.indicators.as_ref()
    }

    pub fn history(&self) -> &[IndicatorPoint] {
        &self.history
    }

    /// Replace the buffer wholesale with a historical seed (oldest-first).
    ///
    /// Bars whose close time is before `now_ms` are closed; a final bar that
    /// is still open becomes the forming bar.
    pub fn seed(&mut self, candles: Vec<Candle>, now_ms: i64) {
        self.buffer.clear();
        self.last_seen = None;

        let count = candles.len();
        for (i, candle) in candles.into_iter().enumerate() {
            if i + 1 == count && candle.close_time >= now_ms {
                self.buffer.push_forming(candle);
            } else {
                self.buffer.push_closed(candle);
            }
        }

        debug!(key = %self.key, bars = self.buffer.len(), "buffer seeded");
        self.recompute_full();
    }

    /// Merge one live update into the buffer.
    pub fn apply(&mut self, update: KlineUpdate) -> MergeOutcome {
        if update.key != self.key {
            debug!(
                expected = %self.key,
                got = %update.key,
                "ignoring kline for inactive subscription"
            );
            return MergeOutcome::Rejected;
        }

        let open_time = update.candle.open_time;
        let forming_time = self.buffer.forming().map(|c| c.open_time);

        if update.is_closed {
            let outcome = if forming_time == Some(open_time) {
                MergeOutcome::Finalized
            } else {
                MergeOutcome::Appended
            };
            self.buffer.push_closed(update.candle);
            self.last_seen = Some(open_time);
            self.recompute_full();
            return outcome;
        }

        if forming_time == Some(open_time) {
            self.buffer.forming = Some(update.candle);
            self.recompute_current();
            return MergeOutcome::Refreshed;
        }

        if self.last_seen == Some(open_time) {
            debug!(key = %self.key, open_time, "forming update for an already closed bar");
            return MergeOutcome::Ignored;
        }

        let reshaped = self.buffer.push_forming(update.candle);
        self.last_seen = Some(open_time);
        if reshaped || self.history.len() != self.buffer.len() {
            self.recompute_full();
        } else {
            self.recompute_current();
        }
        MergeOutcome::Opened
    }

    fn recompute_full(&mut self) {
        match compute_indicators(&self.buffer.candles()) {
            Some(output) => {
                self.indicators = Some(output.current);
                self.history = output.history;
            }
            None => {
                self.indicators = None;
                self.history.clear();
            }
        }
    }

    fn recompute_current(&mut self) {
        self.indicators = compute_current(&self.buffer.candles());
        if self.indicators.is_none() {
            self.history.clear();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
