// =============================================================================
// Indicator Engine — full indicator set + per-bar history over a bar window
// =============================================================================
//
// Stateless. Every call recomputes from the complete window; nothing is
// carried across calls because front eviction shifts every trailing window.
// Output is defined only once the window holds `MIN_LOOKBACK` bars.
// =============================================================================

use serde::Serialize;

use super::bollinger::{bollinger_aligned, BollingerReading, BollingerResult, BB_PERIOD, BB_STD_DEV};
use super::ema::{align, ema_aligned, EmaSet};
use super::macd::{macd_aligned, MacdReading, MACD_FAST, MACD_SIGNAL, MACD_SLOW};
use super::rsi::{calculate_rsi, RsiReading, RSI_PERIOD};
use crate::market_data::Candle;

/// Bars required before any indicator output is produced.
pub const MIN_LOOKBACK: usize = 200;

/// Current indicator values for the latest bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorSet {
    pub open_time: i64,
    pub price: f64,
    pub rsi: RsiReading,
    pub macd: MacdReading,
    pub ema: EmaSet,
    pub bollinger: BollingerReading,
}

/// One bar-aligned entry of the charting history. Values still inside their
/// warm-up period are `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorPoint {
    pub open_time: i64,
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_lower: Option<f64>,
    pub ema9: Option<f64>,
    pub ema21: Option<f64>,
    pub ema50: Option<f64>,
    pub ema200: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorOutput {
    pub current: IndicatorSet,
    pub history: Vec<IndicatorPoint>,
}

/// Bar-aligned series shared by the current-value and history paths so both
/// read identical numbers.
struct Series {
    rsi: Vec<Option<f64>>,
    macd: Vec<Option<MacdReading>>,
    bollinger: Vec<Option<BollingerResult>>,
    ema9: Vec<Option<f64>>,
    ema21: Vec<Option<f64>>,
    ema50: Vec<Option<f64>>,
    ema200: Vec<Option<f64>>,
}

impl Series {
    fn build(closes: &[f64]) -> Self {
        Self {
            rsi: align(&calculate_rsi(closes, RSI_PERIOD), RSI_PERIOD, closes.len()),
            macd: macd_aligned(closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL),
            bollinger: bollinger_aligned(closes, BB_PERIOD, BB_STD_DEV),
            ema9: ema_aligned(closes, 9),
            ema21: ema_aligned(closes, 21),
            ema50: ema_aligned(closes, 50),
            ema200: ema_aligned(closes, 200),
        }
    }

    fn point(&self, i: usize, open_time: i64) -> IndicatorPoint {
        let macd = self.macd[i];
        let bands = self.bollinger[i];
        IndicatorPoint {
            open_time,
            rsi: self.rsi[i],
            macd: macd.map(|m| m.macd),
            macd_signal: macd.map(|m| m.signal),
            macd_histogram: macd.map(|m| m.histogram),
            bb_upper: bands.map(|b| b.upper),
            bb_middle: bands.map(|b| b.middle),
            bb_lower: bands.map(|b| b.lower),
            ema9: self.ema9[i],
            ema21: self.ema21[i],
            ema50: self.ema50[i],
            ema200: self.ema200[i],
        }
    }

    fn current(&self, candles: &[Candle]) -> Option<IndicatorSet> {
        let last = candles.last()?;
        let i = candles.len() - 1;
        Some(IndicatorSet {
            open_time: last.open_time,
            price: last.close,
            rsi: RsiReading::new(self.rsi[i]?),
            macd: self.macd[i]?,
            ema: EmaSet {
                ema9: self.ema9[i]?,
                ema21: self.ema21[i]?,
                ema50: self.ema50[i]?,
                ema200: self.ema200[i]?,
            },
            bollinger: BollingerReading::new(&self.bollinger[i]?, last.close),
        })
    }
}

fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

/// Current values plus the full per-bar history.
///
/// Returns `None` below [`MIN_LOOKBACK`] bars or when the latest bar cannot
/// produce a finite value for every indicator.
pub fn compute_indicators(candles: &[Candle]) -> Option<IndicatorOutput> {
    if candles.len() < MIN_LOOKBACK {
        return None;
    }
    let series = Series::build(&closes(candles));
    let current = series.current(candles)?;
    let history = candles
        .iter()
        .enumerate()
        .map(|(i, c)| series.point(i, c.open_time))
        .collect();
    Some(IndicatorOutput { current, history })
}

/// Current values only; used for forming-bar refreshes where the history is
/// left as of the last closed bar.
pub fn compute_current(candles: &[Candle]) -> Option<IndicatorSet> {
    if candles.len() < MIN_LOOKBACK {
        return None;
    }
    Series::build(&closes(candles)).current(candles)
}
