// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators shown alongside the
// chart. Series functions return unpadded `Vec<f64>`; the `*_aligned` helpers
// pad them to one entry per bar for the charting history.

pub mod bollinger;
pub mod ema;
pub mod engine;
pub mod macd;
pub mod rsi;

pub use engine::{compute_current, compute_indicators, IndicatorPoint, IndicatorSet};
