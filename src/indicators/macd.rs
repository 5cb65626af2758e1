// =============================================================================
// Moving Average Convergence / Divergence (MACD)
// =============================================================================
//
//   line      = EMA(fast) - EMA(slow)
//   signal    = EMA(signal_period) of line
//   histogram = line - signal
//
// The line exists from close index `slow - 1`; signal and histogram from
// `slow + signal_period - 2`.
// =============================================================================

use serde::Serialize;

use super::ema::{calculate_ema, ema_aligned};

pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MacdReading {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Bar-aligned MACD triad. Entries are `None` until the signal line exists.
pub fn macd_aligned(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Vec<Option<MacdReading>> {
    let len = closes.len();
    let mut out = vec![None; len];
    if fast == 0 || slow <= fast || signal_period == 0 {
        return out;
    }

    let fast_ema = ema_aligned(closes, fast);
    let slow_ema = ema_aligned(closes, slow);

    let line: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .skip(slow - 1)
        .map_while(|(f, s)| Some((*f)? - (*s)?))
        .collect();

    let signal = calculate_ema(&line, signal_period);
    let first = slow - 1 + signal_period - 1;

    for (i, &sig) in signal.iter().enumerate() {
        let idx = first + i;
        let macd = line[signal_period - 1 + i];
        if let Some(slot) = out.get_mut(idx) {
            *slot = Some(MacdReading {
                macd,
                signal: sig,
                histogram: macd - sig,
            });
        }
    }

    out
}
