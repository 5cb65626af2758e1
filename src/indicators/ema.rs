// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first EMA value is seeded with the SMA of the first `period` closes, so
// the series starts at close index `period - 1`.
// =============================================================================

use serde::Serialize;

/// Compute the EMA series for `closes` and look-back `period`.
///
/// Each output element corresponds to a close starting at index `period - 1`.
/// Returns an empty `Vec` when the period is zero or the input is too short.
/// A non-finite intermediate value truncates the series.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev = ema;
    }

    result
}

/// Left-pad a series that starts at input index `offset` with `None` so that
/// element `i` lines up with input element `i`.
pub fn align(series: &[f64], offset: usize, len: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; len];
    for (i, &v) in series.iter().enumerate() {
        if let Some(slot) = out.get_mut(offset + i) {
            *slot = Some(v);
        }
    }
    out
}

/// Bar-aligned EMA series for `period`.
pub fn ema_aligned(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    align(
        &calculate_ema(closes, period),
        period.saturating_sub(1),
        closes.len(),
    )
}

/// Latest value of each EMA in the ribbon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EmaSet {
    pub ema9: f64,
    pub ema21: f64,
    pub ema50: f64,
    pub ema200: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_empty_input() {
        assert!(calculate_ema(&[], 5).is_empty());
    }

    #[test]
    fn ema_period_zero() {
        assert!(calculate_ema(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn ema_insufficient_data() {
        assert!(calculate_ema(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn ema_period_equals_length_is_sma() {
        let ema = calculate_ema(&[2.0, 4.0, 6.0], 3);
        assert_eq!(ema.len(), 1);
        assert!((ema[0] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_known_values() {
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let ema = calculate_ema(&closes, 5);
        assert_eq!(ema.len(), 6);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        let mut expected_vec = vec![expected];
        for &c in &closes[5..] {
            expected = c * mult + expected * (1.0 - mult);
            expected_vec.push(expected);
        }
        for (a, b) in ema.iter().zip(expected_vec.iter()) {
            assert!((a - b).abs() < 1e-10, "got {a}, expected {b}");
        }
    }

    #[test]
    fn ema_stops_at_nan() {
        let ema = calculate_ema(&[1.0, 2.0, 3.0, f64::NAN, 5.0], 3);
        assert_eq!(ema.len(), 1);
    }

    #[test]
    fn aligned_series_pads_warm_up() {
        let closes: Vec<f64> = (1..=6).map(|x| x as f64).collect();
        let aligned = ema_aligned(&closes, 3);
        assert_eq!(aligned.len(), 6);
        assert!(aligned[..2].iter().all(Option::is_none));
        assert_eq!(aligned[2], Some(2.0));
        assert!(aligned[5].is_some());
    }

    #[test]
    fn aligned_series_too_short_is_all_none() {
        let aligned = ema_aligned(&[1.0, 2.0], 9);
        assert_eq!(aligned, vec![None, None]);
    }
}
