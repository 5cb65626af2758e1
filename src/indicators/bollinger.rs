// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA(period), upper/lower = SMA ± k·σ (population σ).
// Bandwidth   = (upper - lower) / middle * 100
// Percent-B   = (price - lower) / (upper - lower)

use serde::Serialize;

pub const BB_PERIOD: usize = 20;
pub const BB_STD_DEV: f64 = 2.0;
/// Bandwidth below this value is flagged as a squeeze.
pub const SQUEEZE_BANDWIDTH: f64 = 2.0;

/// Bands for a single window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
}

impl BollingerResult {
    /// Position of `price` within the bands. Collapsed bands yield 0.5.
    pub fn percent_b(&self, price: f64) -> f64 {
        let span = self.upper - self.lower;
        if span == 0.0 {
            0.5
        } else {
            (price - self.lower) / span
        }
    }

    pub fn is_squeeze(&self) -> bool {
        self.width < SQUEEZE_BANDWIDTH
    }
}

/// Bands plus the derived presentation metrics for the latest close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BollingerReading {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub percent_b: f64,
    pub bandwidth: f64,
    pub squeeze: bool,
}

impl BollingerReading {
    pub fn new(bands: &BollingerResult, price: f64) -> Self {
        Self {
            upper: bands.upper,
            middle: bands.middle,
            lower: bands.lower,
            percent_b: bands.percent_b(price),
            bandwidth: bands.width,
            squeeze: bands.is_squeeze(),
        }
    }
}

/// Bands over the last `period` closes.
///
/// Returns `None` when there are fewer than `period` closes, when the middle
/// band is zero, or when the width is non-finite.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;

    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    width.is_finite().then_some(BollingerResult {
        upper,
        middle,
        lower,
        width,
    })
}

/// Bands for the trailing window ending at every close (bar-aligned).
pub fn bollinger_aligned(closes: &[f64], period: usize, num_std: f64) -> Vec<Option<BollingerResult>> {
    (0..closes.len())
        .map(|i| calculate_bollinger(&closes[..=i], period, num_std))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic_ordering() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(bb.width > 0.0);
        assert!((bb.middle - 10.5).abs() < 1e-10);
    }

    #[test]
    fn bollinger_insufficient_data() {
        assert!(calculate_bollinger(&[1.0, 2.0, 3.0], 20, 2.0).is_none());
    }

    #[test]
    fn flat_window_collapses_bands() {
        let bb = calculate_bollinger(&[100.0; 20], 20, 2.0).unwrap();
        assert!(bb.width.abs() < 1e-10);
        assert!(bb.is_squeeze());
        assert!((bb.percent_b(100.0) - 0.5).abs() < 1e-10);
    }

    #[test]
    fn percent_b_at_the_bands() {
        let bands = BollingerResult {
            upper: 110.0,
            middle: 100.0,
            lower: 90.0,
            width: 20.0,
        };
        assert!((bands.percent_b(110.0) - 1.0).abs() < 1e-10);
        assert!(bands.percent_b(90.0).abs() < 1e-10);
        assert!(!bands.is_squeeze());

        let reading = BollingerReading::new(&bands, 100.0);
        assert!((reading.percent_b - 0.5).abs() < 1e-10);
        assert!((reading.bandwidth - 20.0).abs() < 1e-10);
    }

    #[test]
    fn aligned_bands_start_after_warm_up() {
        let closes: Vec<f64> = (1..=25).map(|x| x as f64).collect();
        let series = bollinger_aligned(&closes, 20, 2.0);
        assert_eq!(series.len(), 25);
        assert!(series[18].is_none());
        assert!(series[19].is_some());
        assert_eq!(series[24], calculate_bollinger(&closes, 20, 2.0));
    }
}
