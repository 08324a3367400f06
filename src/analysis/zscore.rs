use serde::Serialize;

use crate::analysis::cointegration::{self, CointegrationResult};

/// Trailing-window z-score of `spread`. The first `window - 1` entries, and
/// any window with zero deviation, are NaN.
pub fn rolling_zscore(spread: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; spread.len()];
    if window < 2 || window > spread.len() {
        return out;
    }
    for end in (window - 1)..spread.len() {
        let slice = &spread[end + 1 - window..=end];
        let Some((mean, std)) = sample_mean_std(slice) else {
            continue;
        };
        if std > 1e-12 {
            out[end] = (spread[end] - mean) / std;
        }
    }
    out
}

fn sample_mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
    Some((mean, var.sqrt()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalSide {
    Positive,
    Negative,
}

impl SignalSide {
    pub fn of(zscore: f64) -> Self {
        if zscore >= 0.0 {
            SignalSide::Positive
        } else {
            SignalSide::Negative
        }
    }

    /// True once `zscore` sits strictly on the other side of zero.
    pub fn has_reverted(self, zscore: f64) -> bool {
        match self {
            SignalSide::Positive => zscore < 0.0,
            SignalSide::Negative => zscore > 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Signal {
    pub zscore: f64,
    pub hot: bool,
    pub side: SignalSide,
}

pub fn classify_signal(zscore: f64, threshold: f64) -> Signal {
    Signal {
        zscore,
        hot: zscore.abs() > threshold,
        side: SignalSide::of(zscore),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZScoreReading {
    pub zscore: f64,
    pub coint: CointegrationResult,
}

/// Latest defined z-score of the pair's spread, built with the exact hedge
/// ratio of a fresh co-integration fit.
pub fn latest_zscore(
    series_a: &[f64],
    series_b: &[f64],
    window: usize,
    p_threshold: f64,
) -> Option<ZScoreReading> {
    let coint = cointegration::analyze_with(series_a, series_b, p_threshold)?;
    let spread = cointegration::spread(series_a, series_b, coint.hedge_ratio_exact);
    let zscore = *rolling_zscore(&spread, window).last()?;
    if zscore.is_nan() {
        return None;
    }
    Some(ZScoreReading { zscore, coint })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::cointegration::test_series::cointegrated_pair;

    #[test]
    fn window_three_on_linear_spread() {
        let z = rolling_zscore(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert_eq!(z.len(), 5);
        assert!(z[0].is_nan() && z[1].is_nan());
        for value in &z[2..] {
            assert!((value - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn leading_undefined_count_matches_window() {
        let spread: Vec<f64> = (0..30).map(|i| ((i * 7) % 11) as f64).collect();
        let window = 8;
        let z = rolling_zscore(&spread, window);
        assert_eq!(z.iter().take_while(|v| v.is_nan()).count(), window - 1);
        assert_eq!(
            z.iter().filter(|v| !v.is_nan()).count(),
            spread.len() - window + 1
        );
    }

    #[test]
    fn flat_window_and_oversized_window_are_undefined() {
        let z = rolling_zscore(&[2.0, 2.0, 2.0, 5.0], 3);
        assert!(z[2].is_nan());
        assert!(!z[3].is_nan());
        assert!(rolling_zscore(&[1.0, 2.0], 5).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn classify_uses_strict_threshold_and_sign() {
        let s = classify_signal(1.6, 1.5);
        assert!(s.hot);
        assert_eq!(s.side, SignalSide::Positive);
        let s = classify_signal(-2.0, 1.5);
        assert!(s.hot);
        assert_eq!(s.side, SignalSide::Negative);
        assert!(!classify_signal(1.5, 1.5).hot);
        assert!(!classify_signal(f64::NAN, 1.5).hot);
    }

    #[test]
    fn reversion_requires_crossing_zero() {
        assert!(SignalSide::Positive.has_reverted(-0.1));
        assert!(!SignalSide::Positive.has_reverted(0.0));
        assert!(!SignalSide::Positive.has_reverted(0.4));
        assert!(SignalSide::Negative.has_reverted(0.2));
        assert!(!SignalSide::Negative.has_reverted(-1.0));
    }

    #[test]
    fn latest_zscore_reads_last_value() {
        let (a, b) = cointegrated_pair(120, 3);
        let reading = latest_zscore(&a, &b, 21, 0.5).unwrap();
        let spread = cointegration::spread(&a, &b, reading.coint.hedge_ratio_exact);
        let expected = *rolling_zscore(&spread, 21).last().unwrap();
        assert_eq!(reading.zscore, expected);
    }
}
