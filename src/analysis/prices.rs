use crate::analysis::AnalysisError;
use crate::trade::gateway::Candle;

/// Close prices in candle order, or an empty vector when any close is NaN.
///
/// A rolling window that spans a gap would be corrupted, so a series with a
/// hole is dropped as a whole rather than patched.
pub fn extract_close_prices(candles: &[Candle]) -> Vec<f64> {
    match closes_or_gap(candles) {
        Ok(closes) => closes,
        Err(err) => {
            log::debug!("[PRICES] discarding series: {}", err);
            Vec::new()
        }
    }
}

/// Like [`extract_close_prices`] but also requires exactly `depth` candles.
pub fn extract_complete(candles: &[Candle], depth: usize) -> Result<Vec<f64>, AnalysisError> {
    if candles.len() != depth {
        return Err(AnalysisError::Incomplete {
            expected: depth,
            got: candles.len(),
        });
    }
    closes_or_gap(candles)
}

fn closes_or_gap(candles: &[Candle]) -> Result<Vec<f64>, AnalysisError> {
    let mut closes = Vec::with_capacity(candles.len());
    for (index, candle) in candles.iter().enumerate() {
        if candle.close.is_nan() {
            return Err(AnalysisError::DataGap { index });
        }
        closes.push(candle.close);
    }
    Ok(closes)
}

#[cfg(test)]
pub(crate) fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Candle {
            start_time: i as i64 * 60,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        })
        .collect()
}
