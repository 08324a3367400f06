//! Engle-Granger co-integration between two close-price series.
//!
//! The hedge ratio is a zero-intercept OLS slope of A on B. The test itself
//! regresses A on B with a constant, runs an augmented Dickey-Fuller test on
//! the residuals (lag order by AIC) and maps the statistic to a p-value and
//! critical values with MacKinnon's response surfaces for two variables.

use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::analysis::AnalysisError;

/// The strategy accepts pairs far beyond the usual 5% level on purpose; keep
/// it configurable rather than tightening it here.
pub const DEFAULT_P_VALUE_THRESHOLD: f64 = 0.5;
pub const MIN_OBSERVATIONS: usize = 20;
const DISPLAY_DECIMALS: i32 = 2;

// MacKinnon (1994), constant term, N = 2.
const TAU_MAX: f64 = 0.92;
const TAU_MIN: f64 = -18.86;
const TAU_STAR: f64 = -2.62;
const TAU_SMALLP: [f64; 3] = [2.92, 1.5012, 0.039796];
const TAU_LARGEP: [f64; 4] = [2.1945, 0.64695, -0.29198, -0.042377];

// MacKinnon (2010), constant term, N = 2; rows are 1%, 5%, 10%.
const CRIT_COEFFS: [[f64; 4]; 3] = [
    [-3.89644, -10.9519, -33.527, 0.0],
    [-3.33613, -6.1101, -6.823, 0.0],
    [-3.04445, -4.2412, -2.720, 0.0],
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CointegrationResult {
    pub p_value: f64,
    pub t_statistic: f64,
    pub critical_value: f64,
    /// Rounded for reporting.
    pub hedge_ratio: f64,
    /// Full precision, used for spread construction.
    pub hedge_ratio_exact: f64,
    pub cointegrated: bool,
    pub zero_crossings: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngleGranger {
    pub t_statistic: f64,
    pub p_value: f64,
    /// 1%, 5% and 10% critical values.
    pub critical_values: [f64; 3],
    pub lags: usize,
}

pub fn analyze(series_a: &[f64], series_b: &[f64]) -> Option<CointegrationResult> {
    analyze_with(series_a, series_b, DEFAULT_P_VALUE_THRESHOLD)
}

/// `None` means "skip this pair"; the reason is logged at debug level.
pub fn analyze_with(
    series_a: &[f64],
    series_b: &[f64],
    p_threshold: f64,
) -> Option<CointegrationResult> {
    match try_analyze(series_a, series_b, p_threshold) {
        Ok(result) => Some(result),
        Err(err) => {
            log::debug!("[COINT] pair skipped: {}", err);
            None
        }
    }
}

pub fn try_analyze(
    series_a: &[f64],
    series_b: &[f64],
    p_threshold: f64,
) -> Result<CointegrationResult, AnalysisError> {
    let test = engle_granger(series_a, series_b)?;
    let hedge = hedge_ratio(series_a, series_b);
    if !hedge.is_finite() {
        return Err(AnalysisError::DegenerateFit("hedge ratio undefined".to_string()));
    }
    let crossings = zero_crossings(&spread(series_a, series_b, hedge));
    let critical_value = test.critical_values[1];
    Ok(CointegrationResult {
        p_value: round_display(test.p_value),
        t_statistic: round_display(test.t_statistic),
        critical_value: round_display(critical_value),
        hedge_ratio: round_display(hedge),
        hedge_ratio_exact: hedge,
        cointegrated: is_cointegrated(test.p_value, test.t_statistic, critical_value, p_threshold),
        zero_crossings: crossings,
    })
}

pub fn is_cointegrated(
    p_value: f64,
    t_statistic: f64,
    critical_value: f64,
    p_threshold: f64,
) -> bool {
    p_value < p_threshold && t_statistic < critical_value
}

/// Zero-intercept least squares slope of `a` on `b`.
pub fn hedge_ratio(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    let (mut ab, mut bb) = (0.0, 0.0);
    for i in 0..n {
        ab += a[i] * b[i];
        bb += b[i] * b[i];
    }
    if bb.abs() < f64::EPSILON {
        f64::NAN
    } else {
        ab / bb
    }
}

pub fn spread(a: &[f64], b: &[f64], hedge_ratio: f64) -> Vec<f64> {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| x - hedge_ratio * y)
        .collect()
}

/// Sign changes between consecutive nonzero values; zeros carry the previous
/// sign forward.
pub fn zero_crossings(spread: &[f64]) -> usize {
    let mut last_sign = 0.0_f64;
    let mut crossings = 0;
    for &value in spread {
        if value == 0.0 || value.is_nan() {
            continue;
        }
        let sign = value.signum();
        if last_sign != 0.0 && sign != last_sign {
            crossings += 1;
        }
        last_sign = sign;
    }
    crossings
}

pub fn engle_granger(series_a: &[f64], series_b: &[f64]) -> Result<EngleGranger, AnalysisError> {
    if series_a.len() != series_b.len() {
        return Err(AnalysisError::LengthMismatch {
            left: series_a.len(),
            right: series_b.len(),
        });
    }
    let n = series_a.len();
    if n < MIN_OBSERVATIONS {
        return Err(AnalysisError::InsufficientData {
            needed: MIN_OBSERVATIONS,
            got: n,
        });
    }

    let residuals = cointegrating_residuals(series_a, series_b)?;
    let (t_statistic, lags) = adf_no_trend(&residuals)?;
    if !t_statistic.is_finite() {
        return Err(AnalysisError::DegenerateFit(format!(
            "test statistic {}",
            t_statistic
        )));
    }
    Ok(EngleGranger {
        t_statistic,
        p_value: mackinnon_p_value(t_statistic)?,
        critical_values: mackinnon_critical_values(n - 1),
        lags,
    })
}

fn cointegrating_residuals(a: &[f64], b: &[f64]) -> Result<Vec<f64>, AnalysisError> {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_b = 0.0;
    let mut var_a = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        cov += (x - mean_a) * (y - mean_b);
        var_b += (y - mean_b) * (y - mean_b);
        var_a += (x - mean_a) * (x - mean_a);
    }
    if var_b < 1e-12 || var_a < 1e-12 {
        return Err(AnalysisError::DegenerateFit("constant series".to_string()));
    }
    let beta = cov / var_b;
    let alpha = mean_a - beta * mean_b;
    let residuals: Vec<f64> = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| x - alpha - beta * y)
        .collect();

    let ssr: f64 = residuals.iter().map(|r| r * r).sum();
    let r_squared = 1.0 - ssr / var_a;
    if r_squared >= 1.0 - 100.0 * f64::EPSILON.sqrt() {
        return Err(AnalysisError::DegenerateFit(
            "series are perfectly collinear".to_string(),
        ));
    }
    Ok(residuals)
}

struct OlsFit {
    coef0: f64,
    se0: f64,
    ssr: f64,
    nobs: usize,
    k: usize,
}

impl OlsFit {
    fn aic(&self) -> f64 {
        let n = self.nobs as f64;
        let llf = -n / 2.0 * ((2.0 * std::f64::consts::PI).ln() + (self.ssr / n).ln() + 1.0);
        -2.0 * llf + 2.0 * self.k as f64
    }

    fn t_statistic(&self) -> f64 {
        self.coef0 / self.se0
    }
}

/// ADF regression of Δe_t on e_{t-1} and `lags` lagged differences, rows
/// `start..diffs.len()` so that every candidate lag shares one sample.
fn adf_fit(levels: &[f64], diffs: &[f64], lags: usize, start: usize) -> Option<OlsFit> {
    let rows = diffs.len().checked_sub(start)?;
    let k = lags + 1;
    if rows <= k {
        return None;
    }
    let x = DMatrix::from_fn(rows, k, |r, c| {
        let t = start + r;
        if c == 0 {
            levels[t]
        } else {
            diffs[t - c]
        }
    });
    let y = DVector::from_fn(rows, |r, _| diffs[start + r]);
    let xt = x.transpose();
    let inv = (&xt * &x).try_inverse()?;
    let beta = &inv * (&xt * &y);
    let resid = &y - &x * &beta;
    let ssr = resid.norm_squared();
    let sigma2 = ssr / (rows - k) as f64;
    let se0 = (sigma2 * inv[(0, 0)]).sqrt();
    Some(OlsFit {
        coef0: beta[0],
        se0,
        ssr,
        nobs: rows,
        k,
    })
}

fn adf_no_trend(levels: &[f64]) -> Result<(f64, usize), AnalysisError> {
    let n = levels.len();
    let diffs: Vec<f64> = levels.windows(2).map(|w| w[1] - w[0]).collect();
    let schwert = (12.0 * (n as f64 / 100.0).powf(0.25)).ceil() as usize;
    let max_lag = schwert.min((n / 2).saturating_sub(1));

    let mut best: Option<(f64, usize)> = None;
    for lags in 0..=max_lag {
        if let Some(fit) = adf_fit(levels, &diffs, lags, max_lag) {
            let aic = fit.aic();
            if aic.is_finite() && best.map(|(b, _)| aic < b).unwrap_or(true) {
                best = Some((aic, lags));
            }
        }
    }
    let (_, lags) = best.ok_or_else(|| {
        AnalysisError::DegenerateFit("no ADF lag order could be fitted".to_string())
    })?;
    let fit = adf_fit(levels, &diffs, lags, lags)
        .ok_or_else(|| AnalysisError::DegenerateFit("singular ADF regression".to_string()))?;
    Ok((fit.t_statistic(), lags))
}

pub fn mackinnon_p_value(t_statistic: f64) -> Result<f64, AnalysisError> {
    if t_statistic > TAU_MAX {
        return Ok(1.0);
    }
    if t_statistic < TAU_MIN {
        return Ok(0.0);
    }
    let poly = if t_statistic <= TAU_STAR {
        polyval(&TAU_SMALLP, t_statistic)
    } else {
        polyval(&TAU_LARGEP, t_statistic)
    };
    let normal =
        Normal::new(0.0, 1.0).map_err(|e| AnalysisError::DegenerateFit(e.to_string()))?;
    Ok(normal.cdf(poly))
}

pub fn mackinnon_critical_values(nobs: usize) -> [f64; 3] {
    let n = nobs.max(1) as f64;
    let mut out = [0.0; 3];
    for (slot, c) in out.iter_mut().zip(CRIT_COEFFS.iter()) {
        *slot = c[0] + c[1] / n + c[2] / (n * n) + c[3] / (n * n * n);
    }
    out
}

fn polyval(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

fn round_display(value: f64) -> f64 {
    let factor = 10f64.powi(DISPLAY_DECIMALS);
    (value * factor).round() / factor
}
