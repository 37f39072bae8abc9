use rand::Rng;

use crate::error::{Result, SmcError};

/// Reject log weights that can not come from a valid density evaluation.
///
/// Negative infinity is allowed and means zero probability.
pub(crate) fn check_log_weights(log_weights: &[f64]) -> Result<()> {
    if let Some(pos) = log_weights
        .iter()
        .position(|w| w.is_nan() || *w == f64::INFINITY)
    {
        return Err(SmcError::InvalidWeights(format!(
            "log weight {} at row {} is not finite or negative infinity",
            log_weights[pos], pos
        )));
    }
    Ok(())
}

/// Turn log weights into relative weights that sum to one.
///
/// Also returns `ln(mean(exp(log_weights)))`, the contribution of this set of
/// weights to the log marginal likelihood.
pub(crate) fn normalize_log_weights(log_weights: &[f64]) -> Result<(Vec<f64>, f64)> {
    check_log_weights(log_weights)?;
    let max = log_weights
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return Err(SmcError::InvalidWeights(format!(
            "all {} weights are zero",
            log_weights.len()
        )));
    }
    let mut weights: Vec<f64> = log_weights.iter().map(|&w| (w - max).exp()).collect();
    let total: f64 = weights.iter().sum();
    weights.iter_mut().for_each(|w| *w /= total);
    let log_mean = max + total.ln() - (log_weights.len() as f64).ln();
    Ok((weights, log_mean))
}

/// Running sum of non-negative weights.
pub(crate) fn cumulative(weights: &[f64]) -> Vec<f64> {
    weights
        .iter()
        .scan(0f64, |acc, &w| {
            *acc += w;
            Some(*acc)
        })
        .collect()
}

/// Index of the first bucket whose cumulative weight exceeds `u`.
///
/// `u` is expected in `[0, cdf.last())`. Values at or past the end, which can
/// only appear through rounding, map to the last bucket with positive weight.
pub(crate) fn search_cumulative(cdf: &[f64], u: f64) -> usize {
    let idx = cdf.partition_point(|&c| c <= u);
    if idx < cdf.len() {
        return idx;
    }
    let total = cdf.last().copied().unwrap_or(0f64);
    cdf.iter().position(|&c| c >= total).unwrap_or(0)
}

/// Draw one index with probability proportional to `weights`.
pub(crate) fn sample_categorical<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Result<usize> {
    let cdf = cumulative(weights);
    let total = cdf.last().copied().unwrap_or(0f64);
    if total <= 0f64 || !total.is_finite() {
        return Err(SmcError::InvalidWeights(format!(
            "can not draw from weights with total {}",
            total
        )));
    }
    let u = rng.random::<f64>() * total;
    Ok(search_cumulative(&cdf, u))
}
