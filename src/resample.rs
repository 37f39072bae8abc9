use rand::Rng;

use crate::{
    error::Result,
    math::{cumulative, normalize_log_weights, search_cumulative},
};

/// A single resampling step.
///
/// Given `log_weights` of the current particles, returns `count` ancestor
/// indices into `log_weights` together with the step's contribution to the
/// log marginal likelihood, `ln(mean(exp(log_weights)))`.
///
/// Implementations must draw index `i` with an expected frequency
/// proportional to `exp(log_weights[i])`.
pub trait Resampler {
    fn resample<R: Rng + ?Sized>(
        &self,
        log_weights: &[f64],
        count: usize,
        rng: &mut R,
    ) -> Result<(Vec<usize>, f64)>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResamplingScheme {
    /// Independent draws from the weights.
    #[default]
    Multinomial,
    /// A single uniform offset shared by `count` evenly spaced points.
    Systematic,
    /// One uniform draw in each of `count` equal strata.
    Stratified,
}

impl Resampler for ResamplingScheme {
    fn resample<R: Rng + ?Sized>(
        &self,
        log_weights: &[f64],
        count: usize,
        rng: &mut R,
    ) -> Result<(Vec<usize>, f64)> {
        let (weights, log_mean) = normalize_log_weights(log_weights)?;
        let cdf = cumulative(&weights);
        let total = cdf.last().copied().unwrap_or(1f64);
        let spacing = total / count.max(1) as f64;

        let ancestors = match self {
            ResamplingScheme::Multinomial => (0..count)
                .map(|_| search_cumulative(&cdf, rng.random::<f64>() * total))
                .collect(),
            ResamplingScheme::Systematic => {
                let offset = rng.random::<f64>();
                (0..count)
                    .map(|i| search_cumulative(&cdf, (i as f64 + offset) * spacing))
                    .collect()
            }
            ResamplingScheme::Stratified => (0..count)
                .map(|i| search_cumulative(&cdf, (i as f64 + rng.random::<f64>()) * spacing))
                .collect(),
        };
        Ok((ancestors, log_mean))
    }
}
