//! A single pass of sequential Monte Carlo over all steps of a model.
//!
//! Without a retained trajectory this is plain SMC with `num_particles`
//! particles. With one, it is a conditional sweep: slot 0 always holds the
//! retained trajectory as of the current step and only the remaining
//! `num_particles - 1` particles are simulated.

use std::sync::Arc;

use itertools::Itertools;
use log::debug;
use rand::Rng;

use crate::{
    compose::compose,
    compress::{Compressor, MergeDuplicates},
    ensemble::Ensemble,
    error::{Result, SmcError},
    math::{check_log_weights, normalize_log_weights, sample_categorical},
    model::SmcModel,
    resample::{Resampler, ResamplingScheme},
    sampler::CancelToken,
    trajectory::{Genealogy, Trajectory},
};

/// Settings of a single sweep.
#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    /// Total number of particles, including the retained one in a
    /// conditional sweep.
    pub num_particles: usize,
    /// Return the whole weighted ensemble instead of only the new retained
    /// trajectory.
    pub rao_blackwellize: bool,
    /// Pass the final ensemble through the compressor.
    pub compress: bool,
    pub resampling: ResamplingScheme,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            num_particles: 100,
            rao_blackwellize: true,
            compress: false,
            resampling: ResamplingScheme::default(),
        }
    }
}

/// What a sweep leaves behind for the chain.
#[derive(Debug, Clone)]
pub enum Sample {
    /// The weighted final ensemble.
    Full(Ensemble),
    /// The final ensemble after compression.
    Compressed(Ensemble),
    /// Only the retained trajectory, with relative weight one.
    Retained(Ensemble),
}

impl Sample {
    pub fn ensemble(&self) -> &Ensemble {
        match self {
            Sample::Full(e) | Sample::Compressed(e) | Sample::Retained(e) => e,
        }
    }

    pub fn into_ensemble(self) -> Ensemble {
        match self {
            Sample::Full(e) | Sample::Compressed(e) | Sample::Retained(e) => e,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Sample::Compressed(_))
    }

    pub fn approx_bytes(&self) -> usize {
        self.ensemble().approx_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct SweepOutput {
    pub sample: Sample,
    /// Estimate of the log marginal likelihood.
    pub log_z: f64,
    /// Trajectory drawn from the final weights.
    pub retained: Trajectory,
    /// In a conditional sweep, the log weights the conditioning trajectory
    /// received at each step.
    pub conditioned_log_weights: Option<Vec<f64>>,
}

/// The sweep engine.
pub struct SmcSweep<S: Resampler = ResamplingScheme> {
    settings: SweepSettings,
    resampler: S,
    compressor: Arc<dyn Compressor>,
    cancel: Option<CancelToken>,
}

impl SmcSweep<ResamplingScheme> {
    pub fn new(settings: SweepSettings) -> Self {
        Self {
            settings,
            resampler: settings.resampling,
            compressor: Arc::new(MergeDuplicates),
            cancel: None,
        }
    }
}

impl<S: Resampler> SmcSweep<S> {
    /// Use a custom resampling step instead of `settings.resampling`.
    pub fn with_resampler<T: Resampler>(self, resampler: T) -> SmcSweep<T> {
        SmcSweep {
            settings: self.settings,
            resampler,
            compressor: self.compressor,
            cancel: self.cancel,
        }
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Stop between steps once `token` is cancelled.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn settings(&self) -> &SweepSettings {
        &self.settings
    }

    /// Run one sweep, conditional on `retained` if given.
    pub fn run<M: SmcModel, R: Rng + ?Sized>(
        &self,
        model: &M,
        retained: Option<&Trajectory>,
        rng: &mut R,
    ) -> Result<SweepOutput> {
        self.run_with(model, retained, self.settings.compress, rng)
    }

    pub(crate) fn run_with<M: SmcModel, R: Rng + ?Sized>(
        &self,
        model: &M,
        retained: Option<&Trajectory>,
        compress: bool,
        rng: &mut R,
    ) -> Result<SweepOutput> {
        let num_particles = self.settings.num_particles;
        if num_particles == 0 {
            return Err(SmcError::InvalidSettings("a sweep needs at least one particle".into()));
        }
        let num_steps = model.num_steps();
        if num_steps == 0 {
            return Err(SmcError::InvalidSettings("the model has no steps".into()));
        }
        if let Some(retained) = retained {
            if retained.num_steps() != num_steps {
                return Err(SmcError::InvalidLineage(format!(
                    "retained trajectory has {} steps, the model has {}",
                    retained.num_steps(),
                    num_steps
                )));
            }
        }

        let num_free = num_particles - usize::from(retained.is_some());
        let mut genealogy = Genealogy::new(retained.is_some(), num_steps);
        let mut conditioned = retained.map(|_| Vec::with_capacity(num_steps));
        let mut particles = Ensemble::new(num_free);
        let mut log_z = 0f64;

        for step in 0..num_steps {
            self.check_cancelled()?;

            if num_free > 0 {
                model
                    .sample(step, &mut particles, num_particles, rng)
                    .map_err(|source| SmcError::Model { step, source })?;
                check_rows("particles after sampling", num_free, particles.len())?;
            }
            let widths = particles.step_widths();

            let state = retained.map(|r| r.state_at(step)).transpose()?;
            let mut log_weights = Vec::with_capacity(num_particles);
            if let Some(state) = &state {
                let weight = model
                    .log_weight(step, state, num_particles)
                    .map_err(|source| SmcError::Model { step, source })?;
                check_rows("retained log weight", 1, weight.len())?;
                log_weights.push(weight[0]);
            }
            if num_free > 0 {
                let weights = model
                    .log_weight(step, &particles, num_particles)
                    .map_err(|source| SmcError::Model { step, source })?;
                check_rows("log weights", num_free, weights.len())?;
                log_weights.extend(weights);
            }
            check_log_weights(&log_weights)?;
            if let Some(conditioned) = &mut conditioned {
                conditioned.push(log_weights[0]);
            }

            if step + 1 < num_steps {
                let (ancestors, contribution) =
                    self.resampler.resample(&log_weights, num_free, rng)?;
                log_z += contribution;
                debug!(
                    "step {}: resampled {} particles, log Z contribution {:.4}",
                    step, num_free, contribution
                );
                particles = reindex(&particles, &ancestors, state.as_ref())?;
                genealogy.record_step(widths, log_weights);
                genealogy.record_resampling(ancestors);
            } else {
                genealogy.record_step(widths, log_weights);
            }
        }

        let final_log_weights = genealogy.last_log_weights().unwrap_or_default();
        let (weights, log_mean) = normalize_log_weights(final_log_weights)?;
        log_z += log_mean;

        let mut ensemble = match retained {
            Some(retained) => {
                let last = retained.state_at(num_steps - 1)?;
                let output = (0..num_particles).collect_vec();
                compose(None, &last, &particles, &output, None, None)?
            }
            None => particles,
        };
        check_rows("final ensemble", num_particles, ensemble.len())?;
        let slot = sample_categorical(&weights, rng)?;
        ensemble.set_weights(weights)?;
        let new_retained = genealogy.trajectory(&ensemble, slot, retained)?;
        debug!(
            "sweep finished with {} particles, log Z {:.4}, retained slot {}",
            num_particles, log_z, slot
        );

        let sample = if !self.settings.rao_blackwellize {
            let mut particle = new_retained.particle().clone();
            particle.set_weights(vec![1f64])?;
            Sample::Retained(particle)
        } else if compress {
            self.compress_sample(Sample::Full(ensemble), num_steps)?
        } else {
            Sample::Full(ensemble)
        };

        Ok(SweepOutput {
            sample,
            log_z,
            retained: new_retained,
            conditioned_log_weights: conditioned,
        })
    }

    /// Pass a full ensemble through the compressor. Other samples are
    /// returned as they are.
    pub(crate) fn compress_sample(&self, sample: Sample, num_steps: usize) -> Result<Sample> {
        match sample {
            Sample::Full(ensemble) => self
                .compressor
                .compress(ensemble, num_steps)
                .map(Sample::Compressed)
                .map_err(SmcError::Compression),
            other => Ok(other),
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) => token.check(),
            None => Ok(()),
        }
    }
}

fn check_rows(context: &str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(SmcError::RowCountMismatch {
            context: context.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Build the next block of simulated particles from resampled slots.
///
/// Without a retained state the ancestors index `particles` directly.
/// Otherwise slot 0 is the retained state and slot `i > 0` is row `i - 1`
/// of `particles`.
fn reindex(
    particles: &Ensemble,
    ancestors: &[usize],
    retained_state: Option<&Ensemble>,
) -> Result<Ensemble> {
    let Some(state) = retained_state else {
        return Ok(particles.select(ancestors));
    };

    let (replicas, survivors): (Vec<usize>, Vec<usize>) =
        (0..ancestors.len()).partition(|&i| ancestors[i] == 0);
    let survivor_rows = survivors.iter().map(|&i| ancestors[i] - 1).collect_vec();
    if replicas.is_empty() {
        return Ok(particles.select(&survivor_rows));
    }

    let output = replicas.iter().chain(&survivors).copied().collect_vec();
    compose(
        None,
        state,
        particles,
        &output,
        Some(vec![0; replicas.len()].as_slice()),
        Some(survivor_rows.as_slice()),
    )
}

/// One conditional (or, without `retained`, unconditional) sweep with the
/// default resampler and compressor.
pub fn pg_sweep<M: SmcModel, R: Rng + ?Sized>(
    model: &M,
    settings: &SweepSettings,
    retained: Option<&Trajectory>,
    rng: &mut R,
) -> Result<SweepOutput> {
    SmcSweep::new(*settings).run(model, retained, rng)
}
