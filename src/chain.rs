use std::sync::Arc;

use log::{debug, info};
use rand::Rng;
use thiserror::Error;

use crate::{
    compress::Compressor,
    ensemble::Ensemble,
    error::SmcError,
    memory::{MemoryGuardSettings, MemoryPressure},
    model::SmcModel,
    resample::{Resampler, ResamplingScheme},
    sampler::{CancelToken, ChainSettings},
    sweep::{Sample, SmcSweep},
    trajectory::Trajectory,
};

/// A functional evaluated on every accepted sample. It may borrow data that
/// lives for `'a`.
pub type Expectation<'a> = dyn Fn(&Ensemble) -> f64 + Send + Sync + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    /// Particle independent Metropolis-Hastings.
    Pimh,
    /// Alternating particle Gibbs and PIMH iterations.
    Apg,
}

/// Diagnostic information about a single chain iteration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Progress {
    pub chain: u64,
    pub iteration: usize,
    /// The iteration ran a conditional sweep.
    pub conditional: bool,
    pub accepted: bool,
    /// Log marginal likelihood of the current sample.
    pub log_z: f64,
    /// Samples are stored compressed from now on.
    pub compressed: bool,
}

/// Everything a chain stores, one entry per iteration.
#[derive(Debug, Clone, Default)]
pub struct ChainOutput {
    pub samples: Vec<Sample>,
    pub log_zs: Vec<f64>,
    pub accepted: Vec<bool>,
    /// Retained trajectory active after each iteration.
    pub retained: Vec<Trajectory>,
    /// Empty unless an expectation was given.
    pub expectations: Vec<f64>,
    /// Set once the memory guard switched to compressed samples.
    pub memory_pressure: Option<MemoryPressure>,
}

impl ChainOutput {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.accepted.is_empty() {
            return 0f64;
        }
        self.accepted.iter().filter(|&&a| a).count() as f64 / self.accepted.len() as f64
    }
}

/// A chain stopped by an error. The iterations before it are kept.
#[derive(Error, Debug)]
#[error("chain {chain} failed in iteration {iteration}")]
pub struct ChainFailure {
    pub chain: u64,
    pub iteration: usize,
    #[source]
    pub error: SmcError,
    pub partial: ChainOutput,
}

struct Current {
    sample: Sample,
    log_z: f64,
}

/// A PIMH or APG chain over a model.
pub struct PmcmcChain<'model, M: SmcModel, R: Rng, S: Resampler = ResamplingScheme> {
    model: &'model M,
    sweep: SmcSweep<S>,
    kind: ChainKind,
    rng: R,
    chain: u64,
    num_iterations: usize,
    memory: MemoryGuardSettings,
    expectation: Option<&'model Expectation<'model>>,
    cancel: Option<CancelToken>,
    compress: bool,
    current: Option<Current>,
    retained: Option<Trajectory>,
    output: ChainOutput,
}

impl<'model, M: SmcModel, R: Rng> PmcmcChain<'model, M, R, ResamplingScheme> {
    pub fn new(model: &'model M, settings: &ChainSettings, kind: ChainKind, rng: R, chain: u64) -> Self {
        Self {
            model,
            sweep: SmcSweep::new(settings.sweep),
            kind,
            rng,
            chain,
            num_iterations: settings.num_iterations,
            memory: settings.memory,
            expectation: None,
            cancel: None,
            compress: settings.sweep.compress,
            current: None,
            retained: None,
            output: ChainOutput {
                samples: Vec::with_capacity(settings.num_iterations),
                ..Default::default()
            },
        }
    }
}

impl<'model, M: SmcModel, R: Rng, S: Resampler> PmcmcChain<'model, M, R, S> {
    /// Resample with `resampler` instead of `settings.sweep.resampling`.
    pub fn with_resampler<T: Resampler>(self, resampler: T) -> PmcmcChain<'model, M, R, T> {
        PmcmcChain {
            model: self.model,
            sweep: self.sweep.with_resampler(resampler),
            kind: self.kind,
            rng: self.rng,
            chain: self.chain,
            num_iterations: self.num_iterations,
            memory: self.memory,
            expectation: self.expectation,
            cancel: self.cancel,
            compress: self.compress,
            current: self.current,
            retained: self.retained,
            output: self.output,
        }
    }

    /// Compressor used for compressed samples, both when requested in the
    /// settings and when the memory guard fires.
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.sweep = self.sweep.with_compressor(compressor);
        self
    }

    /// Start an APG chain with a conditional sweep on `retained`.
    pub fn with_retained(mut self, retained: Trajectory) -> Self {
        self.retained = Some(retained);
        self
    }

    pub fn with_expectation(mut self, expectation: &'model Expectation<'model>) -> Self {
        self.expectation = Some(expectation);
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.sweep = self.sweep.with_cancel_token(token.clone());
        self.cancel = Some(token);
        self
    }

    pub fn output(&self) -> &ChainOutput {
        &self.output
    }

    /// Run one iteration and store its sample.
    pub fn draw(&mut self) -> Result<Progress, SmcError> {
        if let Some(token) = &self.cancel {
            token.check()?;
        }
        let iteration = self.output.len();
        let conditional = match self.kind {
            ChainKind::Pimh => false,
            ChainKind::Apg => iteration % 2 == 0 && self.retained.is_some(),
        };
        let conditioning = if conditional {
            self.retained.as_ref()
        } else {
            None
        };

        let proposal = self
            .sweep
            .run_with(self.model, conditioning, self.compress, &mut self.rng)?;

        let accepted = match &self.current {
            Some(current) if !conditional => {
                let u: f64 = self.rng.random();
                u.ln() < proposal.log_z - current.log_z
            }
            _ => true,
        };
        debug!(
            "chain {} iteration {}: log Z {:.4}, accepted {}",
            self.chain, iteration, proposal.log_z, accepted
        );

        if accepted {
            self.current = Some(Current {
                sample: proposal.sample,
                log_z: proposal.log_z,
            });
            self.retained = Some(proposal.retained);
        }
        let Some(current) = &self.current else {
            return Err(SmcError::InvalidLineage("chain has no current sample".into()));
        };
        let Some(retained) = &self.retained else {
            return Err(SmcError::InvalidLineage("chain has no retained trajectory".into()));
        };

        if let Some(expectation) = self.expectation {
            self.output.expectations.push(expectation(current.sample.ensemble()));
        }
        self.output.samples.push(current.sample.clone());
        self.output.log_zs.push(current.log_z);
        self.output.accepted.push(accepted);
        self.output.retained.push(retained.clone());
        let log_z = current.log_z;
        let bytes = current.sample.approx_bytes();

        if iteration == 0 && !self.compress {
            if let Some(pressure) = self.memory.assess(bytes, self.num_iterations) {
                self.compress = true;
                self.output.memory_pressure = Some(pressure);
                // Rejected proposals repeat the current sample.
                if let Some(Current { sample, log_z }) = self.current.take() {
                    let sample = self.sweep.compress_sample(sample, self.model.num_steps())?;
                    self.current = Some(Current { sample, log_z });
                }
            }
        }

        Ok(Progress {
            chain: self.chain,
            iteration,
            conditional,
            accepted,
            log_z,
            compressed: self.compress,
        })
    }

    /// Run all iterations, calling `callback` after each of them.
    pub fn run(mut self, mut callback: impl FnMut(&Progress)) -> Result<ChainOutput, ChainFailure> {
        info!(
            "chain {}: starting {} {:?} iterations",
            self.chain, self.num_iterations, self.kind
        );
        while self.output.len() < self.num_iterations {
            match self.draw() {
                Ok(progress) => callback(&progress),
                Err(error) => {
                    let iteration = self.output.len();
                    info!("chain {}: stopped in iteration {}: {}", self.chain, iteration, error);
                    return Err(ChainFailure {
                        chain: self.chain,
                        iteration,
                        error,
                        partial: self.output,
                    });
                }
            }
        }
        info!(
            "chain {}: finished, acceptance rate {:.3}",
            self.chain,
            self.output.acceptance_rate()
        );
        Ok(self.output)
    }
}

/// Particle independent Metropolis-Hastings.
pub fn pimh<M: SmcModel, R: Rng + ?Sized>(
    model: &M,
    settings: &ChainSettings,
    rng: &mut R,
) -> Result<ChainOutput, ChainFailure> {
    PmcmcChain::new(model, settings, ChainKind::Pimh, rng, 0).run(|_| {})
}

/// Alternating particle Gibbs / PIMH.
///
/// Without `initial_retained` the first iteration is an unconditional sweep.
pub fn apg<'a, M: SmcModel, R: Rng + ?Sized>(
    model: &'a M,
    settings: &ChainSettings,
    initial_retained: Option<Trajectory>,
    expectation: Option<&'a Expectation<'a>>,
    rng: &mut R,
) -> Result<ChainOutput, ChainFailure> {
    let mut chain = PmcmcChain::new(model, settings, ChainKind::Apg, rng, 0);
    if let Some(retained) = initial_retained {
        chain = chain.with_retained(retained);
    }
    if let Some(expectation) = expectation {
        chain = chain.with_expectation(expectation);
    }
    chain.run(|_| {})
}
