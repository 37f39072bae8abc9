//! The interface between the sweep engine and a sequential model.
//!
//! A model is an ordered list of steps. Each step extends every particle
//! (sampling) and then scores it (weighting). The engine never looks inside
//! the variables the model writes, apart from recording their widths.

use anyhow::Result;
use rand::{Rng, RngCore};

use crate::ensemble::Ensemble;

/// A sequential model that can be run by the sweep engine.
///
/// `particle_count` is the total number of particles of the running sweep.
/// In a conditional sweep the ensemble handed to the model may contain fewer
/// rows than that (the free particles, or the single retained particle).
pub trait SmcModel: Send + Sync {
    /// Number of sampling/weighting steps.
    fn num_steps(&self) -> usize;

    /// Extend every row of `particles` by step `step`.
    ///
    /// Must not change the number of rows. Variables are expected to only grow
    /// across steps; a retained trajectory is reconstructed at earlier steps by
    /// truncating its final values.
    fn sample<R: Rng + ?Sized>(
        &self,
        step: usize,
        particles: &mut Ensemble,
        particle_count: usize,
        rng: &mut R,
    ) -> Result<()>;

    /// Log weight of every row after step `step`.
    ///
    /// Negative infinity marks a row with zero probability.
    fn log_weight(&self, step: usize, particles: &Ensemble, particle_count: usize)
        -> Result<Vec<f64>>;
}

pub type SampleFn =
    Box<dyn Fn(&mut Ensemble, usize, &mut dyn RngCore) -> Result<()> + Send + Sync>;
pub type WeightFn = Box<dyn Fn(&Ensemble, usize) -> Result<Vec<f64>> + Send + Sync>;

/// A model assembled from one sampling and one weighting closure per step.
#[derive(Default)]
pub struct SteppedModel {
    steps: Vec<(SampleFn, WeightFn)>,
}

impl SteppedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn step<S, W>(mut self, sample: S, weight: W) -> Self
    where
        S: Fn(&mut Ensemble, usize, &mut dyn RngCore) -> Result<()> + Send + Sync + 'static,
        W: Fn(&Ensemble, usize) -> Result<Vec<f64>> + Send + Sync + 'static,
    {
        self.steps.push((Box::new(sample), Box::new(weight)));
        self
    }
}

impl std::fmt::Debug for SteppedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SteppedModel")
            .field("num_steps", &self.steps.len())
            .finish()
    }
}

impl SmcModel for SteppedModel {
    fn num_steps(&self) -> usize {
        self.steps.len()
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        step: usize,
        particles: &mut Ensemble,
        particle_count: usize,
        mut rng: &mut R,
    ) -> Result<()> {
        (self.steps[step].0)(particles, particle_count, &mut rng)
    }

    fn log_weight(
        &self,
        step: usize,
        particles: &Ensemble,
        particle_count: usize,
    ) -> Result<Vec<f64>> {
        (self.steps[step].1)(particles, particle_count)
    }
}
