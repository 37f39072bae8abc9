#![allow(dead_code)]

use std::{
    f64::consts::PI,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use anyhow::{anyhow, bail, Result};
use pmcmc_rs::{Compressor, Ensemble, MergeDuplicates, SmcModel, SteppedModel, Values};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

pub fn normal_logpdf(x: f64, mean: f64, var: f64) -> f64 {
    -0.5 * (2. * PI * var).ln() - (x - mean) * (x - mean) / (2. * var)
}

/// `x_t ~ N(0, 1)` independently, observed as `y_t ~ N(x_t, 1)`.
///
/// The marginal likelihood is `prod_t N(y_t; 0, 2)`.
pub struct GaussianModel {
    pub observations: Vec<f64>,
}

impl GaussianModel {
    pub fn new(observations: &[f64]) -> Self {
        Self {
            observations: observations.to_vec(),
        }
    }

    pub fn log_evidence(&self) -> f64 {
        self.observations
            .iter()
            .map(|&y| normal_logpdf(y, 0., 2.))
            .sum()
    }
}

impl SmcModel for GaussianModel {
    fn num_steps(&self) -> usize {
        self.observations.len()
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        _step: usize,
        particles: &mut Ensemble,
        _particle_count: usize,
        rng: &mut R,
    ) -> Result<()> {
        let mut draws = Vec::with_capacity(particles.len());
        for _ in 0..particles.len() {
            let z: f64 = StandardNormal.sample(rng);
            draws.push(z);
        }
        particles.push_column("x", &draws)?;
        Ok(())
    }

    fn log_weight(&self, step: usize, particles: &Ensemble, _particle_count: usize) -> Result<Vec<f64>> {
        let x = particles.get("x").ok_or_else(|| anyhow!("no state"))?;
        (0..particles.len())
            .map(|i| {
                let last = x.last(i).ok_or_else(|| anyhow!("empty state in row {}", i))?;
                Ok(normal_logpdf(self.observations[step], last, 1.))
            })
            .collect()
    }
}

/// Records the number of rows of every call it forwards.
pub struct RecordingModel {
    pub inner: GaussianModel,
    pub calls: Mutex<Vec<Call>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    pub weighting: bool,
    pub step: usize,
    pub rows: usize,
    pub particle_count: usize,
}

impl RecordingModel {
    pub fn new(observations: &[f64]) -> Self {
        Self {
            inner: GaussianModel::new(observations),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    fn record(&self, weighting: bool, step: usize, rows: usize, particle_count: usize) {
        self.calls.lock().unwrap().push(Call {
            weighting,
            step,
            rows,
            particle_count,
        });
    }
}

impl SmcModel for RecordingModel {
    fn num_steps(&self) -> usize {
        self.inner.num_steps()
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        step: usize,
        particles: &mut Ensemble,
        particle_count: usize,
        rng: &mut R,
    ) -> Result<()> {
        self.record(false, step, particles.len(), particle_count);
        self.inner.sample(step, particles, particle_count, rng)
    }

    fn log_weight(&self, step: usize, particles: &Ensemble, particle_count: usize) -> Result<Vec<f64>> {
        self.record(true, step, particles.len(), particle_count);
        self.inner.log_weight(step, particles, particle_count)
    }
}

/// Every particle gets the same value and weight, so every sweep returns the
/// same marginal likelihood.
pub fn constant_model(num_steps: usize) -> SteppedModel {
    (0..num_steps).fold(SteppedModel::new(), |model, step| {
        model.step(
            move |particles, _, _| {
                let column = vec![step as f64; particles.len()];
                particles.push_column("x", &column)?;
                Ok(())
            },
            |particles, _| Ok(vec![-0.25; particles.len()]),
        )
    })
}

/// Appends a random number of events per particle and step; each event
/// costs a constant amount of log weight.
pub fn ragged_model(num_steps: usize) -> SteppedModel {
    (0..num_steps).fold(SteppedModel::new(), |model, _| {
        model.step(
            |particles, _, rng| {
                let len = particles.len();
                let mut rows = match particles.remove("events") {
                    Some(Values::Ragged(rows)) => rows,
                    Some(Values::Fixed(_)) => bail!("events must be ragged"),
                    None => vec![Some(Vec::new()); len],
                };
                for row in rows.iter_mut().flatten() {
                    let count = rng.random_range(0..3);
                    for _ in 0..count {
                        row.push(rng.random::<f64>());
                    }
                }
                particles.insert("events", Values::Ragged(rows))?;
                Ok(())
            },
            |particles, _| {
                let events = particles
                    .get("events")
                    .ok_or_else(|| anyhow!("no events"))?;
                Ok((0..particles.len())
                    .map(|i| {
                        let row = events.row(i).unwrap_or_default();
                        -0.3 * row.len() as f64 + row.iter().sum::<f64>() * 0.1
                    })
                    .collect())
            },
        )
    })
}

/// Fails at the first step of the sweep with the given (0-based) number.
pub struct FailingModel {
    pub inner: GaussianModel,
    pub fail_on_sweep: usize,
    pub sweeps: AtomicUsize,
}

impl FailingModel {
    pub fn new(observations: &[f64], fail_on_sweep: usize) -> Self {
        Self {
            inner: GaussianModel::new(observations),
            fail_on_sweep,
            sweeps: AtomicUsize::new(0),
        }
    }
}

impl SmcModel for FailingModel {
    fn num_steps(&self) -> usize {
        self.inner.num_steps()
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        step: usize,
        particles: &mut Ensemble,
        particle_count: usize,
        rng: &mut R,
    ) -> Result<()> {
        if step == 0 && self.sweeps.fetch_add(1, Ordering::SeqCst) == self.fail_on_sweep {
            bail!("simulator crashed");
        }
        self.inner.sample(step, particles, particle_count, rng)
    }

    fn log_weight(&self, step: usize, particles: &Ensemble, particle_count: usize) -> Result<Vec<f64>> {
        self.inner.log_weight(step, particles, particle_count)
    }
}

/// Merges duplicate rows and counts how often it was asked to.
#[derive(Debug, Default)]
pub struct CountingCompressor {
    calls: AtomicUsize,
}

impl CountingCompressor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Compressor for CountingCompressor {
    fn compress(&self, ensemble: Ensemble, num_steps: usize) -> Result<Ensemble> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        MergeDuplicates.compress(ensemble, num_steps)
    }
}
