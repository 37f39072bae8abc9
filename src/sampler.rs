use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use itertools::Itertools;
use log::info;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{prelude::*, ThreadPoolBuilder};

use crate::{
    chain::{ChainFailure, ChainKind, ChainOutput, PmcmcChain, Progress},
    compress::{Compressor, MergeDuplicates},
    error::SmcError,
    memory::MemoryGuardSettings,
    model::SmcModel,
    resample::Resampler,
    sweep::SweepSettings,
};

/// Settings for PIMH and APG chains
#[derive(Debug, Clone, Copy)]
pub struct ChainSettings {
    pub sweep: SweepSettings,
    /// Number of stored samples per chain.
    pub num_iterations: usize,
    pub memory: MemoryGuardSettings,
    pub seed: u64,
    pub num_chains: usize,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            sweep: SweepSettings::default(),
            num_iterations: 1000,
            memory: MemoryGuardSettings::default(),
            seed: 0,
            num_chains: 4,
        }
    }
}

/// Shared flag to stop running sweeps and chains.
///
/// Checked between sweep steps and between chain iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<(), SmcError> {
        if self.is_cancelled() {
            return Err(SmcError::Cancelled);
        }
        Ok(())
    }
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct ChainProgress {
    pub finished_iterations: usize,
    pub total_iterations: usize,
    pub accepted: usize,
    pub started: bool,
    pub compressed: bool,
    pub latest_log_z: f64,
    pub runtime: Duration,
}

impl ChainProgress {
    fn new(total: usize) -> Self {
        Self {
            finished_iterations: 0,
            total_iterations: total,
            accepted: 0,
            started: false,
            compressed: false,
            latest_log_z: f64::NAN,
            runtime: Duration::ZERO,
        }
    }

    fn update(&mut self, progress: &Progress, duration: Duration) {
        self.started = true;
        self.finished_iterations += 1;
        if progress.accepted {
            self.accepted += 1;
        }
        self.compressed = progress.compressed;
        self.latest_log_z = progress.log_z;
        self.runtime += duration;
    }
}

pub struct ProgressCallback {
    pub callback: Box<dyn FnMut(Duration, Box<[ChainProgress]>) + Send>,
    pub rate: Duration,
}

struct Reporter {
    callback: Option<ProgressCallback>,
    chains: Vec<ChainProgress>,
    start: Instant,
    last_report: Instant,
}

impl Reporter {
    fn update(&mut self, chain: usize, progress: &Progress, duration: Duration) {
        self.chains[chain].update(progress, duration);
        let now = Instant::now();
        if let Some(ProgressCallback { callback, rate }) = &mut self.callback {
            if now.duration_since(self.last_report) >= *rate {
                self.last_report = now;
                callback(self.start.elapsed(), self.chains.clone().into_boxed_slice());
            }
        }
    }

    fn finish(&mut self) {
        if let Some(ProgressCallback { callback, .. }) = &mut self.callback {
            callback(self.start.elapsed(), self.chains.clone().into_boxed_slice());
        }
    }
}

/// Run `settings.num_chains` independent chains in parallel.
///
/// Chain `i` draws from a ChaCha8 generator seeded with `settings.seed` on
/// stream `i`, so the results do not depend on scheduling. A failing chain
/// does not stop the others.
pub fn sample_parallel<M: SmcModel>(
    model: &M,
    settings: &ChainSettings,
    kind: ChainKind,
    callback: Option<ProgressCallback>,
    cancel: Option<CancelToken>,
) -> Result<Vec<Result<ChainOutput, ChainFailure>>> {
    sample_parallel_with(
        model,
        settings,
        kind,
        settings.sweep.resampling,
        Arc::new(MergeDuplicates),
        callback,
        cancel,
    )
}

/// Like [`sample_parallel`], with every chain using `resampler` and
/// `compressor`.
pub fn sample_parallel_with<M: SmcModel, S: Resampler + Clone + Send + Sync>(
    model: &M,
    settings: &ChainSettings,
    kind: ChainKind,
    resampler: S,
    compressor: Arc<dyn Compressor>,
    callback: Option<ProgressCallback>,
    cancel: Option<CancelToken>,
) -> Result<Vec<Result<ChainOutput, ChainFailure>>> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(settings.num_chains.max(1))
        .thread_name(|i| format!("pmcmc-worker-{}", i))
        .build()
        .context("Could not start thread pool")?;

    let now = Instant::now();
    let reporter = Mutex::new(Reporter {
        callback,
        chains: vec![ChainProgress::new(settings.num_iterations); settings.num_chains],
        start: now,
        last_report: now,
    });

    info!(
        "sampling {} {:?} chains with {} particles",
        settings.num_chains, kind, settings.sweep.num_particles
    );
    let results = pool.install(|| {
        (0..settings.num_chains)
            .into_par_iter()
            .map(|chain_id| {
                let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
                rng.set_stream(chain_id as u64);

                let mut chain = PmcmcChain::new(model, settings, kind, rng, chain_id as u64)
                    .with_resampler(resampler.clone())
                    .with_compressor(compressor.clone());
                if let Some(token) = &cancel {
                    chain = chain.with_cancel_token(token.clone());
                }
                let mut last = Instant::now();
                chain.run(|progress| {
                    let now = Instant::now();
                    reporter
                        .lock()
                        .expect("Poisoned lock")
                        .update(chain_id, progress, now - last);
                    last = now;
                })
            })
            .collect::<Vec<_>>()
    });

    let failed = results
        .iter()
        .filter_map(|result| result.as_ref().err().map(|failure| failure.chain))
        .collect_vec();
    if failed.is_empty() {
        info!("all {} chains finished", settings.num_chains);
    } else {
        info!("chains {:?} stopped early", failed);
    }

    reporter.lock().expect("Poisoned lock").finish();
    Ok(results)
}
