//! A rough check whether storing every sample of a chain would exhaust memory.
//!
//! This is best effort. Sample sizes are estimated from the heap footprint of
//! the first sample and the available memory is read from the platform when
//! possible.

use log::warn;

const GIB: usize = 1 << 30;

#[derive(Debug, Clone, Copy)]
pub struct MemoryGuardSettings {
    pub enabled: bool,
    /// Projections below this many bytes never trigger the guard.
    pub absolute_threshold_bytes: usize,
    /// Share of the available memory the samples may use.
    pub available_fraction: f64,
    /// Assumed available memory if the platform can not be queried.
    pub fallback_available_bytes: usize,
    /// Fixed available memory, skipping the platform query.
    pub available_bytes: Option<usize>,
}

impl Default for MemoryGuardSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            absolute_threshold_bytes: GIB,
            available_fraction: 0.5,
            fallback_available_bytes: 4 * GIB,
            available_bytes: None,
        }
    }
}

/// Reported when the guard switched a chain to compressed storage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryPressure {
    pub projected_bytes: usize,
    pub available_bytes: usize,
    pub threshold_bytes: usize,
}

impl MemoryGuardSettings {
    /// Decide from the size of one sample whether `num_iterations` samples
    /// would use too much memory.
    pub fn assess(&self, sample_bytes: usize, num_iterations: usize) -> Option<MemoryPressure> {
        if !self.enabled {
            return None;
        }
        let projected_bytes = sample_bytes.saturating_mul(num_iterations);
        let available_bytes = self.available();
        let budget = (available_bytes as f64 * self.available_fraction) as usize;
        if projected_bytes > self.absolute_threshold_bytes && projected_bytes > budget {
            let pressure = MemoryPressure {
                projected_bytes,
                available_bytes,
                threshold_bytes: self.absolute_threshold_bytes.max(budget),
            };
            warn!(
                "{} samples would need about {} bytes with {} bytes available; storing compressed samples",
                num_iterations, projected_bytes, available_bytes
            );
            return Some(pressure);
        }
        None
    }

    fn available(&self) -> usize {
        self.available_bytes
            .or_else(available_memory)
            .unwrap_or(self.fallback_available_bytes)
    }
}

#[cfg(target_os = "linux")]
fn available_memory() -> Option<usize> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

#[cfg(not(target_os = "linux"))]
fn available_memory() -> Option<usize> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(meminfo: &str) -> Option<usize> {
    let line = meminfo.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let kib: usize = line
        .trim_start_matches("MemAvailable:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    kib.checked_mul(1024)
}
