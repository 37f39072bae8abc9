use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::ensemble::{Ensemble, Values};

/// Turns a full weighted ensemble into a smaller one that represents the same
/// weighted distribution.
pub trait Compressor: Send + Sync {
    fn compress(&self, ensemble: Ensemble, num_steps: usize) -> Result<Ensemble>;
}

/// Collapses rows whose values are bit-identical and adds up their weights.
///
/// After resampling most rows are copies of a few ancestors, so this usually
/// shrinks the ensemble a lot without changing any weighted expectation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeDuplicates;

const ABSENT: u64 = u64::MAX;

fn row_key(ensemble: &Ensemble, row: usize) -> Vec<u64> {
    let mut key = Vec::new();
    for (_, values) in ensemble.variables() {
        match values {
            Values::Fixed(mat) => {
                key.extend((0..mat.ncols()).map(|j| mat[(row, j)].to_bits()));
            }
            Values::Ragged(rows) => match &rows[row] {
                Some(entries) => {
                    key.push(entries.len() as u64);
                    key.extend(entries.iter().map(|v| v.to_bits()));
                }
                None => key.push(ABSENT),
            },
        }
    }
    key
}

impl Compressor for MergeDuplicates {
    fn compress(&self, ensemble: Ensemble, _num_steps: usize) -> Result<Ensemble> {
        let len = ensemble.len();
        if len == 0 {
            return Ok(ensemble);
        }
        let weights = match ensemble.weights() {
            Some(weights) => weights.to_vec(),
            None => vec![1f64; len],
        };
        if weights.len() != len {
            bail!("{} weights for {} rows", weights.len(), len);
        }

        let mut groups: HashMap<Vec<u64>, usize> = HashMap::with_capacity(len);
        let mut keep = Vec::new();
        let mut merged: Vec<f64> = Vec::new();
        for (row, weight) in weights.into_iter().enumerate() {
            let group = *groups.entry(row_key(&ensemble, row)).or_insert_with(|| {
                keep.push(row);
                merged.push(0f64);
                keep.len() - 1
            });
            merged[group] += weight;
        }

        let mut compressed = ensemble.select(&keep);
        compressed.set_weights(merged)?;
        Ok(compressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn merges_identical_rows() {
        let mut ensemble = Ensemble::new(4);
        ensemble.push_column("x", &[1., 2., 1., 1.]).unwrap();
        ensemble
            .insert(
                "tail",
                Values::Ragged(vec![Some(vec![0.]), None, Some(vec![0.]), None]),
            )
            .unwrap();
        ensemble.set_weights(vec![1., 2., 3., 4.]).unwrap();

        let compressed = MergeDuplicates.compress(ensemble, 1).unwrap();
        assert_eq!(compressed.len(), 3);
        assert_eq!(compressed.weights(), Some(&[4., 2., 4.][..]));
        assert_eq!(compressed.get("x").unwrap().row(2), Some(vec![1.]));
        assert_eq!(compressed.get("tail").unwrap().row(2), None);
    }

    #[test]
    fn unweighted_rows_count_once_each() {
        let mut ensemble = Ensemble::new(3);
        ensemble.push_column("x", &[5., 5., 5.]).unwrap();
        let compressed = MergeDuplicates.compress(ensemble, 1).unwrap();
        assert_eq!(compressed.len(), 1);
        assert_eq!(compressed.weights(), Some(&[3.][..]));
    }
}
