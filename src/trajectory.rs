//! Retained trajectories and the per-sweep bookkeeping that produces them.
//!
//! A trajectory stores its values only as of the final step. For every step
//! it also keeps the width each variable had at that point, so the state at
//! any earlier step is a truncation of the final values.

use std::collections::BTreeMap;

use crate::{
    ensemble::{Ensemble, StepWidth},
    error::{Result, SmcError},
};

/// Variable widths of a single trajectory after one step.
pub type StepLayout = BTreeMap<String, usize>;

/// A single particle path selected at the end of a sweep.
#[derive(Debug, Clone)]
pub struct Trajectory {
    particle: Ensemble,
    lineage: Vec<StepLayout>,
    log_weights: Vec<f64>,
}

impl Trajectory {
    pub(crate) fn new(particle: Ensemble, lineage: Vec<StepLayout>, log_weights: Vec<f64>) -> Self {
        Self {
            particle,
            lineage,
            log_weights,
        }
    }

    /// Final values as a one-row ensemble without weights.
    pub fn particle(&self) -> &Ensemble {
        &self.particle
    }

    pub fn num_steps(&self) -> usize {
        self.lineage.len()
    }

    /// Variables and their widths after each step.
    pub fn lineage(&self) -> &[StepLayout] {
        &self.lineage
    }

    /// The log weight this path received at each step.
    pub fn step_log_weights(&self) -> &[f64] {
        &self.log_weights
    }

    /// The trajectory as it was right after `step`.
    pub fn state_at(&self, step: usize) -> Result<Ensemble> {
        let layout = self.lineage.get(step).ok_or_else(|| {
            SmcError::InvalidLineage(format!(
                "no layout for step {}, trajectory has {} steps",
                step,
                self.lineage.len()
            ))
        })?;

        let mut state = Ensemble::new(1);
        state.set_constants_map(self.particle.constants_map().clone());
        for (name, &width) in layout {
            let values = self.particle.get(name).ok_or_else(|| {
                SmcError::InvalidLineage(format!(
                    "variable `{}` of step {} is missing from the final values",
                    name, step
                ))
            })?;
            let truncated = values.truncated_row(0, width).ok_or_else(|| {
                SmcError::InvalidLineage(format!(
                    "variable `{}` has fewer than the {} values recorded at step {}",
                    name, width, step
                ))
            })?;
            state.insert(name.clone(), truncated)?;
        }
        Ok(state)
    }
}

/// Ancestry and widths recorded during one sweep.
///
/// Particles are addressed by slot. In a conditional sweep slot 0 is the
/// retained particle and free particle `i` sits in slot `i + 1`; in an
/// unconditional sweep slot `i` is particle `i`.
#[derive(Debug)]
pub(crate) struct Genealogy {
    offset: usize,
    widths: Vec<BTreeMap<String, StepWidth>>,
    ancestors: Vec<Vec<usize>>,
    log_weights: Vec<Vec<f64>>,
}

impl Genealogy {
    pub(crate) fn new(conditional: bool, num_steps: usize) -> Self {
        Self {
            offset: usize::from(conditional),
            widths: Vec::with_capacity(num_steps),
            ancestors: Vec::with_capacity(num_steps.saturating_sub(1)),
            log_weights: Vec::with_capacity(num_steps),
        }
    }

    /// Widths of the simulated particles and the slot weights of a step.
    pub(crate) fn record_step(&mut self, widths: BTreeMap<String, StepWidth>, log_weights: Vec<f64>) {
        self.widths.push(widths);
        self.log_weights.push(log_weights);
    }

    /// Ancestor slots of the simulated particles of the next step.
    pub(crate) fn record_resampling(&mut self, ancestors: Vec<usize>) {
        self.ancestors.push(ancestors);
    }

    /// Slot weights of the last recorded step.
    pub(crate) fn last_log_weights(&self) -> Option<&[f64]> {
        self.log_weights.last().map(Vec::as_slice)
    }

    fn slots(&self, final_slot: usize) -> Vec<usize> {
        let steps = self.log_weights.len();
        let mut slots = vec![0; steps];
        let mut slot = final_slot;
        for step in (0..steps).rev() {
            slots[step] = slot;
            if step > 0 && !(self.offset == 1 && slot == 0) {
                slot = self.ancestors[step - 1][slot - self.offset];
            }
        }
        slots
    }

    /// Follow the path ending in `final_slot` of `ensemble` back to the first
    /// step and package it as a trajectory.
    pub(crate) fn trajectory(
        &self,
        ensemble: &Ensemble,
        final_slot: usize,
        retained: Option<&Trajectory>,
    ) -> Result<Trajectory> {
        let slots = self.slots(final_slot);

        let lineage = slots
            .iter()
            .enumerate()
            .map(|(step, &slot)| {
                if self.offset == 1 && slot == 0 {
                    let retained = retained.ok_or_else(|| {
                        SmcError::InvalidLineage("conditional sweep without retained path".into())
                    })?;
                    return Ok(retained.lineage[step].clone());
                }
                Ok(self.widths[step]
                    .iter()
                    .filter_map(|(name, width)| {
                        width
                            .for_row(slot - self.offset)
                            .map(|w| (name.clone(), w))
                    })
                    .collect())
            })
            .collect::<Result<Vec<StepLayout>>>()?;

        let log_weights = slots
            .iter()
            .enumerate()
            .map(|(step, &slot)| self.log_weights[step][slot])
            .collect();

        let mut particle = ensemble.select(&[final_slot]);
        particle.clear_weights();
        Ok(Trajectory::new(particle, lineage, log_weights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::Values;
    use pretty_assertions::assert_eq;

    fn layout(entries: &[(&str, usize)]) -> StepLayout {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn state_at_truncates_final_values() {
        let mut particle = Ensemble::new(1);
        particle
            .insert("x", Values::fixed(1, 3, &[1., 2., 3.]).unwrap())
            .unwrap();
        particle
            .insert("events", Values::ragged(vec![vec![9., 8.]]))
            .unwrap();
        particle.set_constant("dt", vec![0.1]).unwrap();
        let lineage = vec![
            layout(&[("x", 1)]),
            layout(&[("x", 2), ("events", 0)]),
            layout(&[("x", 3), ("events", 2)]),
        ];
        let trajectory = Trajectory::new(particle, lineage, vec![0.; 3]);

        let first = trajectory.state_at(0).unwrap();
        assert_eq!(first.get("x").unwrap().row(0), Some(vec![1.]));
        assert!(!first.contains("events"));
        assert_eq!(first.constant("dt"), Some(&[0.1][..]));

        let second = trajectory.state_at(1).unwrap();
        assert_eq!(second.get("x").unwrap().row(0), Some(vec![1., 2.]));
        assert_eq!(second.get("events").unwrap().row(0), Some(vec![]));

        assert!(matches!(
            trajectory.state_at(3),
            Err(SmcError::InvalidLineage(_))
        ));
    }

    #[test]
    fn truncation_past_the_end_fails() {
        let mut particle = Ensemble::new(1);
        particle.insert("x", Values::column(&[1.])).unwrap();
        let trajectory = Trajectory::new(particle, vec![layout(&[("x", 2)])], vec![0.]);
        assert!(matches!(
            trajectory.state_at(0),
            Err(SmcError::InvalidLineage(_))
        ));
    }

    #[test]
    fn follows_ancestors_back() {
        let mut genealogy = Genealogy::new(false, 3);
        let mut ensemble = Ensemble::new(2);
        ensemble.push_column("x", &[0., 1.]).unwrap();
        let widths = ensemble.step_widths();

        genealogy.record_step(widths.clone(), vec![-1., -2.]);
        genealogy.record_resampling(vec![1, 1]);
        genealogy.record_step(widths.clone(), vec![-3., -4.]);
        genealogy.record_resampling(vec![1, 0]);
        genealogy.record_step(widths, vec![-5., -6.]);

        let trajectory = genealogy.trajectory(&ensemble, 0, None).unwrap();
        // Slot 0 at the end descends from slot 1 at step 1, which descends
        // from slot 1 at step 0.
        assert_eq!(trajectory.step_log_weights(), &[-2., -4., -5.]);
        assert_eq!(trajectory.num_steps(), 3);
        assert_eq!(trajectory.particle().len(), 1);
    }

    #[test]
    fn conditional_slot_zero_uses_retained_lineage() {
        let mut particle = Ensemble::new(1);
        particle.insert("x", Values::column(&[5.])).unwrap();
        let retained = Trajectory::new(particle, vec![layout(&[("x", 1)])], vec![-1.]);

        let mut genealogy = Genealogy::new(true, 1);
        let mut free = Ensemble::new(1);
        free.push_column("x", &[7.]).unwrap();
        free.push_column("x", &[8.]).unwrap();
        genealogy.record_step(free.step_widths(), vec![-1., -0.5]);

        let mut merged = Ensemble::new(2);
        merged
            .insert("x", Values::Ragged(vec![Some(vec![5.]), Some(vec![7., 8.])]))
            .unwrap();

        let from_retained = genealogy.trajectory(&merged, 0, Some(&retained)).unwrap();
        assert_eq!(from_retained.lineage(), &[layout(&[("x", 1)])]);
        let from_free = genealogy.trajectory(&merged, 1, Some(&retained)).unwrap();
        assert_eq!(from_free.lineage(), &[layout(&[("x", 2)])]);
        assert_eq!(from_free.step_log_weights(), &[-0.5]);
    }
}
