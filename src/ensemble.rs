//! Particle ensembles: a batch of rows with named, per-row variables.
//!
//! A variable is stored either as a fixed-width block (every row has the same
//! number of values) or as a ragged column, where each row owns a vector of
//! its own length or is explicitly absent.

use std::collections::BTreeMap;

use faer::Mat;
use rayon::prelude::*;

use crate::error::{Result, SmcError};

/// Per-row values of a single variable.
#[derive(Debug, Clone)]
pub enum Values {
    /// `nrows × width` block. Columns beyond a row's real width are NaN
    /// after a merge with a wider input.
    Fixed(Mat<f64>),
    /// One entry per row; `None` marks a row where the variable does not exist.
    Ragged(Vec<Option<Vec<f64>>>),
}

/// Width of a variable across the rows of an ensemble at one sweep step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepWidth {
    Shared(usize),
    PerRow(Vec<Option<usize>>),
}

impl StepWidth {
    /// The width of `row`, `None` if the variable is absent there.
    pub fn for_row(&self, row: usize) -> Option<usize> {
        match self {
            StepWidth::Shared(width) => Some(*width),
            StepWidth::PerRow(widths) => widths.get(row).copied().flatten(),
        }
    }
}

impl Values {
    /// Fixed-width values from row-major data.
    pub fn fixed(nrows: usize, width: usize, row_major: &[f64]) -> Result<Self> {
        if row_major.len() != nrows * width {
            return Err(SmcError::RowCountMismatch {
                context: format!("fixed block of width {}", width),
                expected: nrows * width,
                found: row_major.len(),
            });
        }
        Ok(Values::Fixed(Mat::from_fn(nrows, width, |i, j| {
            row_major[i * width + j]
        })))
    }

    /// One column, one value per row.
    pub fn column(values: &[f64]) -> Self {
        Values::Fixed(Mat::from_fn(values.len(), 1, |i, _| values[i]))
    }

    /// Ragged values where every row is present.
    pub fn ragged(rows: Vec<Vec<f64>>) -> Self {
        Values::Ragged(rows.into_iter().map(Some).collect())
    }

    pub fn nrows(&self) -> usize {
        match self {
            Values::Fixed(mat) => mat.nrows(),
            Values::Ragged(rows) => rows.len(),
        }
    }

    pub fn is_ragged(&self) -> bool {
        matches!(self, Values::Ragged(_))
    }

    /// Copy of the values of one row, `None` if the variable is absent there.
    pub fn row(&self, row: usize) -> Option<Vec<f64>> {
        match self {
            Values::Fixed(mat) => Some((0..mat.ncols()).map(|j| mat[(row, j)]).collect()),
            Values::Ragged(rows) => rows[row].clone(),
        }
    }

    /// The last value of one row, if the row is present and not empty.
    pub fn last(&self, row: usize) -> Option<f64> {
        match self {
            Values::Fixed(mat) => mat.ncols().checked_sub(1).map(|j| mat[(row, j)]),
            Values::Ragged(rows) => rows[row].as_ref().and_then(|v| v.last().copied()),
        }
    }

    pub fn step_width(&self) -> StepWidth {
        match self {
            Values::Fixed(mat) => StepWidth::Shared(mat.ncols()),
            Values::Ragged(rows) => {
                StepWidth::PerRow(rows.iter().map(|r| r.as_ref().map(Vec::len)).collect())
            }
        }
    }

    /// Gather rows; indices may repeat.
    pub fn select(&self, rows: &[usize]) -> Values {
        match self {
            Values::Fixed(mat) => {
                Values::Fixed(Mat::from_fn(rows.len(), mat.ncols(), |i, j| mat[(rows[i], j)]))
            }
            Values::Ragged(values) => {
                Values::Ragged(rows.iter().map(|&r| values[r].clone()).collect())
            }
        }
    }

    /// A single-row copy of `row` cut down to its first `width` values.
    pub(crate) fn truncated_row(&self, row: usize, width: usize) -> Option<Values> {
        match self {
            Values::Fixed(mat) => {
                if width > mat.ncols() {
                    return None;
                }
                Some(Values::Fixed(Mat::from_fn(1, width, |_, j| mat[(row, j)])))
            }
            Values::Ragged(rows) => {
                let values = rows[row].as_ref()?;
                if width > values.len() {
                    return None;
                }
                Some(Values::Ragged(vec![Some(values[..width].to_vec())]))
            }
        }
    }

    /// Append one value to every row.
    ///
    /// Absent rows of a ragged variable stay absent.
    pub fn push_column(&mut self, column: &[f64]) {
        match self {
            Values::Fixed(mat) => {
                let width = mat.ncols();
                let grown = Mat::from_fn(mat.nrows(), width + 1, |i, j| {
                    if j < width {
                        mat[(i, j)]
                    } else {
                        column[i]
                    }
                });
                *mat = grown;
            }
            Values::Ragged(rows) => rows
                .iter_mut()
                .zip(column)
                .for_each(|(row, &value)| {
                    if let Some(row) = row {
                        row.push(value)
                    }
                }),
        }
    }

    /// Approximate heap footprint in bytes.
    pub fn approx_bytes(&self) -> usize {
        let float = std::mem::size_of::<f64>();
        match self {
            Values::Fixed(mat) => mat.nrows() * mat.ncols() * float,
            Values::Ragged(rows) => rows
                .iter()
                .map(|r| {
                    std::mem::size_of::<Option<Vec<f64>>>()
                        + r.as_ref().map_or(0, |v| v.len() * float)
                })
                .sum(),
        }
    }
}

/// An ordered batch of weighted particles.
#[derive(Debug, Clone, Default)]
pub struct Ensemble {
    len: usize,
    variables: BTreeMap<String, Values>,
    constants: BTreeMap<String, Vec<f64>>,
    weights: Option<Vec<f64>>,
}

impl Ensemble {
    /// An ensemble of `len` rows without any variables.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, name: &str) -> Option<&Values> {
        self.variables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &Values)> {
        self.variables.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    /// Add or replace a variable. Its row count must match the ensemble.
    pub fn insert(&mut self, name: impl Into<String>, values: Values) -> Result<Option<Values>> {
        let name = name.into();
        if values.nrows() != self.len {
            return Err(SmcError::RowCountMismatch {
                context: format!("variable `{}`", name),
                expected: self.len,
                found: values.nrows(),
            });
        }
        if self.constants.contains_key(&name) {
            return Err(SmcError::InconsistentRepresentation {
                variable: name,
                reason: "already defined as a constant".into(),
            });
        }
        Ok(self.variables.insert(name, values))
    }

    pub fn remove(&mut self, name: &str) -> Option<Values> {
        self.variables.remove(name)
    }

    /// Append one value per row to `name`, creating a one-column fixed
    /// variable if it does not exist yet.
    ///
    /// This is how sequential models usually grow a state history.
    pub fn push_column(&mut self, name: &str, column: &[f64]) -> Result<()> {
        if column.len() != self.len {
            return Err(SmcError::RowCountMismatch {
                context: format!("new column of `{}`", name),
                expected: self.len,
                found: column.len(),
            });
        }
        match self.variables.get_mut(name) {
            Some(values) => values.push_column(column),
            None => {
                self.insert(name, Values::column(column))?;
            }
        }
        Ok(())
    }

    pub fn constant(&self, name: &str) -> Option<&[f64]> {
        self.constants.get(name).map(Vec::as_slice)
    }

    pub fn constants(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.constants.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn set_constant(&mut self, name: impl Into<String>, value: Vec<f64>) -> Result<()> {
        let name = name.into();
        if self.variables.contains_key(&name) {
            return Err(SmcError::InconsistentRepresentation {
                variable: name,
                reason: "already defined as a per-row variable".into(),
            });
        }
        self.constants.insert(name, value);
        Ok(())
    }

    pub(crate) fn constants_map(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.constants
    }

    pub(crate) fn set_constants_map(&mut self, constants: BTreeMap<String, Vec<f64>>) {
        self.constants = constants;
    }

    /// Relative weights, present once a sweep has finished.
    pub fn weights(&self) -> Option<&[f64]> {
        self.weights.as_deref()
    }

    pub fn set_weights(&mut self, weights: Vec<f64>) -> Result<()> {
        if weights.len() != self.len {
            return Err(SmcError::RowCountMismatch {
                context: "weights".into(),
                expected: self.len,
                found: weights.len(),
            });
        }
        let total: f64 = weights.iter().sum();
        if weights.iter().any(|w| *w < 0f64 || w.is_nan()) || !(total.is_finite() && total > 0f64) {
            return Err(SmcError::InvalidWeights(format!(
                "relative weights must be non-negative with a positive finite sum, got total {}",
                total
            )));
        }
        self.weights = Some(weights);
        Ok(())
    }

    pub fn clear_weights(&mut self) {
        self.weights = None;
    }

    /// Widths of all variables, as recorded in the lineage of a sweep step.
    pub fn step_widths(&self) -> BTreeMap<String, StepWidth> {
        self.variables
            .iter()
            .map(|(name, values)| (name.clone(), values.step_width()))
            .collect()
    }

    /// Gather rows, repeating or dropping them as `rows` says.
    ///
    /// Weights are carried over unnormalized; constants are shared.
    pub fn select(&self, rows: &[usize]) -> Ensemble {
        let variables = self
            .variables
            .par_iter()
            .map(|(name, values)| (name.clone(), values.select(rows)))
            .collect();
        Ensemble {
            len: rows.len(),
            variables,
            constants: self.constants.clone(),
            weights: self
                .weights
                .as_ref()
                .map(|w| rows.iter().map(|&r| w[r]).collect()),
        }
    }

    /// Approximate heap footprint in bytes.
    pub fn approx_bytes(&self) -> usize {
        let float = std::mem::size_of::<f64>();
        let variables: usize = self
            .variables
            .iter()
            .map(|(name, values)| name.len() + values.approx_bytes())
            .sum();
        let constants: usize = self
            .constants
            .iter()
            .map(|(name, value)| name.len() + value.len() * float)
            .sum();
        variables + constants + self.weights.as_ref().map_or(0, |w| w.len() * float)
    }

    pub(crate) fn from_parts(
        len: usize,
        variables: BTreeMap<String, Values>,
        constants: BTreeMap<String, Vec<f64>>,
        weights: Option<Vec<f64>>,
    ) -> Self {
        Self {
            len,
            variables,
            constants,
            weights,
        }
    }
}
