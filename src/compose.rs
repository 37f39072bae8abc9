//! Merging two ensembles into one under an explicit row assignment.

use std::collections::{BTreeMap, BTreeSet};

use faer::Mat;
use rayon::prelude::*;

use crate::{
    ensemble::{Ensemble, Values},
    error::{Result, SmcError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Base(usize),
    First(usize),
    Second(usize),
}

/// Where every output row of a merge comes from.
///
/// The rows contributed by the first input (after optional reordering or
/// replication) are followed by the rows of the second input; `output_indices`
/// gives the destination of each of them. Without a base ensemble the
/// destinations must be a permutation of `0..count`. With a base ensemble the
/// output has the base's length, and rows that receive no source keep the
/// base's values.
#[derive(Debug, Clone)]
pub struct RowAssignment {
    sources: Vec<Source>,
    first_len: usize,
    second_len: usize,
    base_len: Option<usize>,
}

fn source_rows(reorder: Option<&[usize]>, len: usize, which: &str) -> Result<Vec<usize>> {
    match reorder {
        None => Ok((0..len).collect()),
        Some(rows) => {
            if let Some(&bad) = rows.iter().find(|&&r| r >= len) {
                return Err(SmcError::IncompleteAssignment(format!(
                    "{} input has {} rows but reorder refers to row {}",
                    which, len, bad
                )));
            }
            Ok(rows.to_vec())
        }
    }
}

fn check_len(what: &str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(SmcError::RowCountMismatch {
            context: what.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

impl RowAssignment {
    pub fn new(
        output_indices: &[usize],
        first_len: usize,
        second_len: usize,
        reorder_first: Option<&[usize]>,
        reorder_second: Option<&[usize]>,
        base_len: Option<usize>,
    ) -> Result<Self> {
        let first_rows = source_rows(reorder_first, first_len, "first")?;
        let second_rows = source_rows(reorder_second, second_len, "second")?;
        let count = first_rows.len() + second_rows.len();
        if output_indices.len() != count {
            return Err(SmcError::IncompleteAssignment(format!(
                "{} output indices for {} source rows",
                output_indices.len(),
                count
            )));
        }

        let out_len = base_len.unwrap_or(count);
        let mut sources: Vec<Option<Source>> = match base_len {
            Some(len) => (0..len).map(|i| Some(Source::Base(i))).collect(),
            None => vec![None; out_len],
        };
        let mut assigned = vec![false; out_len];
        let incoming = first_rows
            .iter()
            .map(|&r| Source::First(r))
            .chain(second_rows.iter().map(|&r| Source::Second(r)));
        for (&dest, source) in output_indices.iter().zip(incoming) {
            if dest >= out_len {
                return Err(SmcError::IncompleteAssignment(format!(
                    "destination row {} is outside of {} output rows",
                    dest, out_len
                )));
            }
            if assigned[dest] {
                return Err(SmcError::IncompleteAssignment(format!(
                    "destination row {} is assigned twice",
                    dest
                )));
            }
            assigned[dest] = true;
            sources[dest] = Some(source);
        }

        let sources = sources
            .into_iter()
            .enumerate()
            .map(|(i, source)| {
                source.ok_or_else(|| {
                    SmcError::IncompleteAssignment(format!("destination row {} is never assigned", i))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            sources,
            first_len,
            second_len,
            base_len,
        })
    }

    /// Number of output rows.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn source_counts(&self) -> (usize, usize, usize) {
        self.sources
            .iter()
            .fold((0, 0, 0), |(base, first, second), source| match source {
                Source::Base(_) => (base + 1, first, second),
                Source::First(_) => (base, first + 1, second),
                Source::Second(_) => (base, first, second + 1),
            })
    }

    fn check_inputs(&self, base: Option<usize>, first: usize, second: usize) -> Result<()> {
        check_len("first input", self.first_len, first)?;
        check_len("second input", self.second_len, second)?;
        match (self.base_len, base) {
            (Some(expected), Some(found)) => check_len("base", expected, found),
            (None, None) => Ok(()),
            (Some(expected), None) => Err(SmcError::RowCountMismatch {
                context: "missing base".into(),
                expected,
                found: 0,
            }),
            (None, Some(found)) => Err(SmcError::RowCountMismatch {
                context: "unexpected base".into(),
                expected: 0,
                found,
            }),
        }
    }

    /// Merge a parallel array under the same assignment as the ensembles.
    pub fn compose_aux<T: Clone>(&self, base: Option<&[T]>, first: &[T], second: &[T]) -> Result<Vec<T>> {
        self.check_inputs(base.map(<[T]>::len), first.len(), second.len())?;
        self.sources
            .iter()
            .map(|source| match (*source, base) {
                (Source::First(r), _) => Ok(first[r].clone()),
                (Source::Second(r), _) => Ok(second[r].clone()),
                (Source::Base(r), Some(base)) => Ok(base[r].clone()),
                (Source::Base(_), None) => Err(SmcError::IncompleteAssignment(
                    "row refers to a base that was not given".into(),
                )),
            })
            .collect()
    }

    /// Merge two ensembles, and optionally a base, into one.
    pub fn compose(&self, base: Option<&Ensemble>, first: &Ensemble, second: &Ensemble) -> Result<Ensemble> {
        self.check_inputs(base.map(Ensemble::len), first.len(), second.len())?;

        let names: BTreeSet<&str> = first
            .names()
            .chain(second.names())
            .chain(base.into_iter().flat_map(|b| b.names()))
            .collect();

        let inputs = [Some(first), Some(second), base];
        if let Some(name) = names
            .iter()
            .find(|&&name| inputs.iter().flatten().any(|e| e.constant(name).is_some()))
        {
            return Err(SmcError::InconsistentRepresentation {
                variable: name.to_string(),
                reason: "constant in one input and per-row variable in another".into(),
            });
        }

        let variables = names
            .par_iter()
            .map(|&name| {
                let values = self.merge_variable(
                    base.and_then(|b| b.get(name)),
                    first.get(name),
                    second.get(name),
                );
                (name.to_string(), values)
            })
            .collect::<BTreeMap<String, Values>>();

        let mut constants: BTreeMap<String, Vec<f64>> = second.constants_map().clone();
        constants.extend(first.constants_map().clone());
        if let Some(base) = base {
            constants.extend(base.constants_map().clone());
        }

        let weights = self.merge_weights(base, first, second)?;

        Ok(Ensemble::from_parts(self.len(), variables, constants, weights))
    }

    fn merge_weights(
        &self,
        base: Option<&Ensemble>,
        first: &Ensemble,
        second: &Ensemble,
    ) -> Result<Option<Vec<f64>>> {
        let (from_base, from_first, from_second) = self.source_counts();
        let weighted = |count: usize, e: Option<&Ensemble>| {
            count == 0 || e.and_then(Ensemble::weights).is_some()
        };
        if !(weighted(from_base, base) && weighted(from_first, Some(first)) && weighted(from_second, Some(second)))
        {
            return Ok(None);
        }
        // Inputs that contribute no rows may be unweighted; their fill is never read.
        let filled = |e: &Ensemble| e.weights().map_or_else(|| vec![0f64; e.len()], <[f64]>::to_vec);
        let base_weights = base.map(filled);
        self.compose_aux(base_weights.as_deref(), &filled(first), &filled(second))
            .map(Some)
    }

    fn merge_variable(
        &self,
        base: Option<&Values>,
        first: Option<&Values>,
        second: Option<&Values>,
    ) -> Values {
        if first.is_none() && second.is_none() {
            if let Some(base) = base {
                return base.clone();
            }
        }

        let rows: Vec<Option<(&Values, usize)>> = self
            .sources
            .iter()
            .map(|source| match *source {
                Source::Base(r) => base.map(|v| (v, r)),
                Source::First(r) => first.map(|v| (v, r)),
                Source::Second(r) => second.map(|v| (v, r)),
            })
            .collect();

        let all_fixed = rows
            .iter()
            .all(|row| matches!(row, Some((Values::Fixed(_), _))));

        if all_fixed {
            let width = [base, first, second]
                .into_iter()
                .flatten()
                .map(|values| match values {
                    Values::Fixed(mat) => mat.ncols(),
                    Values::Ragged(_) => 0,
                })
                .max()
                .unwrap_or(0);
            Values::Fixed(Mat::from_fn(rows.len(), width, |i, j| match rows[i] {
                Some((Values::Fixed(mat), r)) if j < mat.ncols() => mat[(r, j)],
                _ => f64::NAN,
            }))
        } else {
            Values::Ragged(
                rows.into_iter()
                    .map(|row| row.and_then(|(values, r)| values.row(r)))
                    .collect(),
            )
        }
    }
}

/// Merge `first` and `second` into one ensemble.
///
/// `reorder_first` and `reorder_second` pick (and may repeat) the rows each
/// input contributes; `output_indices` places those rows, first input's rows
/// followed by the second input's rows, in the result.
pub fn compose(
    base: Option<&Ensemble>,
    first: &Ensemble,
    second: &Ensemble,
    output_indices: &[usize],
    reorder_first: Option<&[usize]>,
    reorder_second: Option<&[usize]>,
) -> Result<Ensemble> {
    RowAssignment::new(
        output_indices,
        first.len(),
        second.len(),
        reorder_first,
        reorder_second,
        base.map(Ensemble::len),
    )?
    .compose(base, first, second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fixed(rows: &[&[f64]]) -> Values {
        let width = rows.first().map_or(0, |r| r.len());
        let data: Vec<f64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Values::fixed(rows.len(), width, &data).unwrap()
    }

    fn ensemble(name: &str, values: Values) -> Ensemble {
        let mut ensemble = Ensemble::new(values.nrows());
        ensemble.insert(name, values).unwrap();
        ensemble
    }

    #[test]
    fn pads_narrower_fixed_block() {
        let narrow = ensemble("x", fixed(&[&[1., 2., 3.], &[4., 5., 6.]]));
        let wide = ensemble("x", fixed(&[&[7., 8., 9., 10., 11.]]));

        let merged = compose(None, &narrow, &wide, &[0, 2, 1], None, None).unwrap();
        assert_eq!(merged.len(), 3);
        let Some(Values::Fixed(mat)) = merged.get("x") else {
            panic!("expected a fixed block");
        };
        assert_eq!(mat.ncols(), 5);
        assert_eq!(&merged.get("x").unwrap().row(1).unwrap(), &[7., 8., 9., 10., 11.]);
        for (row, expected) in [(0, [1., 2., 3.]), (2, [4., 5., 6.])] {
            let values = merged.get("x").unwrap().row(row).unwrap();
            assert_eq!(&values[..3], &expected);
            assert!(values[3].is_nan() && values[4].is_nan());
        }
    }

    #[test]
    fn fixed_and_ragged_become_ragged() {
        let fixed_part = ensemble("x", fixed(&[&[1., 2.], &[3., 4.]]));
        let ragged_part = ensemble("x", Values::ragged(vec![vec![5.], vec![6., 7., 8.]]));

        let merged = compose(None, &fixed_part, &ragged_part, &[3, 0, 1, 2], None, None).unwrap();
        let x = merged.get("x").unwrap();
        assert!(x.is_ragged());
        assert_eq!(x.row(3), Some(vec![1., 2.]));
        assert_eq!(x.row(0), Some(vec![3., 4.]));
        assert_eq!(x.row(1), Some(vec![5.]));
        assert_eq!(x.row(2), Some(vec![6., 7., 8.]));
    }

    #[test]
    fn missing_variable_is_marked_absent() {
        let mut first = ensemble("x", Values::column(&[1.]));
        first.insert("y", Values::ragged(vec![vec![]])).unwrap();
        let second = ensemble("x", Values::column(&[2.]));

        let merged = compose(None, &first, &second, &[0, 1], None, None).unwrap();
        let y = merged.get("y").unwrap();
        assert_eq!(y.row(0), Some(vec![]));
        assert_eq!(y.row(1), None);
        assert!(!merged.get("x").unwrap().is_ragged());
    }

    #[test]
    fn replicates_and_permutes() {
        let retained = ensemble("x", Values::column(&[0.]));
        let free = ensemble("x", Values::column(&[10., 11., 12.]));

        // Positions 1 and 3 hold copies of the retained row, the others
        // take free rows 2 and 0.
        let merged = compose(
            None,
            &retained,
            &free,
            &[1, 3, 0, 2],
            Some(&[0, 0]),
            Some(&[2, 0]),
        )
        .unwrap();
        let column: Vec<f64> = (0..4).map(|r| merged.get("x").unwrap().row(r).unwrap()[0]).collect();
        assert_eq!(column, vec![12., 0., 10., 0.]);
    }

    #[test]
    fn base_keeps_unassigned_rows() {
        let mut base = ensemble("x", Values::column(&[1., 2., 3.]));
        base.insert("z", Values::column(&[7., 8., 9.])).unwrap();
        let first = ensemble("x", Values::column(&[20.]));
        let second = ensemble("x", Values::column(&[30.]));

        let merged = compose(Some(&base), &first, &second, &[2, 0], None, None).unwrap();
        let column: Vec<f64> = (0..3).map(|r| merged.get("x").unwrap().row(r).unwrap()[0]).collect();
        assert_eq!(column, vec![30., 2., 20.]);
        assert_eq!(merged.get("z").unwrap().row(0), Some(vec![7.]));
    }

    #[test]
    fn incomplete_assignments_fail() {
        let first = ensemble("x", Values::column(&[1., 2.]));
        let second = ensemble("x", Values::column(&[3.]));
        for output in [&[0, 1][..], &[0, 1, 1][..], &[0, 1, 3][..]] {
            assert!(matches!(
                compose(None, &first, &second, output, None, None),
                Err(SmcError::IncompleteAssignment(_))
            ));
        }
        assert!(matches!(
            compose(None, &first, &second, &[0, 1, 2], Some(&[5, 0]), None),
            Err(SmcError::IncompleteAssignment(_))
        ));
    }

    #[test]
    fn constant_clash_is_inconsistent() {
        let first = ensemble("x", Values::column(&[1.]));
        let mut second = Ensemble::new(1);
        second.set_constant("x", vec![2.]).unwrap();
        assert!(matches!(
            compose(None, &first, &second, &[0, 1], None, None),
            Err(SmcError::InconsistentRepresentation { .. })
        ));
    }

    #[test]
    fn auxiliary_array_follows_assignment() {
        let assignment = RowAssignment::new(&[1, 2, 0], 1, 2, None, None, None).unwrap();
        let merged = assignment.compose_aux(None, &["a"], &["b", "c"]).unwrap();
        assert_eq!(merged, vec!["c", "a", "b"]);

        let mut first = ensemble("x", Values::column(&[1.]));
        first.set_weights(vec![1.]).unwrap();
        let mut second = ensemble("x", Values::column(&[2., 3.]));
        second.set_weights(vec![2., 3.]).unwrap();
        let merged = assignment.compose(None, &first, &second).unwrap();
        assert_eq!(merged.weights(), Some(&[3., 1., 2.][..]));
    }
}
