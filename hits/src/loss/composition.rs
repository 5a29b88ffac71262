use serde::{Deserialize, Serialize};

use crate::{MlErr, Result, arch::Scale};

/// The most terms `CompositionTable::exhaustive` builds.
pub const MAX_TERMS: usize = 1 << 16;

/// How the squared errors of the terms of a table are combined.
///
/// `Sum` adds the terms elementwise and the max is taken over the sum. `Mean` averages
/// them and the max is taken over every squared error of every term.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    #[default]
    Sum,
    Mean,
}

/// A sequence of steps compared against one column of the targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Composition {
    /// The column of `ys` holding the target, horizon `h` lives in column `h - 1`.
    pub column: usize,
    pub steps: Vec<Scale>,
}

impl Composition {
    /// Returns the amount of base units the composition spans.
    pub fn units(&self, step_size: usize) -> usize {
        self.steps.iter().map(|s| s.units(step_size)).sum()
    }
}

/// The set of step compositions scored by a `CompositeLoss`.
#[derive(Clone, Debug, PartialEq)]
pub struct CompositionTable {
    terms: Vec<Composition>,
    reduction: Reduction,
    weighted: bool,
}

impl CompositionTable {
    /// Builds a table out of arbitrary terms.
    ///
    /// # Returns
    /// The table or an error if there are no terms or some term has no steps.
    pub fn new(terms: Vec<Composition>, reduction: Reduction) -> Result<Self> {
        if terms.is_empty() {
            return Err(MlErr::invalid("a composition table needs at least one term"));
        }

        if terms.iter().any(|t| t.steps.is_empty()) {
            return Err(MlErr::invalid("compositions must take at least one step"));
        }

        Ok(Self {
            terms,
            reduction,
            weighted: true,
        })
    }

    /// Every ordering of large and small steps reaching each horizon.
    ///
    /// # Arguments
    /// * `step_size` - The stride of the large block, in base units.
    /// * `n_horizons` - The last horizon to score, in base units.
    ///
    /// # Returns
    /// A summed table holding, for every `h` in `1..=n_horizons`, all the sequences whose
    /// units add up to `h`, or an error if there would be more than `MAX_TERMS` of them.
    pub fn exhaustive(step_size: usize, n_horizons: usize) -> Result<Self> {
        if step_size < 2 {
            return Err(MlErr::invalid(format!(
                "the large step must span at least 2 base units, got {step_size}"
            )));
        }

        // every horizon holds at least the all small sequence
        if n_horizons > MAX_TERMS || count_exhaustive(step_size, n_horizons) > MAX_TERMS {
            return Err(MlErr::invalid(format!(
                "{n_horizons} horizons with a stride of {step_size} need more than {MAX_TERMS} \
                 terms"
            )));
        }

        let mut terms = Vec::new();
        for h in 1..=n_horizons {
            let mut prefix = Vec::new();
            walk(h, step_size, &mut prefix, &mut |steps: &[Scale]| {
                terms.push(Composition {
                    column: h - 1,
                    steps: steps.to_vec(),
                })
            });
        }

        Self::new(terms, Reduction::Sum)
    }

    /// The five horizon table of the `step_size == 2` experiments.
    ///
    /// Horizon 3 only scores the small then large ordering. The table is unweighted, its
    /// objective is always the mean of the summed errors whatever the loss weight.
    pub fn legacy() -> Self {
        use crate::arch::Scale::{Large as L, Small as S};

        let horizons: [&[&[Scale]]; 5] = [
            &[&[S]],
            &[&[S, S], &[L]],
            &[&[S, L]],
            &[&[L, L], &[S, S, S, S], &[S, S, L], &[L, S, S]],
            &[
                &[L, L, S],
                &[S, L, L],
                &[L, S, L],
                &[S, S, S, S, S],
                &[L, S, S, S],
                &[S, L, S, S],
                &[S, S, L, S],
                &[S, S, S, L],
            ],
        ];

        let terms = horizons
            .iter()
            .enumerate()
            .flat_map(|(column, seqs)| {
                seqs.iter().map(move |steps| Composition {
                    column,
                    steps: steps.to_vec(),
                })
            })
            .collect();

        Self {
            terms,
            reduction: Reduction::Sum,
            weighted: false,
        }
    }

    /// Repeated steps of a single block, averaged.
    ///
    /// # Arguments
    /// * `scale` - The block taking every step.
    /// * `step_size` - The stride of the large block, in base units.
    /// * `n_steps` - The longest chain of steps to score.
    pub fn single_scale(scale: Scale, step_size: usize, n_steps: usize) -> Result<Self> {
        let units = scale.units(step_size);
        let terms = (1..=n_steps)
            .map(|k| Composition {
                column: k * units - 1,
                steps: vec![scale; k],
            })
            .collect();

        Self::new(terms, Reduction::Mean)
    }

    pub fn terms(&self) -> &[Composition] {
        &self.terms
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// Whether the loss weight blends in the max error, `false` scores the mean alone.
    pub fn is_weighted(&self) -> bool {
        self.weighted
    }

    /// Returns the amount of target columns the table reads.
    pub fn n_columns(&self) -> usize {
        self.terms.iter().map(|t| t.column + 1).max().unwrap_or(0)
    }
}

/// Counts the sequences `exhaustive` would emit, saturating on overflow.
fn count_exhaustive(step_size: usize, n_horizons: usize) -> usize {
    // ways[h] is the amount of sequences reaching exactly h
    let mut ways = vec![0usize; n_horizons + 1];
    ways[0] = 1;
    for h in 1..=n_horizons {
        let large = h.checked_sub(step_size).map_or(0, |r| ways[r]);
        ways[h] = ways[h - 1].saturating_add(large);
    }

    ways[1..].iter().fold(0, |acc, &w| acc.saturating_add(w))
}

fn walk<F>(remaining: usize, step_size: usize, prefix: &mut Vec<Scale>, emit: &mut F)
where
    F: FnMut(&[Scale]),
{
    if remaining == 0 {
        emit(prefix);
        return;
    }

    for scale in [Scale::Large, Scale::Small] {
        let units = scale.units(step_size);
        if units <= remaining {
            prefix.push(scale);
            walk(remaining - units, step_size, prefix, emit);
            prefix.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Scale::{Large as L, Small as S};

    fn column(table: &CompositionTable, column: usize) -> Vec<Vec<Scale>> {
        table
            .terms()
            .iter()
            .filter(|t| t.column == column)
            .map(|t| t.steps.clone())
            .collect()
    }

    #[test]
    fn exhaustive_counts_follow_fibonacci_for_stride_two() {
        let table = CompositionTable::exhaustive(2, 5).unwrap();

        let counts: Vec<_> = (0..5).map(|c| column(&table, c).len()).collect();
        assert_eq!(counts, [1, 2, 3, 5, 8]);
        assert_eq!(table.n_columns(), 5);
        assert_eq!(table.reduction(), Reduction::Sum);
    }

    #[test]
    fn exhaustive_terms_reach_their_horizon() {
        let table = CompositionTable::exhaustive(4, 9).unwrap();
        for term in table.terms() {
            assert_eq!(term.units(4), term.column + 1);
        }

        assert_eq!(column(&table, 3), [vec![L], vec![S, S, S, S]]);
    }

    #[test]
    fn exhaustive_rejects_unit_stride() {
        assert!(CompositionTable::exhaustive(1, 3).is_err());
        assert!(CompositionTable::exhaustive(2, 0).is_err());
    }

    #[test]
    fn exhaustive_refuses_tables_too_large_to_build() {
        assert_eq!(count_exhaustive(2, 5), 19);
        assert_eq!(count_exhaustive(4, 9), CompositionTable::exhaustive(4, 9).unwrap().len());

        assert!(CompositionTable::exhaustive(2, 40).is_err());
        assert!(CompositionTable::exhaustive(2, usize::MAX / 2).is_err());
        assert!(CompositionTable::exhaustive(64, 64).is_ok());
    }

    #[test]
    fn legacy_skips_large_then_small() {
        let table = CompositionTable::legacy();

        assert_eq!(table.len(), 16);
        assert_eq!(column(&table, 2), [vec![S, L]]);
        assert!(!table.is_weighted());
        assert!(table.terms().iter().all(|t| t.units(2) == t.column + 1));
    }

    #[test]
    fn single_scale_reads_every_stride() {
        let table = CompositionTable::single_scale(L, 4, 3).unwrap();
        let columns: Vec<_> = table.terms().iter().map(|t| t.column).collect();

        assert_eq!(columns, [3, 7, 11]);
        assert_eq!(table.terms()[2].steps, [L, L, L]);
        assert_eq!(table.reduction(), Reduction::Mean);
        assert!(table.is_weighted());
    }
}
