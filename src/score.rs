//! Standardisation of prescribing rates into the composite loneliness score.
//!
//! Rates are percentages of total prescribing; z-scores standardise each
//! condition across the full area set; the composite is the per-area sum of
//! condition z-scores, which is then ranked and cut into ten equal-frequency
//! buckets. Degenerate statistics (zero total prescribing, zero variance)
//! become missing values, never zeros, so downstream ranking skips those
//! areas instead of mis-placing them.

use crate::{geography::AreaSummaries, ArcStr};
use noisy_float::prelude::*;
use statrs::statistics::Statistics;

/// What a missing per-condition z-score does to the composite sum.
///
/// The source pipelines differ subtly here, so it is a per-deployment
/// choice rather than a hard-coded behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingPolicy {
    /// Sum the z-scores that are present (missing if all are). This is what
    /// a pandas row-wise `sum` does.
    #[default]
    Exclude,
    /// Any missing z-score makes the whole composite missing.
    Propagate,
}

/// Final output row for one area.
#[derive(Debug, Clone)]
pub struct AreaScore {
    pub area: ArcStr,
    /// Per-condition percentage of total prescribing, aligned with
    /// [`AreaScores::conditions`].
    pub rates: Vec<Option<f64>>,
    /// Percentage matching any loneliness-related condition.
    pub any_rate: Option<f64>,
    pub zscores: Vec<Option<f64>>,
    pub composite: Option<f64>,
    pub rank: Option<f64>,
    pub decile: Option<u8>,
}

/// Scored areas; deciles are computed jointly across the whole set, so this
/// owns all rows rather than scoring areas independently.
#[derive(Debug, Clone)]
pub struct AreaScores {
    pub conditions: Vec<ArcStr>,
    pub rows: Vec<AreaScore>,
}

impl AreaScores {
    pub fn compute(
        summaries: &AreaSummaries,
        conditions: Vec<ArcStr>,
        policy: MissingPolicy,
    ) -> Self {
        assert_eq!(conditions.len(), summaries.n_conditions());
        let n_conditions = conditions.len();

        let mut rows: Vec<AreaScore> = summaries
            .iter()
            .map(|(area, totals)| AreaScore {
                area: area.clone(),
                rates: totals
                    .by_condition
                    .iter()
                    .map(|&c| percentage(c, totals.total))
                    .collect(),
                any_rate: percentage(totals.any, totals.total),
                zscores: vec![None; n_conditions],
                composite: None,
                rank: None,
                decile: None,
            })
            .collect();

        for cond in 0..n_conditions {
            let column: Vec<Option<f64>> = rows.iter().map(|r| r.rates[cond]).collect();
            for (row, z) in rows.iter_mut().zip(zscores(&column)) {
                row.zscores[cond] = z;
            }
        }

        for row in rows.iter_mut() {
            row.composite = composite(&row.zscores, policy);
        }

        let composites: Vec<Option<f64>> = rows.iter().map(|r| r.composite).collect();
        let (ranks, deciles) = rank_and_decile(&composites);
        for ((row, rank), decile) in rows.iter_mut().zip(ranks).zip(deciles) {
            row.rank = rank;
            row.decile = decile;
        }

        AreaScores { conditions, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AreaScore> {
        self.rows.iter()
    }
}

/// `part / total * 100`, missing when there is nothing to divide by.
pub fn percentage(part: u64, total: u64) -> Option<f64> {
    if total == 0 {
        None
    } else {
        Some(part as f64 / total as f64 * 100.0)
    }
}

/// Z-score a column across areas using the mean and sample standard
/// deviation of the present values. Missing inputs stay missing; a
/// zero-variance or single-value column is wholly missing.
pub fn zscores(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.len() < 2 {
        return vec![None; values.len()];
    }
    let mean = present.iter().mean();
    let sd = present.iter().std_dev();
    if sd == 0.0 || !sd.is_finite() {
        return vec![None; values.len()];
    }
    values
        .iter()
        .map(|v| v.map(|v| (v - mean) / sd))
        .collect()
}

fn composite(zscores: &[Option<f64>], policy: MissingPolicy) -> Option<f64> {
    match policy {
        MissingPolicy::Exclude => {
            let present: Vec<f64> = zscores.iter().flatten().copied().collect();
            if present.is_empty() {
                None
            } else {
                Some(present.iter().sum())
            }
        }
        MissingPolicy::Propagate => zscores
            .iter()
            .map(|z| *z)
            .collect::<Option<Vec<f64>>>()
            .map(|zs| zs.iter().sum()),
    }
}

/// Ascending ranks (ties averaged) and equal-frequency decile buckets 0..=9
/// for a score column. Missing scores get missing rank and decile. Boundary
/// ties land together in the lower adjacent bucket, so decile is always
/// monotone in score.
pub fn rank_and_decile(scores: &[Option<f64>]) -> (Vec<Option<f64>>, Vec<Option<u8>>) {
    (rank_ascending(scores), deciles(scores))
}

pub fn rank_ascending(scores: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut order: Vec<usize> = (0..scores.len()).filter(|&i| scores[i].is_some()).collect();
    // scores are never NaN by construction, r64 enforces it
    order.sort_by_key(|&i| r64(scores[i].unwrap()));

    let mut ranks = vec![None; scores.len()];
    let mut pos = 0;
    while pos < order.len() {
        let value = scores[order[pos]].unwrap();
        let mut end = pos;
        while end < order.len() && scores[order[end]].unwrap() == value {
            end += 1;
        }
        // ranks are 1-based; ties share the average of their positions
        let rank = (pos + 1..=end).map(|r| r as f64).sum::<f64>() / (end - pos) as f64;
        for &idx in &order[pos..end] {
            ranks[idx] = Some(rank);
        }
        pos = end;
    }
    ranks
}

pub fn deciles(scores: &[Option<f64>]) -> Vec<Option<u8>> {
    let mut sorted: Vec<R64> = scores.iter().flatten().map(|&v| r64(v)).collect();
    sorted.sort();
    let n = sorted.len();
    scores
        .iter()
        .map(|score| {
            score.map(|v| {
                let below = sorted.partition_point(|&x| x < r64(v));
                ((below * 10 / n) as u8).min(9)
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn percentage_bounds_and_zero_total() {
        assert_eq!(percentage(0, 100), Some(0.0));
        assert_eq!(percentage(100, 100), Some(100.0));
        assert_eq!(percentage(25, 100), Some(25.0));
        // zero total prescribing is missing, not zero
        assert_eq!(percentage(0, 0), None);
    }

    #[test]
    fn zscores_standardise() {
        let values = vec![Some(1.0), Some(2.0), Some(3.0)];
        let zs = zscores(&values);
        // sample sd of [1,2,3] is 1
        assert!((zs[0].unwrap() + 1.0).abs() < 1e-12);
        assert!(zs[1].unwrap().abs() < 1e-12);
        assert!((zs[2].unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zscores_propagate_missing() {
        let values = vec![Some(1.0), None, Some(3.0)];
        let zs = zscores(&values);
        assert!(zs[0].is_some());
        assert!(zs[1].is_none());
        assert!(zs[2].is_some());
    }

    #[test]
    fn zero_variance_column_is_missing() {
        let values = vec![Some(2.0), Some(2.0), Some(2.0)];
        assert_eq!(zscores(&values), vec![None, None, None]);
    }

    #[test]
    fn composite_policies() {
        let zs = vec![Some(1.0), None, Some(0.5)];
        assert_eq!(composite(&zs, MissingPolicy::Exclude), Some(1.5));
        assert_eq!(composite(&zs, MissingPolicy::Propagate), None);
        assert_eq!(composite(&[None, None], MissingPolicy::Exclude), None);
        let full = vec![Some(1.0), Some(-1.0)];
        assert_eq!(composite(&full, MissingPolicy::Propagate), Some(0.0));
    }

    #[test]
    fn ranks_average_ties() {
        let scores = vec![Some(3.0), Some(1.0), Some(3.0), None, Some(0.5)];
        let ranks = rank_ascending(&scores);
        assert_eq!(ranks[4], Some(1.0));
        assert_eq!(ranks[1], Some(2.0));
        // the two 3.0s occupy positions 3 and 4
        assert_eq!(ranks[0], Some(3.5));
        assert_eq!(ranks[2], Some(3.5));
        assert_eq!(ranks[3], None);
    }

    #[test]
    fn deciles_are_monotone_in_score() {
        let scores: Vec<Option<f64>> = (0..40).map(|i| Some(i as f64)).collect();
        let ds = deciles(&scores);
        for w in ds.windows(2) {
            assert!(w[0].unwrap() <= w[1].unwrap());
        }
        assert_eq!(ds[0], Some(0));
        assert_eq!(ds[39], Some(9));
    }

    #[test]
    fn boundary_ties_share_a_bucket() {
        // 20 values; positions 8 and 9 (0-based) are equal and straddle the
        // 40%/50% boundary - both must land in the lower bucket.
        let mut scores: Vec<Option<f64>> = (0..20).map(|i| Some(i as f64)).collect();
        scores[9] = Some(8.0);
        let ds = deciles(&scores);
        assert_eq!(ds[8], ds[9]);
        assert_eq!(ds[8], Some(4));
    }

    #[test]
    fn small_input_populates_sub_range() {
        let scores = vec![Some(1.0), Some(2.0)];
        let ds = deciles(&scores);
        assert_eq!(ds, vec![Some(0), Some(5)]);
    }

    #[test]
    fn missing_scores_skip_rank_and_decile() {
        let scores = vec![None, Some(1.0)];
        let (ranks, ds) = rank_and_decile(&scores);
        assert_eq!(ranks[0], None);
        assert_eq!(ds[0], None);
        assert_eq!(ranks[1], Some(1.0));
        assert_eq!(ds[1], Some(0));
    }
}
