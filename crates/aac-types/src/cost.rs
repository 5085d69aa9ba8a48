//! Cost functions aggregating run results into a scalar, and the statistic
//! used to rank candidates by that scalar.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::run::JobResult;

/// Maps run results to a cost. Unsuccessful runs are charged against their
/// time limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostFunction {
    /// Penalized average runtime: failed runs cost `penalty_factor * time_limit`.
    Par { penalty_factor: f64 },
    /// Plain average runtime.
    Average,
    /// Median runtime.
    Median,
}

impl Default for CostFunction {
    fn default() -> Self {
        Self::Par {
            penalty_factor: 10.0,
        }
    }
}

impl CostFunction {
    /// Cost contribution of a single finished run.
    pub fn single_cost(&self, run: &JobResult) -> f64 {
        let limit = f64::from(run.time_limit);
        match self {
            Self::Par { penalty_factor } => {
                if run.is_successful() {
                    run.result_time
                } else {
                    limit * penalty_factor
                }
            }
            Self::Average | Self::Median => {
                if run.is_successful() {
                    run.result_time
                } else {
                    limit
                }
            }
        }
    }

    /// Aggregated cost over `runs`; an empty slice costs nothing.
    pub fn cost<'a, I>(&self, runs: I) -> f64
    where
        I: IntoIterator<Item = &'a JobResult>,
    {
        let mut costs: Vec<f64> = runs.into_iter().map(|r| self.single_cost(r)).collect();
        if costs.is_empty() {
            return 0.0;
        }
        match self {
            Self::Par { .. } | Self::Average => costs.iter().sum::<f64>() / costs.len() as f64,
            Self::Median => {
                costs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
                let mid = costs.len() / 2;
                if costs.len() % 2 == 0 {
                    (costs[mid - 1] + costs[mid]) / 2.0
                } else {
                    costs[mid]
                }
            }
        }
    }

    /// Partial-data cost only ever grows for these functions, which makes
    /// early termination of a losing candidate sound.
    pub fn supports_capping(&self) -> bool {
        matches!(self, Self::Par { .. } | Self::Average)
    }

    pub fn name(&self) -> String {
        match self {
            Self::Par { penalty_factor } => format!("PAR{penalty_factor}"),
            Self::Average => "Average".to_string(),
            Self::Median => "Median".to_string(),
        }
    }
}

/// A cost function together with an optimization direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostStatistic {
    pub function: CostFunction,
    pub minimize: bool,
}

impl Default for CostStatistic {
    fn default() -> Self {
        Self {
            function: CostFunction::default(),
            minimize: true,
        }
    }
}

impl CostStatistic {
    pub fn new(function: CostFunction, minimize: bool) -> Self {
        Self { function, minimize }
    }

    /// Positive when `mine` is the better cost, negative when `other` is,
    /// zero on a tie.
    pub fn compare(&self, mine: f64, other: f64) -> i32 {
        let ordering = mine.partial_cmp(&other).unwrap_or(Ordering::Equal);
        let sign = match ordering {
            Ordering::Less => 1,
            Ordering::Greater => -1,
            Ordering::Equal => 0,
        };
        if self.minimize {
            sign
        } else {
            -sign
        }
    }

    /// Whether aggressive capping may be applied under this statistic.
    pub fn allows_capping(&self) -> bool {
        self.minimize && self.function.supports_capping()
    }
}
