// Post-reconstruction floor correction

use log::{debug, info};
use ndarray::{Array2, ArrayViewMut1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Which rows count as invalid after truncated reconstruction, and how they are repaired.
///
/// Both active policies shift an offending row by a constant so its minimum
/// becomes exactly 1. The shape of the series is kept; only an offset is added.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FloorPolicy {
    /// Rows holding any value `<= 0` become `row - min + 1`.
    #[default]
    NonPositive,
    /// Rows holding any value `< 1` become `row - min + 1`.
    BelowUnity,
    /// Rows are left as reconstructed.
    Disabled,
}

impl FloorPolicy {
    /// Smallest value a corrected row is guaranteed to hold, if the policy is active.
    pub fn floor(&self) -> Option<f64> {
        match self {
            FloorPolicy::NonPositive => Some(0.0),
            FloorPolicy::BelowUnity => Some(1.0),
            FloorPolicy::Disabled => None,
        }
    }

    fn violates(&self, row_min: f64) -> bool {
        match self {
            FloorPolicy::NonPositive => row_min <= 0.0,
            FloorPolicy::BelowUnity => row_min < 1.0,
            FloorPolicy::Disabled => false,
        }
    }

    /// Applies the policy to one row. Returns true if the row was shifted.
    pub fn correct_row(&self, mut row: ArrayViewMut1<f64>) -> bool {
        let row_min = row.iter().copied().fold(f64::INFINITY, f64::min);
        if !row_min.is_finite() || !self.violates(row_min) {
            return false;
        }
        row.mapv_inplace(|v| v - row_min + 1.0);
        true
    }
}

/// Applies `policy` to every row of `matrix` in parallel.
///
/// Rows are independent, so each rayon task owns exactly one row.
/// Returns the number of rows that were shifted.
pub fn correct_rows(matrix: &mut Array2<f64>, policy: FloorPolicy) -> usize {
    if policy == FloorPolicy::Disabled {
        debug!("Floor correction disabled; {} rows left as reconstructed", matrix.nrows());
        return 0;
    }
    let corrected = matrix
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .map(|row| policy.correct_row(row))
        .filter(|&shifted| shifted)
        .count();
    info!(
        "Floor correction ({:?}) shifted {} of {} rows",
        policy,
        corrected,
        matrix.nrows()
    );
    corrected
}
