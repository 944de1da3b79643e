// Masked dataset extraction

use log::{debug, info};
use ndarray::{Array2, Array3, ArrayView1, ArrayView3, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{DenoiseError, Result};

/// Spatial coordinate `(x, y, z)` of one observation row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoxelIndex(pub usize, pub usize, pub usize);

/// Decides which masked voxels carry too little signal to be observations.
///
/// A sample is near-zero when `|value| <= zero_tolerance`. A voxel is kept only
/// if at least one sample is non-zero and the non-zero fraction of its series
/// is at least `min_nonzero_fraction`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct DegeneracyRule {
    pub zero_tolerance: f32,
    pub min_nonzero_fraction: f64,
}

impl Default for DegeneracyRule {
    fn default() -> Self {
        DegeneracyRule {
            zero_tolerance: 1e-6,
            min_nonzero_fraction: 0.05,
        }
    }
}

impl DegeneracyRule {
    pub fn validate(&self) -> Result<()> {
        if !(self.zero_tolerance >= 0.0) {
            return Err(DenoiseError::config(format!(
                "Zero tolerance must be non-negative, got {}.",
                self.zero_tolerance
            )));
        }
        if !(0.0..=1.0).contains(&self.min_nonzero_fraction) {
            return Err(DenoiseError::config(format!(
                "Minimum non-zero fraction must be in [0, 1], got {}.",
                self.min_nonzero_fraction
            )));
        }
        Ok(())
    }

    /// True if the series should stay out of the observation matrix.
    pub fn is_degenerate(&self, series: ArrayView1<f32>) -> bool {
        if series.is_empty() {
            return true;
        }
        let nonzero = series.iter().filter(|v| v.abs() > self.zero_tolerance).count();
        nonzero == 0 || (nonzero as f64) < self.min_nonzero_fraction * series.len() as f64
    }
}

/// Observation matrix plus the bookkeeping needed to scatter it back.
#[derive(Debug, Clone)]
pub struct MaskedDataset {
    /// One row per kept voxel, one column per sample of the series.
    /// Shape: (voxels.len(), series_length)
    pub observations: Array2<f64>,
    /// Voxel coordinate of each row, in row order.
    pub voxels: Vec<VoxelIndex>,
    /// The caller's mask minus degenerate voxels. True exactly at `voxels`.
    pub refined_mask: Array3<bool>,
}

impl MaskedDataset {
    pub fn n_rows(&self) -> usize {
        self.observations.nrows()
    }

    pub fn series_length(&self) -> usize {
        self.observations.ncols()
    }
}

/// Builds the observation matrix from the voxels selected by `mask`.
///
/// Voxels are visited with `x` varying fastest, then `y`, then `z`, and a row is
/// emitted for each masked voxel that `rule` does not reject.
///
/// * `signal` - Volume of shape (X, Y, Z, T).
/// * `mask` - Spatial mask of shape (X, Y, Z).
///
/// # Errors
/// Returns a configuration error if the mask shape differs from the signal's
/// spatial shape, or if `rule` is invalid.
pub fn extract(signal: ArrayView4<f32>, mask: ArrayView3<bool>, rule: &DegeneracyRule) -> Result<MaskedDataset> {
    rule.validate()?;
    let (nx, ny, nz, series_length) = signal.dim();
    if mask.dim() != (nx, ny, nz) {
        return Err(DenoiseError::config(format!(
            "Mask dimensions {:?} do not match the signal's spatial dimensions {:?}.",
            mask.dim(),
            (nx, ny, nz)
        )));
    }

    let mut refined_mask = Array3::from_elem((nx, ny, nz), false);
    let mut voxels = Vec::new();
    let mut values: Vec<f64> = Vec::new();
    let mut masked_count = 0usize;

    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                if !mask[[x, y, z]] {
                    continue;
                }
                masked_count += 1;
                let series = signal.slice(ndarray::s![x, y, z, ..]);
                if rule.is_degenerate(series) {
                    continue;
                }
                refined_mask[[x, y, z]] = true;
                voxels.push(VoxelIndex(x, y, z));
                values.extend(series.iter().map(|&v| v as f64));
            }
        }
    }

    let observations = Array2::from_shape_vec((voxels.len(), series_length), values)
        .map_err(|e| DenoiseError::config(format!("Failed to assemble observation matrix: {}", e)))?;

    debug!(
        "Dropped {} of {} masked voxels as degenerate",
        masked_count - voxels.len(),
        masked_count
    );
    info!(
        "Extracted {} observations x {} samples from a {}x{}x{} mask",
        observations.nrows(),
        series_length,
        nx,
        ny,
        nz
    );
    debug_assert_eq!(refined_mask.iter().filter(|&&m| m).count(), voxels.len());
    debug_assert_eq!(observations.len_of(Axis(0)), voxels.len());

    Ok(MaskedDataset { observations, voxels, refined_mask })
}
