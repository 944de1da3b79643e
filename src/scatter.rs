// Scatter-back of processed rows onto the voxel grid

use log::debug;
use ndarray::{s, Array2, Array4};

use crate::error::{DenoiseError, Result};
use crate::extract::VoxelIndex;

/// Writes row `i` of `rows` into `signal[x_i, y_i, z_i, ..]`, where
/// `voxels[i] = (x_i, y_i, z_i)` is the row index returned by the extractor.
///
/// Voxels that do not appear in `voxels` are not touched. Values are narrowed
/// to `f32` on the way back.
///
/// # Errors
/// Returns a configuration error if the number of rows differs from the number
/// of voxels, if the series length differs from the signal's last axis, or if a
/// voxel lies outside the signal.
pub fn scatter_back(signal: &mut Array4<f32>, rows: &Array2<f64>, voxels: &[VoxelIndex]) -> Result<()> {
    let (nx, ny, nz, series_length) = signal.dim();
    if rows.nrows() != voxels.len() {
        return Err(DenoiseError::config(format!(
            "Row count ({}) does not match the number of indexed voxels ({}).",
            rows.nrows(),
            voxels.len()
        )));
    }
    if rows.ncols() != series_length {
        return Err(DenoiseError::config(format!(
            "Row length ({}) does not match the signal's series length ({}).",
            rows.ncols(),
            series_length
        )));
    }
    if let Some(&VoxelIndex(x, y, z)) = voxels.iter().find(|v| v.0 >= nx || v.1 >= ny || v.2 >= nz) {
        return Err(DenoiseError::config(format!(
            "Voxel ({}, {}, {}) lies outside the {}x{}x{} volume.",
            x, y, z, nx, ny, nz
        )));
    }

    for (row, &VoxelIndex(x, y, z)) in rows.outer_iter().zip(voxels) {
        signal
            .slice_mut(s![x, y, z, ..])
            .zip_mut_with(&row, |out, &value| *out = value as f32);
    }
    debug!("Scattered {} rows back into a {}x{}x{}x{} volume", voxels.len(), nx, ny, nz, series_length);
    Ok(())
}
