// Volume storage

use log::debug;
use ndarray::{Array3, Array4, ArrayD, Axis, Ix3, Ix4};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;

use crate::error::{DenoiseError, Result};

/// A 4-D signal with the header it was read with.
#[derive(Debug, Clone)]
pub struct SignalVolume {
    /// Shape: (X, Y, Z, T)
    pub data: Array4<f32>,
    pub header: NiftiHeader,
}

/// A spatial mask. Any non-zero voxel in the file is selected.
#[derive(Debug, Clone)]
pub struct MaskVolume {
    /// Shape: (X, Y, Z)
    pub data: Array3<bool>,
    pub header: NiftiHeader,
}

/// Where signals and masks come from and where results go.
pub trait VolumeStore {
    fn read_signal(&self, path: &Path) -> Result<SignalVolume>;
    fn read_mask(&self, path: &Path) -> Result<MaskVolume>;
    fn write_signal(&self, volume: &SignalVolume, path: &Path) -> Result<()>;
}

/// [`VolumeStore`] backed by NIfTI-1 files (`.nii`, `.nii.gz`).
#[derive(Debug, Clone, Copy, Default)]
pub struct NiftiStore;

impl NiftiStore {
    fn read_array(path: &Path) -> Result<(ArrayD<f32>, NiftiHeader)> {
        if !path.exists() {
            return Err(DenoiseError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }
        let obj = ReaderOptions::new()
            .read_file(path)
            .map_err(|e| format_error(path, format!("Failed to read NIfTI file: {}", e)))?;
        let header = obj.header().clone();
        let data = obj
            .into_volume()
            .into_ndarray::<f32>()
            .map_err(|e| format_error(path, format!("Failed to convert volume to ndarray: {}", e)))?;
        debug!("Read {} with shape {:?}", path.display(), data.shape());
        Ok((data, header))
    }
}

impl VolumeStore for NiftiStore {
    fn read_signal(&self, path: &Path) -> Result<SignalVolume> {
        let (data, header) = Self::read_array(path)?;
        let data = drop_trailing_singletons(data, 4);
        if data.ndim() != 4 {
            return Err(format_error(
                path,
                format!("Expected a 4-D signal volume, got {} dimensions {:?}.", data.ndim(), data.shape()),
            ));
        }
        let data = data
            .into_dimensionality::<Ix4>()
            .map_err(|e| format_error(path, e.to_string()))?;
        Ok(SignalVolume { data, header })
    }

    fn read_mask(&self, path: &Path) -> Result<MaskVolume> {
        let (data, header) = Self::read_array(path)?;
        let mut data = drop_trailing_singletons(data, 3);
        if data.ndim() > 3 {
            return Err(format_error(
                path,
                format!("Expected a 3-D mask, got {} non-singleton dimensions {:?}.", data.ndim(), data.shape()),
            ));
        }
        while data.ndim() < 3 {
            let axis = data.ndim();
            data = data.insert_axis(Axis(axis));
        }
        let data = data
            .into_dimensionality::<Ix3>()
            .map_err(|e| format_error(path, e.to_string()))?
            .mapv(|v| v != 0.0);
        Ok(MaskVolume { data, header })
    }

    fn write_signal(&self, volume: &SignalVolume, path: &Path) -> Result<()> {
        // The data is written as plain f32, so any scaling in the source header no longer applies.
        let mut header = volume.header.clone();
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        WriterOptions::new(path)
            .reference_header(&header)
            .write_nifti(&volume.data)
            .map_err(|e| format_error(path, format!("Failed to write NIfTI file: {}", e)))?;
        debug!("Wrote {} with shape {:?}", path.display(), volume.data.shape());
        Ok(())
    }
}

/// Removes trailing length-1 axes while the array has more than `min_ndim` axes.
fn drop_trailing_singletons(mut data: ArrayD<f32>, min_ndim: usize) -> ArrayD<f32> {
    while data.ndim() > min_ndim && data.shape()[data.ndim() - 1] == 1 {
        let last = data.ndim() - 1;
        data = data.index_axis_move(Axis(last), 0);
    }
    data
}

fn format_error(path: &Path, message: String) -> DenoiseError {
    DenoiseError::Format { path: path.to_path_buf(), message }
}
