// End-to-end masked denoising

use log::{debug, info};
use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::correct::{correct_rows, FloorPolicy};
use crate::error::{DenoiseError, Result};
use crate::extract::{extract, DegeneracyRule};
use crate::pca::{filter, ComponentBudget, PcaModel, DEFAULT_MAX_COMPONENT_FRACTION};
use crate::scatter::scatter_back;
use crate::volume_io::{SignalVolume, VolumeStore};

/// Everything that shapes a denoising run.
///
/// Component bounds left as `None` default to `ceil(0.05 T)` and
/// `ceil(0.3333 T)` for a series of `T` samples.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DenoisingConfig {
    pub variance: f64,
    pub min_components: Option<usize>,
    pub max_components: Option<usize>,
    pub floor_policy: FloorPolicy,
    pub degeneracy: DegeneracyRule,
}

impl Default for DenoisingConfig {
    fn default() -> Self {
        DenoisingConfig {
            variance: 0.95,
            min_components: None,
            max_components: None,
            floor_policy: FloorPolicy::default(),
            degeneracy: DegeneracyRule::default(),
        }
    }
}

impl DenoisingConfig {
    /// Resolves the component bounds for a series of `series_length` samples.
    ///
    /// # Errors
    /// Returns a configuration error if the resolved budget is invalid.
    pub fn budget_for(&self, series_length: usize) -> Result<ComponentBudget> {
        let defaults = ComponentBudget::for_series_length(self.variance, series_length, DEFAULT_MAX_COMPONENT_FRACTION)?;
        ComponentBudget::new(
            self.variance,
            self.min_components.unwrap_or(defaults.min_components),
            self.max_components.unwrap_or(defaults.max_components),
        )
    }
}

/// What a run did.
#[derive(Debug, Clone, PartialEq)]
pub struct DenoiseSummary {
    pub series_length: usize,
    /// Voxels selected by the caller's mask.
    pub masked_voxels: usize,
    /// Voxels left after degenerate series were removed.
    pub rows_used: usize,
    pub budget: ComponentBudget,
    pub components_used: usize,
    pub explained_variance_ratio: f64,
    pub corrected_rows: usize,
    pub elapsed: Duration,
}

/// Output of [`denoise`].
#[derive(Debug, Clone)]
pub struct DenoisedVolume {
    /// Input signal with the refined-mask voxels replaced.
    pub signal: Array4<f32>,
    /// Voxels whose series were replaced.
    pub refined_mask: Array3<bool>,
    /// Basis used for the reconstruction.
    pub model: PcaModel,
    pub summary: DenoiseSummary,
}

/// Denoises the masked voxels of `signal`.
///
/// Runs extraction, variance-bounded PCA reconstruction, floor correction and
/// scatter-back. The input is not modified; voxels outside the refined mask
/// are copied through unchanged.
///
/// * `signal` - Volume of shape (X, Y, Z, T).
/// * `mask` - Spatial mask of shape (X, Y, Z).
pub fn denoise(signal: &Array4<f32>, mask: &Array3<bool>, config: &DenoisingConfig) -> Result<DenoisedVolume> {
    let start = Instant::now();
    let series_length = signal.dim().3;
    let budget = config.budget_for(series_length)?;
    debug!(
        "Component budget: variance {}, components in [{}, {}]",
        budget.variance, budget.min_components, budget.max_components
    );

    let dataset = extract(signal.view(), mask.view(), &config.degeneracy)?;
    let masked_voxels = mask.iter().filter(|&&m| m).count();
    let rows_used = dataset.n_rows();
    if rows_used == 0 {
        return Err(DenoiseError::config(format!(
            "No usable voxels: the mask selects {} voxels and all of them carry a degenerate series.",
            masked_voxels
        )));
    }

    let reconstruction = filter(dataset.observations, &budget)?;
    let mut denoised_rows = reconstruction.denoised;
    let corrected_rows = correct_rows(&mut denoised_rows, config.floor_policy);

    let mut output = signal.clone();
    scatter_back(&mut output, &denoised_rows, &dataset.voxels)?;

    let summary = DenoiseSummary {
        series_length,
        masked_voxels,
        rows_used,
        budget,
        components_used: reconstruction.components_used,
        explained_variance_ratio: reconstruction.model.explained_variance_ratio(),
        corrected_rows,
        elapsed: start.elapsed(),
    };
    info!(
        "Denoised {} of {} masked voxels with {} of {} components in {:?}",
        rows_used, masked_voxels, summary.components_used, series_length, summary.elapsed
    );

    Ok(DenoisedVolume {
        signal: output,
        refined_mask: dataset.refined_mask,
        model: reconstruction.model,
        summary,
    })
}

/// A file-to-file denoising job.
#[derive(Debug, Clone)]
pub struct DenoiseRequest {
    pub input: PathBuf,
    pub mask: PathBuf,
    pub output: PathBuf,
    pub config: DenoisingConfig,
    /// If set, the fitted component model is saved here with bincode.
    pub model_output: Option<PathBuf>,
}

/// Reads the inputs from `store`, denoises, and writes the result.
///
/// Nothing is written unless every stage up to the output succeeds. The model,
/// when requested, is saved only once the denoised signal has been written.
pub fn run<S: VolumeStore>(store: &S, request: &DenoiseRequest) -> Result<DenoiseSummary> {
    let signal = store.read_signal(&request.input)?;
    let mask = store.read_mask(&request.mask)?;
    info!(
        "Loaded signal {:?} from {} and mask {:?} from {}",
        signal.data.dim(),
        request.input.display(),
        mask.data.dim(),
        request.mask.display()
    );

    let denoised = denoise(&signal.data, &mask.data, &request.config)?;

    let output = SignalVolume { data: denoised.signal, header: signal.header };
    store.write_signal(&output, &request.output)?;
    info!("Wrote denoised signal to {}", request.output.display());

    // Only after the signal is on disk, so a failed write leaves no model behind.
    if let Some(model_path) = &request.model_output {
        denoised.model.save_model(model_path)?;
        info!("Saved component model to {}", model_path.display());
    }
    Ok(denoised.summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::VoxelIndex;
    use ndarray::s;

    fn smooth_signal() -> Array4<f32> {
        Array4::from_shape_fn((4, 3, 2, 12), |(x, y, z, t)| {
            let base = 100.0 + 10.0 * x as f32 + 5.0 * y as f32 + 3.0 * z as f32;
            base + 20.0 * ((t as f32) * 0.5 + x as f32).sin()
        })
    }

    #[test]
    fn test_budget_defaults_follow_series_length() {
        let config = DenoisingConfig::default();
        let budget = config.budget_for(20).unwrap();
        assert_eq!(budget.min_components, 1);
        assert_eq!(budget.max_components, 7);
        assert_eq!(budget.variance, 0.95);

        let config = DenoisingConfig { min_components: Some(2), max_components: Some(4), ..Default::default() };
        let budget = config.budget_for(20).unwrap();
        assert_eq!((budget.min_components, budget.max_components), (2, 4));
    }

    #[test]
    fn test_budget_rejects_inverted_bounds() {
        let config = DenoisingConfig { min_components: Some(5), max_components: Some(3), ..Default::default() };
        assert!(matches!(config.budget_for(20), Err(DenoiseError::Configuration(_))));
    }

    #[test]
    fn test_denoise_keeps_shape_and_unmasked_voxels() {
        let signal = smooth_signal();
        let mut mask = Array3::from_elem((4, 3, 2), true);
        mask[[0, 0, 0]] = false;
        mask[[3, 2, 1]] = false;

        let result = denoise(&signal, &mask, &DenoisingConfig::default()).unwrap();
        assert_eq!(result.signal.dim(), signal.dim());
        for &(x, y, z) in &[(0, 0, 0), (3, 2, 1)] {
            for t in 0..12 {
                assert_eq!(result.signal[[x, y, z, t]].to_bits(), signal[[x, y, z, t]].to_bits());
            }
        }
        assert_eq!(result.summary.masked_voxels, 22);
        assert_eq!(result.summary.rows_used, 22);
        let (lo, hi) = result.summary.budget.component_range(12);
        assert!(result.summary.components_used >= lo && result.summary.components_used <= hi);
    }

    #[test]
    fn test_denoise_leaves_degenerate_voxels_untouched() {
        let mut signal = smooth_signal();
        signal.slice_mut(s![1, 1, 1, ..]).fill(0.0);
        let mask = Array3::from_elem((4, 3, 2), true);

        let result = denoise(&signal, &mask, &DenoisingConfig::default()).unwrap();
        assert!(!result.refined_mask[[1, 1, 1]]);
        assert_eq!(result.summary.rows_used, 23);
        assert!(result.signal.slice(s![1, 1, 1, ..]).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_denoised_rows_respect_floor() {
        let mut signal = smooth_signal();
        // One voxel dips negative so reconstruction is likely to as well.
        signal.slice_mut(s![2, 0, 0, ..]).mapv_inplace(|v| v - 150.0);
        let mask = Array3::from_elem((4, 3, 2), true);

        let result = denoise(&signal, &mask, &DenoisingConfig::default()).unwrap();
        for z in 0..2 {
            for y in 0..3 {
                for x in 0..4 {
                    let min = result.signal.slice(s![x, y, z, ..]).iter().copied().fold(f32::INFINITY, f32::min);
                    assert!(min > 0.0, "voxel {:?} has minimum {}", VoxelIndex(x, y, z), min);
                }
            }
        }
        assert!(result.summary.corrected_rows >= 1);
    }

    #[test]
    fn test_empty_mask_is_configuration_error() {
        let signal = smooth_signal();
        let mask = Array3::from_elem((4, 3, 2), false);
        let err = denoise(&signal, &mask, &DenoisingConfig::default()).unwrap_err();
        assert!(matches!(err, DenoiseError::Configuration(_)));
    }

    #[test]
    fn test_mask_mismatch_is_configuration_error() {
        let signal = smooth_signal();
        let mask = Array3::from_elem((4, 3, 3), true);
        let err = denoise(&signal, &mask, &DenoisingConfig::default()).unwrap_err();
        assert!(matches!(err, DenoiseError::Configuration(_)));
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = DenoisingConfig {
            variance: 0.8,
            min_components: Some(2),
            max_components: None,
            floor_policy: FloorPolicy::BelowUnity,
            degeneracy: DegeneracyRule { zero_tolerance: 0.0, min_nonzero_fraction: 0.1 },
        };
        let bytes = bincode::serde::encode_to_vec(&config, bincode::config::standard()).unwrap();
        let (decoded, _): (DenoisingConfig, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, config);
    }
}
