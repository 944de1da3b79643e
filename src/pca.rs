// Variance-bounded principal component filtering

use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Instant;

use crate::error::{DenoiseError, Result};
use crate::linalg_backends::{BackendEigh, LinAlgBackendProvider};

/// Default lower bound on the number of retained components, as a fraction of the series length.
pub const DEFAULT_MIN_COMPONENT_FRACTION: f64 = 0.05;
/// Default upper bound on the number of retained components, as a fraction of the series length.
pub const DEFAULT_MAX_COMPONENT_FRACTION: f64 = 0.3333;
/// Tighter upper bound used by callers that prefer stronger smoothing.
pub const CONSERVATIVE_MAX_COMPONENT_FRACTION: f64 = 0.25;

/// Centered variance at or below `signal_energy * ZERO_VARIANCE_RELATIVE_TOLERANCE` is
/// treated as no signal at all, where `signal_energy` is the trace of the uncentered
/// second-moment matrix. Centering residue of identical rows stays far below it at any scale.
const ZERO_VARIANCE_RELATIVE_TOLERANCE: f64 = 64.0 * f64::EPSILON;

/// How many principal components a reconstruction may keep.
///
/// The engine keeps the smallest number of leading components whose cumulative
/// explained variance reaches `variance`, clamped to
/// `[min_components, min(max_components, T)]` where `T` is the series length.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ComponentBudget {
    /// Target fraction of variance to retain, in `(0, 1]`.
    pub variance: f64,
    /// Lower bound on retained components (at least 1).
    pub min_components: usize,
    /// Upper bound on retained components. Values above `T` are capped at `T`.
    pub max_components: usize,
}

impl ComponentBudget {
    /// Creates a validated budget.
    ///
    /// # Errors
    /// Returns a configuration error if `variance` is not in `(0, 1]`,
    /// `min_components` is zero, or `min_components > max_components`.
    pub fn new(variance: f64, min_components: usize, max_components: usize) -> Result<Self> {
        let budget = Self { variance, min_components, max_components };
        budget.validate()?;
        Ok(budget)
    }

    /// Builds the default budget for a series of `series_length` samples:
    /// `min = ceil(0.05 T)` and `max = ceil(max_fraction T)`.
    ///
    /// `max_fraction` is usually [`DEFAULT_MAX_COMPONENT_FRACTION`] or
    /// [`CONSERVATIVE_MAX_COMPONENT_FRACTION`].
    pub fn for_series_length(variance: f64, series_length: usize, max_fraction: f64) -> Result<Self> {
        if series_length == 0 {
            return Err(DenoiseError::config("Series length must be greater than 0."));
        }
        let min_components = default_component_count(series_length, DEFAULT_MIN_COMPONENT_FRACTION);
        let max_components = default_component_count(series_length, max_fraction);
        Self::new(variance, min_components, max_components)
    }

    /// Checks the invariants `0 < variance <= 1` and `1 <= min <= max`.
    pub fn validate(&self) -> Result<()> {
        // Written so that NaN fails too.
        if !(self.variance > 0.0 && self.variance <= 1.0) {
            return Err(DenoiseError::config(format!(
                "Variance target must be in (0, 1], got {}.",
                self.variance
            )));
        }
        if self.min_components == 0 {
            return Err(DenoiseError::config("Minimum number of components must be at least 1."));
        }
        if self.min_components > self.max_components {
            return Err(DenoiseError::config(format!(
                "Minimum number of components ({}) exceeds maximum ({}).",
                self.min_components, self.max_components
            )));
        }
        Ok(())
    }

    /// Inclusive range of component counts allowed for a series of `series_length` samples.
    ///
    /// When `series_length <= min_components` every component is used.
    pub fn component_range(&self, series_length: usize) -> (usize, usize) {
        if series_length <= self.min_components {
            (series_length, series_length)
        } else {
            (self.min_components, self.max_components.min(series_length))
        }
    }
}

/// `ceil(fraction * series_length)`, never below 1.
fn default_component_count(series_length: usize, fraction: f64) -> usize {
    ((series_length as f64 * fraction).ceil() as usize).max(1)
}

/// Smallest `k` such that the leading `k` eigenvalues explain at least
/// `variance` of the total. This is the selection rule before any bounds apply.
///
/// `eigenvalues` must be sorted in descending order. Negative values are
/// treated as zero. If every eigenvalue is zero the answer is 0; if rounding
/// keeps the cumulative fraction below `variance`, all components are needed.
pub fn components_for_variance(eigenvalues: ArrayView1<f64>, variance: f64) -> usize {
    let total: f64 = eigenvalues.iter().map(|&v| v.max(0.0)).sum();
    if total <= 0.0 {
        return 0;
    }
    let mut cumulative = 0.0;
    for (i, &lambda) in eigenvalues.iter().enumerate() {
        cumulative += lambda.max(0.0);
        if cumulative / total >= variance {
            return i + 1;
        }
    }
    eigenvalues.len()
}

/// A fitted principal component basis.
///
/// Holds the column mean of the observations, the retained principal axes,
/// and the full eigenvalue spectrum of the covariance matrix.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PcaModel {
    /// Column mean of the observations.
    /// Shape: (series_length)
    mean: Array1<f64>,
    /// Retained principal axes as unit-length columns.
    /// Shape: (series_length, k_components)
    rotation: Array2<f64>,
    /// Eigenvalues of the covariance matrix, descending and clamped to be non-negative.
    /// Shape: (series_length)
    eigenvalues: Array1<f64>,
}

impl PcaModel {
    /// Returns the column mean of the fitted observations.
    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    /// Returns the retained principal axes, shape (series_length, k_components).
    pub fn rotation(&self) -> &Array2<f64> {
        &self.rotation
    }

    /// Returns every eigenvalue of the covariance matrix, largest first.
    pub fn eigenvalues(&self) -> &Array1<f64> {
        &self.eigenvalues
    }

    /// Number of retained components.
    pub fn n_components(&self) -> usize {
        self.rotation.ncols()
    }

    /// Length of the series the model was fitted on.
    pub fn series_length(&self) -> usize {
        self.mean.len()
    }

    /// Fraction of total variance explained by the retained components.
    /// Zero when the observations carried no variance.
    pub fn explained_variance_ratio(&self) -> f64 {
        let total = self.eigenvalues.sum();
        if self.n_components() == 0 || total <= 0.0 {
            return 0.0;
        }
        let kept: f64 = self.eigenvalues.iter().take(self.n_components()).sum();
        (kept / total).min(1.0)
    }

    /// Projects observations onto the retained axes.
    ///
    /// * `x` - Observations, shape (n_rows, series_length). Centered in place.
    ///
    /// # Errors
    /// Returns a configuration error if the series length does not match the model.
    pub fn transform(&self, mut x: Array2<f64>) -> Result<Array2<f64>> {
        self.check_series_length(x.ncols())?;
        if x.nrows() == 0 {
            return Ok(Array2::zeros((0, self.n_components())));
        }
        x -= &self.mean;
        Ok(self.project_centered(&x))
    }

    /// Rank-k reconstruction of `x`: center, project onto the retained axes,
    /// map back, and re-add the mean.
    pub fn reconstruct(&self, x: Array2<f64>) -> Result<Array2<f64>> {
        let scores = self.transform(x)?;
        Ok(self.back_project(&scores))
    }

    fn check_series_length(&self, series_length: usize) -> Result<()> {
        if series_length != self.series_length() {
            return Err(DenoiseError::config(format!(
                "Input series length ({}) does not match the model's series length ({}).",
                series_length,
                self.series_length()
            )));
        }
        Ok(())
    }

    fn project_centered(&self, centered: &Array2<f64>) -> Array2<f64> {
        if self.n_components() == 0 {
            return Array2::zeros((centered.nrows(), 0));
        }
        centered.dot(&self.rotation)
    }

    fn back_project(&self, scores: &Array2<f64>) -> Array2<f64> {
        let mut reconstructed = if self.n_components() == 0 {
            Array2::zeros((scores.nrows(), self.series_length()))
        } else {
            scores.dot(&self.rotation.t())
        };
        reconstructed += &self.mean;
        reconstructed
    }

    /// Saves the model to a file using bincode.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or serialization fails.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| DenoiseError::Io { path: path.to_path_buf(), source })?;
        let mut writer = BufWriter::new(file);

        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| DenoiseError::Model(format!("Failed to serialize PCA model: {}", e)))?;
        Ok(())
    }

    /// Loads a model previously written by [`PcaModel::save_model`].
    ///
    /// # Errors
    /// Returns an error if file I/O or deserialization fails, or if the loaded
    /// model has inconsistent dimensions or invalid eigenvalues.
    pub fn load_model<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| DenoiseError::Io { path: path.to_path_buf(), source })?;
        let mut reader = BufReader::new(file);

        let model: PcaModel = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| DenoiseError::Model(format!("Failed to deserialize PCA model: {}", e)))?;

        let series_length = model.mean.len();
        if model.rotation.nrows() != series_length || model.eigenvalues.len() != series_length {
            return Err(DenoiseError::Model(format!(
                "Loaded PCA model has inconsistent dimensions: mean={}, rotation={}x{}, eigenvalues={}",
                series_length,
                model.rotation.nrows(),
                model.rotation.ncols(),
                model.eigenvalues.len()
            )));
        }
        if model.rotation.ncols() > series_length {
            return Err(DenoiseError::Model(format!(
                "Loaded PCA model keeps {} components but the series length is only {}.",
                model.rotation.ncols(),
                series_length
            )));
        }
        // Variances cannot be negative
        if model.eigenvalues.iter().any(|&val| !val.is_finite() || val < 0.0) {
            return Err(DenoiseError::Model(
                "Loaded PCA model's eigenvalues contain non-finite or negative values.".into(),
            ));
        }
        Ok(model)
    }
}

/// Result of [`filter`].
#[derive(Debug, Clone)]
pub struct PcaReconstruction {
    /// Rank-k reconstruction with the column mean re-added.
    /// Shape: same as the input observations.
    pub denoised: Array2<f64>,
    /// Number of components used for the reconstruction.
    pub components_used: usize,
    /// Basis the reconstruction was built from.
    pub model: PcaModel,
}

/// Denoises an observation matrix by truncated PCA reconstruction.
///
/// Rows are observations (voxels) and columns are samples of the series. The
/// columns are centered, the covariance matrix (`T x T`) is eigendecomposed,
/// and the number of leading components is chosen by [`components_for_variance`]
/// and clamped to [`ComponentBudget::component_range`]. The output is
/// `mean + C V_k V_k^T`.
///
/// If the observations carry no variance the output is the column mean
/// repeated on every row and zero components are reported.
///
/// * `observations` - Matrix of shape (n_rows, series_length). Consumed and centered in place.
/// * `budget` - Variance target and component bounds.
///
/// # Errors
/// Returns a configuration error for an invalid budget, zero rows, or zero
/// columns, and a decomposition error if the eigensolver fails.
pub fn filter(observations: Array2<f64>, budget: &ComponentBudget) -> Result<PcaReconstruction> {
    budget.validate()?;
    let start = Instant::now();
    let (model, centered) = fit_centered(observations, budget)?;

    let scores = model.project_centered(&centered);
    let denoised = model.back_project(&scores);
    let components_used = model.n_components();

    info!(
        "PCA reconstruction with {} components out of {} ({:.2}% variance explained) in {:?}",
        components_used,
        model.series_length(),
        model.explained_variance_ratio() * 100.0,
        start.elapsed()
    );
    Ok(PcaReconstruction { denoised, components_used, model })
}

/// Fits the variance-bounded basis without reconstructing.
pub fn fit(observations: Array2<f64>, budget: &ComponentBudget) -> Result<PcaModel> {
    budget.validate()?;
    fit_centered(observations, budget).map(|(model, _)| model)
}

/// Centers `data_matrix` in place and fits the model. Returns the centered matrix too.
fn fit_centered(mut data_matrix: Array2<f64>, budget: &ComponentBudget) -> Result<(PcaModel, Array2<f64>)> {
    let n_rows = data_matrix.nrows();
    let series_length = data_matrix.ncols();

    if series_length == 0 {
        return Err(DenoiseError::config("Observation matrix has zero samples per row."));
    }
    if n_rows == 0 {
        return Err(DenoiseError::config("Observation matrix has zero rows; the mask selects no usable voxels."));
    }

    let divisor = n_rows.saturating_sub(1).max(1) as f64;
    let signal_energy = data_matrix.iter().map(|v| v * v).sum::<f64>() / divisor;

    let mean_vector = data_matrix
        .mean_axis(Axis(0))
        .ok_or_else(|| DenoiseError::config("Failed to compute the column mean of the observations."))?;
    data_matrix -= &mean_vector;
    let centered = data_matrix;

    // Rows are samples, so the covariance is T x T regardless of how many voxels there are.
    let mut cov_matrix = centered.t().dot(&centered);
    cov_matrix /= divisor;
    debug!("Covariance matrix {}x{} built from {} rows", series_length, series_length, n_rows);

    let backend = LinAlgBackendProvider::<f64>::new();
    debug!("Eigendecomposition backend: {}", backend.name());
    let eig = backend
        .eigh_upper(&cov_matrix)
        .map_err(|source| DenoiseError::Decomposition { dim: series_length, source })?;

    // Sort eigenpairs by descending eigenvalue.
    let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eig.eigenvalues[b]
            .partial_cmp(&eig.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    // Clamp round-off negatives so the variance fractions stay in [0, 1].
    let sorted_eigenvalues: Array1<f64> = order.iter().map(|&i| eig.eigenvalues[i].max(0.0)).collect();

    let total_variance = sorted_eigenvalues.sum();
    let n_components = if total_variance <= signal_energy * ZERO_VARIANCE_RELATIVE_TOLERANCE {
        warn!(
            "Observations carry no variance (total {:e} against signal energy {:e}); reconstruction falls back to the column mean.",
            total_variance, signal_energy
        );
        0
    } else {
        let unclamped = components_for_variance(sorted_eigenvalues.view(), budget.variance);
        let (lo, hi) = budget.component_range(series_length);
        let chosen = unclamped.clamp(lo, hi);
        debug!(
            "Variance target {} reached with {} components; allowed range [{}, {}]; using {}",
            budget.variance, unclamped, lo, hi, chosen
        );
        chosen
    };

    let rotation = if n_components == 0 {
        Array2::zeros((series_length, 0))
    } else {
        eig.eigenvectors.select(Axis(1), &order[..n_components])
    };

    let model = PcaModel { mean: mean_vector, rotation, eigenvalues: sorted_eigenvalues };
    Ok((model, centered))
}
