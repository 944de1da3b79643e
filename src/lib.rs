// Global PCA denoising of masked 4-D image series

#![doc = include_str!("../README.md")]

pub mod correct;
pub mod error;
pub mod extract;
pub mod linalg_backends;
pub mod pca;
pub mod pipeline;
pub mod scatter;
pub mod volume_io;

pub use correct::{correct_rows, FloorPolicy};
pub use error::{DenoiseError, Result};
pub use extract::{extract, DegeneracyRule, MaskedDataset, VoxelIndex};
pub use pca::{components_for_variance, filter, fit, ComponentBudget, PcaModel, PcaReconstruction};
pub use pipeline::{denoise, run, DenoiseRequest, DenoiseSummary, DenoisedVolume, DenoisingConfig};
pub use scatter::scatter_back;
pub use volume_io::{MaskVolume, NiftiStore, SignalVolume, VolumeStore};
