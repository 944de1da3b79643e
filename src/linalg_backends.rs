// src/linalg_backends.rs

use ndarray::{Array1, Array2};
use std::marker::PhantomData;

use crate::error::ThreadSafeStdError;

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput<F: 'static> {
    /// Eigenvalues. Ordering depends on the backend; callers sort them.
    pub eigenvalues: Array1<F>,
    /// Eigenvectors as columns of the matrix.
    /// eigenvectors.column(i) corresponds to eigenvalues[i].
    pub eigenvectors: Array2<F>,
}

/// Trait for symmetric eigendecomposition (similar to LAPACK's DSYEV).
/// Implementers expect `matrix` to be square and symmetric; only the upper
/// triangle is guaranteed to be read.
pub trait BackendEigh<F: 'static + Copy + Send + Sync> {
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, ThreadSafeStdError>;
}

fn check_square<F>(matrix: &Array2<F>) -> Result<(), ThreadSafeStdError> {
    if matrix.nrows() != matrix.ncols() {
        return Err(format!(
            "Matrix must be square for eigendecomposition, got {}x{}.",
            matrix.nrows(),
            matrix.ncols()
        )
        .into());
    }
    Ok(())
}

// --- Pure-Rust backend (nalgebra) ---

/// Default backend. Runs the symmetric QR algorithm from `nalgebra`, so no
/// system LAPACK is needed.
#[derive(Debug, Default, Copy, Clone)]
pub struct NalgebraBackend;

/// Shared body of the `NalgebraBackend` impls; `eps` is the convergence tolerance.
fn nalgebra_eigh<T: nalgebra::RealField + Copy>(
    matrix: &Array2<T>,
    eps: T,
) -> Result<EighOutput<T>, ThreadSafeStdError> {
    check_square(matrix)?;
    let n = matrix.nrows();
    if n == 0 {
        return Ok(EighOutput { eigenvalues: Array1::zeros(0), eigenvectors: Array2::zeros((0, 0)) });
    }
    // Mirror the upper triangle so the lower one is never trusted.
    let symmetric = nalgebra::DMatrix::from_fn(n, n, |i, j| {
        if i <= j { matrix[[i, j]] } else { matrix[[j, i]] }
    });
    // max_niter = 0 lets the iteration run until convergence.
    let eig = nalgebra::linalg::SymmetricEigen::try_new(symmetric, eps, 0)
        .ok_or("nalgebra symmetric eigendecomposition did not converge")?;

    let eigenvalues = Array1::from_iter(eig.eigenvalues.iter().copied());
    let eigenvectors = Array2::from_shape_fn((n, n), |(i, j)| eig.eigenvectors[(i, j)]);
    Ok(EighOutput { eigenvalues, eigenvectors })
}

impl BackendEigh<f64> for NalgebraBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput<f64>, ThreadSafeStdError> {
        nalgebra_eigh(matrix, f64::EPSILON)
    }
}

impl BackendEigh<f32> for NalgebraBackend {
    fn eigh_upper(&self, matrix: &Array2<f32>) -> Result<EighOutput<f32>, ThreadSafeStdError> {
        nalgebra_eigh(matrix, f32::EPSILON)
    }
}

// --- LAPACK backend (ndarray-linalg), enabled by the backend_* features ---

#[cfg(feature = "lapack")]
mod lapack_specific_code {
    use super::{check_square, BackendEigh, EighOutput};
    use crate::error::ThreadSafeStdError;
    use ndarray::{Array1, Array2};
    use ndarray_linalg::{Eigh as NdLinalgEigh, UPLO};

    #[derive(Debug, Default, Copy, Clone)]
    pub struct NdarrayLinAlgBackend;

    // Helper to convert ndarray-linalg's error to ThreadSafeStdError
    fn to_dyn_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> ThreadSafeStdError {
        Box::new(e)
    }

    impl BackendEigh<f64> for NdarrayLinAlgBackend {
        fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput<f64>, ThreadSafeStdError> {
            check_square(matrix)?;
            if matrix.is_empty() {
                return Ok(EighOutput { eigenvalues: Array1::zeros(0), eigenvectors: Array2::zeros((0, 0)) });
            }
            let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_dyn_error)?;
            Ok(EighOutput { eigenvalues, eigenvectors })
        }
    }

    impl BackendEigh<f32> for NdarrayLinAlgBackend {
        fn eigh_upper(&self, matrix: &Array2<f32>) -> Result<EighOutput<f32>, ThreadSafeStdError> {
            check_square(matrix)?;
            if matrix.is_empty() {
                return Ok(EighOutput { eigenvalues: Array1::zeros(0), eigenvectors: Array2::zeros((0, 0)) });
            }
            let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_dyn_error)?;
            Ok(EighOutput { eigenvalues, eigenvectors })
        }
    }
}

#[cfg(feature = "lapack")]
pub use lapack_specific_code::NdarrayLinAlgBackend;

// --- Dispatch ---

/// Routes decompositions to the backend selected at compile time:
/// LAPACK through `ndarray-linalg` when one of the `backend_*` features is on,
/// `nalgebra` otherwise.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }

    /// Human-readable name of the active backend, for logs.
    pub fn name(&self) -> &'static str {
        #[cfg(feature = "lapack")]
        {
            "ndarray-linalg (LAPACK)"
        }
        #[cfg(not(feature = "lapack"))]
        {
            "nalgebra"
        }
    }
}

#[cfg(feature = "lapack")]
impl<F: 'static + Copy + Send + Sync> BackendEigh<F> for LinAlgBackendProvider<F>
where
    NdarrayLinAlgBackend: BackendEigh<F>,
{
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, ThreadSafeStdError> {
        NdarrayLinAlgBackend.eigh_upper(matrix)
    }
}

#[cfg(not(feature = "lapack"))]
impl<F: 'static + Copy + Send + Sync> BackendEigh<F> for LinAlgBackendProvider<F>
where
    NalgebraBackend: BackendEigh<F>,
{
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, ThreadSafeStdError> {
        NalgebraBackend.eigh_upper(matrix)
    }
}
