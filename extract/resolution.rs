//! Resolution matrix in the Bolton & Schlegel (2010) sense: the row-normalized
//! symmetric square root of the inverse covariance.
//!
//! Convolving the raw deconvolved flux with `R` gives a flux estimate whose errors
//! are uncorrelated between bins, at the cost of a known, per-bin smoothing kernel.

use crate::faer_ndarray::{FaerEigh, FaerLinalgError};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Dense symmetric eigendecomposition, as used for the matrix square root.
pub trait SymmetricEigen {
    /// Eigenvalues and matching column eigenvectors of a symmetric `matrix`.
    fn symmetric_eigen(
        &self,
        matrix: &Array2<f64>,
    ) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FaerEigenSolver;

impl SymmetricEigen for FaerEigenSolver {
    fn symmetric_eigen(
        &self,
        matrix: &Array2<f64>,
    ) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        matrix.eigh(Side::Lower)
    }
}

/// `0.5 * (m + m^T)`
pub fn symmetrize(matrix: &Array2<f64>) -> Array2<f64> {
    Array2::from_shape_fn(matrix.dim(), |(i, j)| 0.5 * (matrix[[i, j]] + matrix[[j, i]]))
}

/// Symmetric `S` with `S S = matrix`, built from the eigendecomposition.
///
/// Eigenvalues below `max_eigenvalue * f64::EPSILON` carry no information, only
/// rounding noise (and can be slightly negative), so they are zeroed first.
pub fn sym_sqrt<E: SymmetricEigen + ?Sized>(
    matrix: &Array2<f64>,
    eigen: &E,
) -> Result<Array2<f64>, FaerLinalgError> {
    let (mut values, vectors) = eigen.symmetric_eigen(matrix)?;
    if values.is_empty() {
        return Ok(Array2::zeros(matrix.dim()));
    }
    let cutoff = values.iter().copied().fold(f64::NEG_INFINITY, f64::max) * f64::EPSILON;
    let mut trimmed = 0usize;
    values.mapv_inplace(|v| {
        if v < cutoff {
            trimmed += 1;
            0.0
        } else {
            v
        }
    });
    if trimmed > 0 {
        log::debug!(
            "Zeroed {trimmed} of {} eigenvalues below {cutoff:.3e}",
            values.len()
        );
    }

    let roots = values.mapv(f64::sqrt);
    let scaled = &vectors * &roots.view().insert_axis(Axis(0));
    Ok(scaled.dot(&vectors.t()))
}

#[derive(Debug, Clone)]
pub struct Resolution {
    /// `R[i, j] = S[i, j] / sum_j S[i, j]`; every row sums to one.
    pub matrix: Array2<f64>,
    /// Decorrelated inverse variance, `(sum_j S[i, j])^2`.
    pub ivar: Array1<f64>,
}

impl Resolution {
    /// No smoothing and no information: the result for bins without any data.
    pub fn identity(n: usize) -> Self {
        Self {
            matrix: Array2::eye(n),
            ivar: Array1::zeros(n),
        }
    }

    pub fn convolve(&self, flux: ArrayView1<f64>) -> Array1<f64> {
        self.matrix.dot(&flux)
    }
}

/// Symmetrizes `icov` and derives the resolution matrix from it.
pub fn resolution_from_icov<E: SymmetricEigen + ?Sized>(
    icov: &Array2<f64>,
    eigen: &E,
) -> Result<Resolution, FaerLinalgError> {
    resolution_from_symmetric(&symmetrize(icov), eigen)
}

/// Like [`resolution_from_icov`] for a matrix that is already exactly symmetric.
pub fn resolution_from_symmetric<E: SymmetricEigen + ?Sized>(
    icov: &Array2<f64>,
    eigen: &E,
) -> Result<Resolution, FaerLinalgError> {
    let mut matrix = sym_sqrt(icov, eigen)?;
    let norm_vector = matrix.sum_axis(Axis(1));

    for (i, (mut row, &norm)) in matrix
        .axis_iter_mut(Axis(0))
        .zip(norm_vector.iter())
        .enumerate()
    {
        if norm != 0.0 {
            row.mapv_inplace(|v| v / norm);
        } else {
            // A bin with no information at all; report it unsmoothed with zero ivar.
            log::warn!("Resolution row {i} has zero norm; treating the bin as unconstrained");
            row.fill(0.0);
            row[i] = 1.0;
        }
    }

    // Bolton & Schlegel 2010, Eq. 13
    let ivar = norm_vector.mapv(|n| n * n);
    Ok(Resolution { matrix, ivar })
}
