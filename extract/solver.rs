use crate::extraction::ExtractionError;
use crate::faer_ndarray::FaerCholesky;
use crate::operator::{ForwardOperator, OperatorError};
use faer::Side;
use ndarray::{Array1, Array2};
use std::borrow::Cow;

/// The least-squares problem `min (pix - A x)^T W (pix - A x)` with diagonal `W`.
///
/// Borrowed as-is when no regularization rows are needed; owned when the operator
/// has been extended with synthetic constraint rows.
#[derive(Debug, Clone)]
pub struct WeightedSystem<'a> {
    pub operator: Cow<'a, ForwardOperator>,
    pub weights: Cow<'a, Array1<f64>>,
    pub pixels: Cow<'a, Array1<f64>>,
}

impl<'a> WeightedSystem<'a> {
    pub fn new(
        operator: &'a ForwardOperator,
        weights: &'a Array1<f64>,
        pixels: &'a Array1<f64>,
    ) -> Self {
        Self {
            operator: Cow::Borrowed(operator),
            weights: Cow::Borrowed(weights),
            pixels: Cow::Borrowed(pixels),
        }
    }

    /// True when synthetic rows were appended to the caller's operator.
    pub fn is_extended(&self) -> bool {
        matches!(self.operator, Cow::Owned(_))
    }

    pub fn normal_equations(&self) -> Result<NormalEquations, OperatorError> {
        let (icov, rhs) = self
            .operator
            .weighted_normal_equations(self.weights.view(), self.pixels.view())?;
        log::debug!(
            "Assembled normal equations for {} flux bins from {} rows ({} stored entries, extended: {})",
            self.operator.ncols(),
            self.operator.nrows(),
            self.operator.nnz(),
            self.is_extended()
        );
        Ok(NormalEquations { icov, rhs })
    }
}

/// `iCov = A^T W A` and `y = A^T W pix`.
#[derive(Debug, Clone)]
pub struct NormalEquations {
    pub icov: Array2<f64>,
    pub rhs: Array1<f64>,
}

impl NormalEquations {
    /// One direct Cholesky solve of `iCov x = y`. A singular or indefinite `iCov`
    /// is reported, never patched up.
    pub fn solve(&self) -> Result<Array1<f64>, ExtractionError> {
        let factor = self
            .icov
            .cholesky(Side::Lower)
            .map_err(ExtractionError::SingularSystem)?;
        Ok(factor.solve_vec(&self.rhs))
    }
}
