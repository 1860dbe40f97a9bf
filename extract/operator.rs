use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, Array2, ArrayView1};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("Failed to build sparse forward operator: {0}")]
    SparseCreation(String),
    #[error("Failed to obtain a row-major copy of the forward operator: {0}")]
    RowMajorConversion(String),
    #[error("Spectrum {ispec} is outside the {nspec} spectra described by the forward model")]
    SpectrumOutOfRange { ispec: usize, nspec: usize },
    #[error("Vector of length {found} does not match operator dimension {expected}")]
    LengthMismatch { expected: usize, found: usize },
}

/// Compressed sparse row form of an operator, as written to diagnostic dumps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CsrParts {
    pub nrows: usize,
    pub ncols: usize,
    pub data: Vec<f64>,
    pub indices: Vec<usize>,
    pub indptr: Vec<usize>,
}

/// Sparse map from flux bins (columns) to pixel intensities (rows).
///
/// Columns are flux bins flattened spectrum-major, `ispec * nwave + iwave`;
/// rows are pixels of a [`crate::region::PixelBounds`] window flattened row-major.
#[derive(Clone)]
pub struct ForwardOperator {
    matrix: SparseColMat<usize, f64>,
}

impl fmt::Debug for ForwardOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardOperator")
            .field("nrows", &self.nrows())
            .field("ncols", &self.ncols())
            .field("nnz", &self.nnz())
            .finish()
    }
}

impl ForwardOperator {
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: &[Triplet<usize, usize, f64>],
    ) -> Result<Self, OperatorError> {
        let matrix = SparseColMat::try_new_from_triplets(nrows, ncols, triplets)
            .map_err(|err| OperatorError::SparseCreation(format!("{err:?}")))?;
        Ok(Self { matrix })
    }

    pub fn nrows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn nnz(&self) -> usize {
        let (symbolic, _) = self.matrix.parts();
        let col_ptr = symbolic.col_ptr();
        (0..self.ncols())
            .map(|col| col_ptr[col + 1] - col_ptr[col])
            .sum()
    }

    fn check_len(&self, expected: usize, found: usize) -> Result<(), OperatorError> {
        if expected == found {
            Ok(())
        } else {
            Err(OperatorError::LengthMismatch { expected, found })
        }
    }

    /// `A x`
    pub fn matrix_vector_multiply(
        &self,
        vector: ArrayView1<f64>,
    ) -> Result<Array1<f64>, OperatorError> {
        self.check_len(self.ncols(), vector.len())?;
        let mut output = Array1::<f64>::zeros(self.nrows());
        let (symbolic, values) = self.matrix.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        for col in 0..self.ncols() {
            let x = vector[col];
            for idx in col_ptr[col]..col_ptr[col + 1] {
                output[row_idx[idx]] += values[idx] * x;
            }
        }
        Ok(output)
    }

    /// `A^T v`
    pub fn transpose_vector_multiply(
        &self,
        vector: ArrayView1<f64>,
    ) -> Result<Array1<f64>, OperatorError> {
        self.check_len(self.nrows(), vector.len())?;
        let mut output = Array1::<f64>::zeros(self.ncols());
        let (symbolic, values) = self.matrix.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        for col in 0..self.ncols() {
            let mut acc = 0.0;
            for idx in col_ptr[col]..col_ptr[col + 1] {
                acc += values[idx] * vector[row_idx[idx]];
            }
            output[col] = acc;
        }
        Ok(output)
    }

    /// Column sums of `W A` for a diagonal pixel weight `W`: the total weighted
    /// pixel support of every flux bin.
    pub fn weighted_column_sums(
        &self,
        weights: ArrayView1<f64>,
    ) -> Result<Array1<f64>, OperatorError> {
        self.transpose_vector_multiply(weights)
    }

    /// Appends one row per column holding `diagonal[col]` in that column, i.e. stacks
    /// `diag(diagonal)` underneath the operator. Zero entries are not stored.
    pub fn stack_diagonal(&self, diagonal: ArrayView1<f64>) -> Result<Self, OperatorError> {
        self.check_len(self.ncols(), diagonal.len())?;
        let nrows = self.nrows();
        let ncols = self.ncols();
        let (symbolic, values) = self.matrix.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();

        let mut triplets = Vec::with_capacity(self.nnz() + ncols);
        for col in 0..ncols {
            for idx in col_ptr[col]..col_ptr[col + 1] {
                triplets.push(Triplet::new(row_idx[idx], col, values[idx]));
            }
        }
        for (col, &value) in diagonal.iter().enumerate() {
            if value != 0.0 {
                triplets.push(Triplet::new(nrows + col, col, value));
            }
        }
        Self::from_triplets(nrows + ncols, ncols, &triplets)
    }

    /// Dense `A^T W A` and `A^T W p` for a diagonal weight `W`.
    ///
    /// Accumulation walks pixels in row order, so embedding the same operator in a
    /// larger window with extra empty rows gives bit-identical results. Rows with
    /// zero weight are skipped entirely, which keeps masked non-finite pixels out.
    pub fn weighted_normal_equations(
        &self,
        weights: ArrayView1<f64>,
        pixels: ArrayView1<f64>,
    ) -> Result<(Array2<f64>, Array1<f64>), OperatorError> {
        self.check_len(self.nrows(), weights.len())?;
        self.check_len(self.nrows(), pixels.len())?;
        let p = self.ncols();
        let csr = self
            .matrix
            .as_ref()
            .to_row_major()
            .map_err(|err| OperatorError::RowMajorConversion(format!("{err:?}")))?;
        let (symbolic, vals) = csr.parts();
        let row_ptr = symbolic.row_ptr();
        let col_idx = symbolic.col_idx();

        let mut ata = Array2::<f64>::zeros((p, p));
        let mut atp = Array1::<f64>::zeros(p);
        for i in 0..self.nrows() {
            let wi = weights[i];
            if wi == 0.0 {
                continue;
            }
            let pix = pixels[i];
            let start = row_ptr[i];
            let end = row_ptr[i + 1];
            for a_ptr in start..end {
                let a = col_idx[a_ptr];
                let xa = vals[a_ptr];
                atp[a] += wi * xa * pix;
                for b_ptr in a_ptr..end {
                    let b = col_idx[b_ptr];
                    let v = wi * xa * vals[b_ptr];
                    ata[[a, b]] += v;
                    if a != b {
                        ata[[b, a]] += v;
                    }
                }
            }
        }
        Ok((ata, atp))
    }

    pub fn to_csr(&self) -> Result<CsrParts, OperatorError> {
        let csr = self
            .matrix
            .as_ref()
            .to_row_major()
            .map_err(|err| OperatorError::RowMajorConversion(format!("{err:?}")))?;
        let (symbolic, vals) = csr.parts();
        let row_ptr = symbolic.row_ptr();
        let nrows = self.nrows();
        let start = row_ptr[0];
        let end = row_ptr[nrows];
        Ok(CsrParts {
            nrows,
            ncols: self.ncols(),
            data: vals[start..end].to_vec(),
            indices: symbolic.col_idx()[start..end].to_vec(),
            indptr: row_ptr[..=nrows].iter().map(|&ptr| ptr - start).collect(),
        })
    }
}
