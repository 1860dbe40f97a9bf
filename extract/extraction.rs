//! Spectroperfectionism extraction of a block of spectra from a 2D image
//! (Bolton & Schlegel 2010).
//!
//! The pipeline for one block:
//!
//! 1. Ask the [`ForwardModel`] for the pixel window and the sparse operator `A`.
//! 2. Flag flux bins with too little weighted pixel support and stack synthetic
//!    constraint rows under `A` ([`RegularizationTerm`]).
//! 3. Assemble `iCov = A^T W A`, `y = A^T W pix` and solve for the raw flux.
//! 4. Take the symmetric square root of `iCov`, normalize its rows to get the
//!    resolution matrix `R`, and report `R xflux` with inverse variance
//!    `(sum_j S[i, j])^2`.

use crate::config::ExtractionConfig;
use crate::diagnostics::{DiagnosticDump, FailureSnapshot, TomlDump};
use crate::faer_ndarray::FaerLinalgError;
use crate::model::ForwardModel;
use crate::operator::{ForwardOperator, OperatorError};
use crate::regularize::RegularizationTerm;
use crate::region::{PixelBounds, SpectralRange};
use crate::resolution::{
    FaerEigenSolver, Resolution, SymmetricEigen, resolution_from_symmetric, symmetrize,
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Image shape {image:?} does not match inverse variance shape {ivar:?}")]
    ShapeMismatch {
        image: (usize, usize),
        ivar: (usize, usize),
    },
    #[error("Cutout for {bounds} must have shape {expected:?}, found {found:?}")]
    CutoutMismatch {
        bounds: PixelBounds,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("Pixel window {bounds} extends past the {rows}x{cols} image")]
    BoundsOutsideImage {
        bounds: PixelBounds,
        rows: usize,
        cols: usize,
    },
    #[error("Regularization strength must be finite and non-negative, got {0}")]
    InvalidRegularization(f64),
    #[error("Minimum weight fraction must lie in [0, 1], got {0}")]
    InvalidWeightFraction(f64),
    #[error("Forward operator has shape {found:?}, expected {expected:?}")]
    OperatorShape {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error(transparent)]
    Operator(#[from] OperatorError),
    #[error("Inverse covariance is singular or indefinite: {0}")]
    SingularSystem(FaerLinalgError),
    #[error("Resolution matrix decomposition failed: {0}")]
    Decomposition(FaerLinalgError),
}

/// Intermediate products kept when `full_output` is requested.
#[derive(Debug, Clone)]
pub struct ExtractionDetails {
    /// Deconvolved flux before resolution convolution, shape `(nspec, nwave)`.
    pub raw_flux: Array2<f64>,
    /// The model's operator, without regularization rows.
    pub operator: ForwardOperator,
    /// Symmetrized inverse covariance of the raw flux.
    pub icov: Array2<f64>,
    /// Flux bins constrained toward zero for lack of pixel support.
    pub regularized_bins: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    /// `R xflux`, shape `(nspec, nwave)`.
    pub flux: Array2<f64>,
    /// Inverse variance of `flux`, shape `(nspec, nwave)`.
    pub ivar: Array2<f64>,
    pub resolution: Resolution,
    /// Pixel window the extraction used.
    pub bounds: PixelBounds,
    pub details: Option<ExtractionDetails>,
}

/// Extracts spectral blocks against one forward model.
///
/// The eigensolver behind the resolution matrix is pluggable. The inputs of any
/// block whose decomposition fails go to the [`DiagnosticDump`] given with
/// [`Extractor::with_dump`], or else to a [`TomlDump`] in `config.dump_dir`.
pub struct Extractor<'a, M: ?Sized, E = FaerEigenSolver> {
    model: &'a M,
    config: ExtractionConfig,
    eigen: E,
    dump: Option<&'a dyn DiagnosticDump>,
}

impl<'a, M: ForwardModel + ?Sized> Extractor<'a, M> {
    pub fn new(model: &'a M, config: ExtractionConfig) -> Self {
        Self {
            model,
            config,
            eigen: FaerEigenSolver,
            dump: None,
        }
    }
}

impl<'a, M: ForwardModel + ?Sized, E: SymmetricEigen> Extractor<'a, M, E> {
    pub fn with_eigen_solver<E2: SymmetricEigen>(self, eigen: E2) -> Extractor<'a, M, E2> {
        Extractor {
            model: self.model,
            config: self.config,
            eigen,
            dump: self.dump,
        }
    }

    pub fn with_dump(mut self, dump: &'a dyn DiagnosticDump) -> Self {
        self.dump = Some(dump);
        self
    }

    /// Extracts `spectra` on the `wavelengths` grid.
    ///
    /// With `bounds` omitted, `image` and `ivar` are full-detector arrays and the
    /// window comes from the model using the first and last wavelength. With
    /// `bounds` given, they are already that window's cutout.
    pub fn extract(
        &self,
        image: ArrayView2<f64>,
        ivar: ArrayView2<f64>,
        spectra: SpectralRange,
        wavelengths: ArrayView1<f64>,
        bounds: Option<PixelBounds>,
    ) -> Result<Extraction, ExtractionError> {
        self.validate_config()?;
        if image.dim() != ivar.dim() {
            return Err(ExtractionError::ShapeMismatch {
                image: image.dim(),
                ivar: ivar.dim(),
            });
        }

        let nspec = spectra.nspec();
        let nwave = wavelengths.len();
        let nflux = nspec * nwave;
        let wavelength_range = wavelength_span(wavelengths);

        let (bounds, image, ivar) = match bounds {
            Some(bounds) => {
                if image.dim() != bounds.shape() {
                    return Err(ExtractionError::CutoutMismatch {
                        bounds,
                        expected: bounds.shape(),
                        found: image.dim(),
                    });
                }
                (bounds, image, ivar)
            }
            None => {
                let derived = match wavelength_range {
                    Some(range) if !spectra.is_empty() => self.model.pixel_bounds(spectra, range),
                    _ => PixelBounds::empty(),
                };
                if derived.is_empty() {
                    log::debug!("Spectra {spectra} fall off the detector; nothing to extract");
                    return self.trivial(nspec, nwave, derived, None);
                }
                let (rows, cols) = image.dim();
                match (derived.crop(&image), derived.crop(&ivar)) {
                    (Some(image), Some(ivar)) => (derived, image, ivar),
                    _ => {
                        return Err(ExtractionError::BoundsOutsideImage {
                            bounds: derived,
                            rows,
                            cols,
                        });
                    }
                }
            }
        };

        if nflux == 0 || bounds.is_empty() {
            log::debug!("Empty extraction for spectra {spectra} ({nwave} wavelengths, {bounds})");
            return self.trivial(nspec, nwave, bounds, None);
        }

        let operator = self.model.forward_operator(spectra, wavelengths, bounds)?;
        let expected = (bounds.npix(), nflux);
        let found = (operator.nrows(), operator.ncols());
        if found != expected {
            return Err(ExtractionError::OperatorShape { expected, found });
        }

        let pixels: Array1<f64> = image.iter().copied().collect();
        let weights: Array1<f64> = ivar
            .iter()
            .zip(pixels.iter())
            .map(|(&w, &pix)| pixel_weight(w, pix))
            .collect();

        let term = RegularizationTerm::compute(
            &operator,
            weights.view(),
            self.config.regularization,
            self.config.min_weight_fraction,
        )?;
        if term.max_weight <= 0.0 {
            log::warn!(
                "No unmasked pixel constrains spectra {spectra} in {bounds}; returning zero flux"
            );
            return self.trivial(nspec, nwave, bounds, Some(operator));
        }

        let system = term.apply(&operator, &weights, &pixels)?;
        let normal = system.normal_equations()?;
        let xflux = normal.solve()?;
        let icov = symmetrize(&normal.icov);

        let resolution = match resolution_from_symmetric(&icov, &self.eigen) {
            Ok(resolution) => resolution,
            Err(err) => {
                log::error!(
                    "Resolution decomposition failed for spectra {spectra} in {bounds}: {err}"
                );
                self.report_failure(&FailureSnapshot {
                    spectra,
                    wavelength_range: wavelength_range.unwrap_or((f64::NAN, f64::NAN)),
                    bounds,
                    image: image.view(),
                    ivar: ivar.view(),
                    operator: &operator,
                    icov: &icov,
                });
                return Err(ExtractionError::Decomposition(err));
            }
        };

        let flux = resolution.convolve(xflux.view());
        let extraction = Extraction {
            flux: to_grid(&flux, nspec, nwave),
            ivar: to_grid(&resolution.ivar, nspec, nwave),
            resolution,
            bounds,
            details: self.config.full_output.then(|| ExtractionDetails {
                raw_flux: to_grid(&xflux, nspec, nwave),
                operator,
                icov,
                regularized_bins: term.flagged,
            }),
        };
        log::debug!(
            "Extracted spectra {spectra} x {nwave} wavelengths from {bounds} ({} pixels)",
            bounds.npix()
        );
        Ok(extraction)
    }

    fn validate_config(&self) -> Result<(), ExtractionError> {
        let strength = self.config.regularization;
        if !strength.is_finite() || strength < 0.0 {
            return Err(ExtractionError::InvalidRegularization(strength));
        }
        let fraction = self.config.min_weight_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ExtractionError::InvalidWeightFraction(fraction));
        }
        Ok(())
    }

    /// All-zero flux and inverse variance with an identity resolution matrix.
    fn trivial(
        &self,
        nspec: usize,
        nwave: usize,
        bounds: PixelBounds,
        operator: Option<ForwardOperator>,
    ) -> Result<Extraction, ExtractionError> {
        let nflux = nspec * nwave;
        let details = if self.config.full_output {
            let operator = match operator {
                Some(operator) => operator,
                None => ForwardOperator::from_triplets(bounds.npix(), nflux, &[])?,
            };
            Some(ExtractionDetails {
                raw_flux: Array2::zeros((nspec, nwave)),
                operator,
                icov: Array2::zeros((nflux, nflux)),
                regularized_bins: Vec::new(),
            })
        } else {
            None
        };
        Ok(Extraction {
            flux: Array2::zeros((nspec, nwave)),
            ivar: Array2::zeros((nspec, nwave)),
            resolution: Resolution::identity(nflux),
            bounds,
            details,
        })
    }

    fn report_failure(&self, snapshot: &FailureSnapshot<'_>) {
        let written = match self.dump {
            Some(dump) => dump.dump(snapshot),
            None => TomlDump::new(&self.config.dump_dir).dump(snapshot),
        };
        match written {
            Ok(path) => log::error!("Dumped {} for debugging", path.display()),
            Err(err) => log::error!("Could not write diagnostic dump {}: {err}", snapshot.tag()),
        }
    }
}

impl<M, E> Extractor<'_, M, E>
where
    M: ForwardModel + Sync + ?Sized,
    E: SymmetricEigen + Sync,
{
    /// Extracts `spectra` in blocks of at most `chunk_size` spectra, in parallel.
    ///
    /// `image` and `ivar` cover the full detector; each block derives its own window.
    pub fn extract_chunks(
        &self,
        image: ArrayView2<f64>,
        ivar: ArrayView2<f64>,
        spectra: SpectralRange,
        wavelengths: ArrayView1<f64>,
        chunk_size: usize,
    ) -> Result<Vec<Extraction>, ExtractionError> {
        let chunks = spectra.chunks(chunk_size);
        log::info!(
            "Extracting spectra {spectra} in {} blocks of up to {} spectra",
            chunks.len(),
            chunk_size.max(1)
        );
        chunks
            .par_iter()
            .map(|&block| self.extract(image, ivar, block, wavelengths, None))
            .collect()
    }
}

/// Extracts one block with the default eigensolver, writing a [`TomlDump`] into
/// `config.dump_dir` if the resolution decomposition fails.
pub fn extract<M: ForwardModel + ?Sized>(
    image: ArrayView2<f64>,
    ivar: ArrayView2<f64>,
    model: &M,
    spectra: SpectralRange,
    wavelengths: ArrayView1<f64>,
    bounds: Option<PixelBounds>,
    config: &ExtractionConfig,
) -> Result<Extraction, ExtractionError> {
    Extractor::new(model, config.clone()).extract(image, ivar, spectra, wavelengths, bounds)
}

/// Masked (non-positive or non-finite) inverse variance and non-finite pixels
/// both contribute zero weight.
fn pixel_weight(ivar: f64, pixel: f64) -> f64 {
    if ivar.is_finite() && ivar > 0.0 && pixel.is_finite() {
        ivar
    } else {
        0.0
    }
}

fn wavelength_span(wavelengths: ArrayView1<f64>) -> Option<(f64, f64)> {
    let first = *wavelengths.first()?;
    let last = *wavelengths.last()?;
    Some((first, last))
}

fn to_grid(values: &Array1<f64>, nspec: usize, nwave: usize) -> Array2<f64> {
    Array2::from_shape_fn((nspec, nwave), |(i, j)| values[i * nwave + j])
}
