//! Synthetic exposures and pull statistics for checking extraction errors.

use crate::config::SimulationConfig;
use crate::extraction::{Extraction, ExtractionDetails};
use crate::operator::OperatorError;
use crate::psf::GaussianPsf;
use crate::region::{PixelBounds, SpectralRange};
use ndarray::{Array1, Array2, ArrayView2};
use rand::Rng;
use rand_distr::StandardNormal;

/// A full-detector image with known input flux.
#[derive(Debug, Clone)]
pub struct Exposure {
    pub spectra: SpectralRange,
    pub wavelengths: Array1<f64>,
    /// Input flux, shape `(nspec, nwave)`.
    pub truth: Array2<f64>,
    /// Noise-free projection of `truth`.
    pub noiseless: Array2<f64>,
    pub image: Array2<f64>,
    pub ivar: Array2<f64>,
}

/// Draws flux uniformly in `[flux_min, flux_max)`, projects it and adds Gaussian
/// noise of variance `1 + signal`, i.e. unit read noise plus Poisson-like shot noise.
pub fn simulate_exposure<R: Rng + ?Sized>(
    psf: &GaussianPsf,
    config: &SimulationConfig,
    rng: &mut R,
) -> Result<Exposure, OperatorError> {
    let spectra = SpectralRange::new(0, config.nspec);
    let wavelengths = psf.wavelength_grid(0, config.wave_row_start..config.wave_row_end)?;
    let nwave = wavelengths.len();

    let truth = Array2::from_shape_fn((spectra.nspec(), nwave), |_| {
        rng.gen_range(config.flux_min..config.flux_max)
    });
    let noiseless = psf.project(
        wavelengths.view(),
        truth.view(),
        spectra.specmin,
        psf.detector_bounds(),
    )?;

    let var = noiseless.mapv(|v| 1.0 + v);
    let image = Array2::from_shape_fn(noiseless.dim(), |idx| {
        let z: f64 = rng.sample(StandardNormal);
        noiseless[idx] + z * var[idx].sqrt()
    });
    let ivar = var.mapv(f64::recip);

    Ok(Exposure {
        spectra,
        wavelengths,
        truth,
        noiseless,
        image,
        ivar,
    })
}

/// Mean and standard deviation of a set of normalized residuals. A well
/// calibrated error estimate gives `mean ~ 0` and `std ~ 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PullStats {
    pub mean: f64,
    pub std: f64,
    pub count: usize,
}

impl PullStats {
    /// Non-finite values are skipped.
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Self {
        let values: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        let count = values.len();
        if count == 0 {
            return Self {
                mean: 0.0,
                std: 0.0,
                count,
            };
        }
        let n = count as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            std: var.sqrt(),
            count,
        }
    }
}

/// `(flux - R truth) * sqrt(ivar)` over bins with non-zero inverse variance.
pub fn flux_pulls(
    extraction: &Extraction,
    truth: ArrayView2<f64>,
) -> Result<PullStats, OperatorError> {
    let flat: Array1<f64> = truth.iter().copied().collect();
    if flat.len() != extraction.flux.len() {
        return Err(OperatorError::LengthMismatch {
            expected: extraction.flux.len(),
            found: flat.len(),
        });
    }
    let smoothed = extraction.resolution.convolve(flat.view());
    let pulls = extraction
        .flux
        .iter()
        .zip(extraction.ivar.iter())
        .zip(smoothed.iter())
        .filter(|((_, ivar), _)| **ivar > 0.0)
        .map(|((flux, ivar), rtruth)| (flux - rtruth) * ivar.sqrt());
    Ok(PullStats::from_values(pulls))
}

/// `(A xflux - pix) * sqrt(pix_ivar)` over the unmasked pixels of `bounds`.
///
/// `image` and `ivar` are full-detector arrays; `bounds` selects the window the
/// operator in `details` was built for.
pub fn image_pulls(
    details: &ExtractionDetails,
    bounds: PixelBounds,
    image: ArrayView2<f64>,
    ivar: ArrayView2<f64>,
) -> Result<PullStats, OperatorError> {
    let (Some(image), Some(ivar)) = (bounds.crop(&image), bounds.crop(&ivar)) else {
        return Err(OperatorError::LengthMismatch {
            expected: bounds.npix(),
            found: image.len(),
        });
    };
    let raw: Array1<f64> = details.raw_flux.iter().copied().collect();
    let model = details.operator.matrix_vector_multiply(raw.view())?;
    if model.len() != image.len() {
        return Err(OperatorError::LengthMismatch {
            expected: model.len(),
            found: image.len(),
        });
    }
    let pulls = model
        .iter()
        .zip(image.iter())
        .zip(ivar.iter())
        .filter(|(_, w)| **w > 0.0)
        .map(|((m, pix), w)| (m - pix) * w.sqrt());
    Ok(PullStats::from_values(pulls))
}
