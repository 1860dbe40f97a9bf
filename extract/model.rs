use crate::operator::{ForwardOperator, OperatorError};
use crate::region::{PixelBounds, SpectralRange};
use ndarray::ArrayView1;

/// The optical model an extraction consumes: where a block of spectra lands on
/// the detector and how each flux bin spreads over those pixels.
pub trait ForwardModel {
    /// Smallest pixel window that `spectra` between `wavelength_range.0` and
    /// `wavelength_range.1` can illuminate. Requests that fall off the detector
    /// return a zero-area window rather than failing.
    fn pixel_bounds(&self, spectra: SpectralRange, wavelength_range: (f64, f64)) -> PixelBounds;

    /// Operator of shape `(bounds.npix(), spectra.nspec() * wavelengths.len())`
    /// mapping flux bins onto the pixels of `bounds`.
    fn forward_operator(
        &self,
        spectra: SpectralRange,
        wavelengths: ArrayView1<f64>,
        bounds: PixelBounds,
    ) -> Result<ForwardOperator, OperatorError>;
}
