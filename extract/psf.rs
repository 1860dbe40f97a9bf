//! Analytic spectrograph model: straight vertical traces with a pixel-sampled
//! elliptical Gaussian point spread function.
//!
//! Trace `i` sits at `x = first_trace_x + i * trace_spacing`. Wavelength increases
//! linearly with detector row, and every trace is offset by `i * trace_shift_y` rows
//! so that neighbouring spectra do not sample wavelength identically. Pixel `(x, y)`
//! covers `[x - 0.5, x + 0.5) x [y - 0.5, y + 0.5)`; the PSF is evaluated at pixel
//! centers over a square stamp and normalized over the whole stamp before any
//! clipping to the detector or to the requested window. A pixel's response therefore
//! depends only on its global coordinates, and projections into overlapping windows
//! agree exactly.

use crate::model::ForwardModel;
use crate::operator::{ForwardOperator, OperatorError};
use crate::region::{PixelBounds, SpectralRange};
use faer::sparse::Triplet;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaussianPsfConfig {
    pub npix_x: usize,
    pub npix_y: usize,
    pub nspec: usize,
    pub first_trace_x: f64,
    pub trace_spacing: f64,
    /// Wavelength at row 0 of spectrum 0.
    pub wavelength_min: f64,
    /// Wavelength step per detector row.
    pub dispersion: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    /// Half-width of the square stamp, in pixels.
    pub stamp_radius: usize,
    /// Row offset between consecutive traces.
    pub trace_shift_y: f64,
}

impl Default for GaussianPsfConfig {
    fn default() -> Self {
        Self {
            npix_x: 80,
            npix_y: 120,
            nspec: 10,
            first_trace_x: 8.0,
            trace_spacing: 7.0,
            wavelength_min: 5000.0,
            dispersion: 1.0,
            sigma_x: 1.0,
            sigma_y: 0.8,
            stamp_radius: 4,
            trace_shift_y: 0.25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GaussianPsf {
    config: GaussianPsfConfig,
}

/// Signed pixel window of one unclipped stamp.
#[derive(Debug, Clone, Copy)]
struct Stamp {
    x0: i64,
    x1: i64,
    y0: i64,
    y1: i64,
}

impl GaussianPsf {
    pub fn new(config: GaussianPsfConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GaussianPsfConfig {
        &self.config
    }

    pub fn nspec(&self) -> usize {
        self.config.nspec
    }

    /// The whole detector as a window.
    pub fn detector_bounds(&self) -> PixelBounds {
        PixelBounds::new(0, self.config.npix_x, 0, self.config.npix_y)
    }

    fn check_spectrum(&self, ispec: usize) -> Result<(), OperatorError> {
        if ispec < self.config.nspec {
            Ok(())
        } else {
            Err(OperatorError::SpectrumOutOfRange {
                ispec,
                nspec: self.config.nspec,
            })
        }
    }

    /// Wavelength that spectrum `ispec` places at (possibly fractional) row `y`.
    pub fn wavelength(&self, ispec: usize, y: f64) -> Result<f64, OperatorError> {
        self.check_spectrum(ispec)?;
        Ok(self.row_wavelength(ispec, y))
    }

    fn row_wavelength(&self, ispec: usize, y: f64) -> f64 {
        let c = &self.config;
        c.wavelength_min + (y - ispec as f64 * c.trace_shift_y) * c.dispersion
    }

    /// Wavelengths of spectrum `ispec` at the centers of detector rows `rows`.
    pub fn wavelength_grid(
        &self,
        ispec: usize,
        rows: Range<usize>,
    ) -> Result<Array1<f64>, OperatorError> {
        rows.map(|y| self.wavelength(ispec, y as f64)).collect()
    }

    /// Detector position `(x, y)` of `wavelength` in spectrum `ispec`.
    pub fn xy(&self, ispec: usize, wavelength: f64) -> Result<(f64, f64), OperatorError> {
        self.check_spectrum(ispec)?;
        let c = &self.config;
        let x = c.first_trace_x + ispec as f64 * c.trace_spacing;
        let y = (wavelength - c.wavelength_min) / c.dispersion + ispec as f64 * c.trace_shift_y;
        Ok((x, y))
    }

    /// Wavelengths that land on the detector for every spectrum.
    pub fn wavelength_range(&self) -> (f64, f64) {
        let top = self.config.npix_y.saturating_sub(1) as f64;
        (0..self.config.nspec.max(1)).fold(
            (f64::NEG_INFINITY, f64::INFINITY),
            |(lo, hi), ispec| {
                let a = self.row_wavelength(ispec, 0.0);
                let b = self.row_wavelength(ispec, top);
                (lo.max(a.min(b)), hi.min(a.max(b)))
            },
        )
    }

    fn stamp(&self, x: f64, y: f64) -> Stamp {
        let r = self.config.stamp_radius as i64;
        let cx = x.round() as i64;
        let cy = y.round() as i64;
        Stamp {
            x0: cx - r,
            x1: cx + r + 1,
            y0: cy - r,
            y1: cy + r + 1,
        }
    }

    /// Pixel values of the stamp centered on `(x, y)`, row-major over the stamp,
    /// summing to one.
    fn stamp_values(&self, x: f64, y: f64, stamp: Stamp) -> Vec<f64> {
        let c = &self.config;
        let mut values = Vec::with_capacity(((stamp.x1 - stamp.x0) * (stamp.y1 - stamp.y0)) as usize);
        for iy in stamp.y0..stamp.y1 {
            let dy = (iy as f64 - y) / c.sigma_y;
            for ix in stamp.x0..stamp.x1 {
                let dx = (ix as f64 - x) / c.sigma_x;
                values.push((-0.5 * (dx * dx + dy * dy)).exp());
            }
        }
        let total: f64 = values.iter().sum();
        if total > 0.0 {
            values.iter_mut().for_each(|v| *v /= total);
        }
        values
    }

    /// Renders `flux` (shape `(nspec_block, nwave)`, first row being spectrum
    /// `specmin`) onto an image covering `bounds`.
    pub fn project(
        &self,
        wavelengths: ArrayView1<f64>,
        flux: ArrayView2<f64>,
        specmin: usize,
        bounds: PixelBounds,
    ) -> Result<Array2<f64>, OperatorError> {
        let (nspec, nwave) = flux.dim();
        if nwave != wavelengths.len() {
            return Err(OperatorError::LengthMismatch {
                expected: wavelengths.len(),
                found: nwave,
            });
        }
        let spectra = SpectralRange::new(specmin, specmin + nspec);
        let operator = self.forward_operator(spectra, wavelengths, bounds)?;
        let flat: Array1<f64> = flux.iter().copied().collect();
        let pixels = operator.matrix_vector_multiply(flat.view())?;
        let nx = bounds.nx();
        Ok(Array2::from_shape_fn(bounds.shape(), |(y, x)| {
            pixels[y * nx + x]
        }))
    }
}

impl ForwardModel for GaussianPsf {
    fn pixel_bounds(&self, spectra: SpectralRange, wavelength_range: (f64, f64)) -> PixelBounds {
        let (wmin, wmax) = if wavelength_range.0 <= wavelength_range.1 {
            wavelength_range
        } else {
            (wavelength_range.1, wavelength_range.0)
        };
        let mut union: Option<Stamp> = None;
        for ispec in spectra.iter().filter(|&i| i < self.config.nspec) {
            for w in [wmin, wmax] {
                let Ok((x, y)) = self.xy(ispec, w) else {
                    continue;
                };
                let s = self.stamp(x, y);
                union = Some(match union {
                    None => s,
                    Some(u) => Stamp {
                        x0: u.x0.min(s.x0),
                        x1: u.x1.max(s.x1),
                        y0: u.y0.min(s.y0),
                        y1: u.y1.max(s.y1),
                    },
                });
            }
        }
        let Some(u) = union else {
            return PixelBounds::empty();
        };

        let clip = |v: i64, limit: usize| v.clamp(0, limit as i64) as usize;
        let bounds = PixelBounds::new(
            clip(u.x0, self.config.npix_x),
            clip(u.x1, self.config.npix_x),
            clip(u.y0, self.config.npix_y),
            clip(u.y1, self.config.npix_y),
        );
        if bounds.is_empty() {
            PixelBounds::empty()
        } else {
            bounds
        }
    }

    fn forward_operator(
        &self,
        spectra: SpectralRange,
        wavelengths: ArrayView1<f64>,
        bounds: PixelBounds,
    ) -> Result<ForwardOperator, OperatorError> {
        if !spectra.is_empty() {
            self.check_spectrum(spectra.specmax - 1)?;
        }
        let nwave = wavelengths.len();
        let mut triplets = Vec::new();
        for (local, ispec) in spectra.iter().enumerate() {
            for (iwave, &w) in wavelengths.iter().enumerate() {
                let col = local * nwave + iwave;
                let (x, y) = self.xy(ispec, w)?;
                let stamp = self.stamp(x, y);
                let values = self.stamp_values(x, y, stamp);
                let mut k = 0;
                for iy in stamp.y0..stamp.y1 {
                    for ix in stamp.x0..stamp.x1 {
                        let value = values[k];
                        k += 1;
                        if ix < 0 || iy < 0 {
                            continue;
                        }
                        if let Some(row) = bounds.flat_index(ix as usize, iy as usize) {
                            triplets.push(Triplet::new(row, col, value));
                        }
                    }
                }
            }
        }
        ForwardOperator::from_triplets(bounds.npix(), spectra.nspec() * nwave, &triplets)
    }
}
