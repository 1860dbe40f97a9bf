use ndarray::{ArrayView2, s};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open window `[xmin, xmax) x [ymin, ymax)` of detector pixels.
///
/// Images covering a window are indexed `[y, x]` and flattened row-major, so
/// pixel `(x, y)` lands in row `(y - ymin) * nx + (x - xmin)` of a forward operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelBounds {
    pub xmin: usize,
    pub xmax: usize,
    pub ymin: usize,
    pub ymax: usize,
}

impl PixelBounds {
    pub fn new(xmin: usize, xmax: usize, ymin: usize, ymax: usize) -> Self {
        Self {
            xmin,
            xmax: xmax.max(xmin),
            ymin,
            ymax: ymax.max(ymin),
        }
    }

    /// The zero-area window, used when nothing lands on the detector.
    pub fn empty() -> Self {
        Self::new(0, 0, 0, 0)
    }

    pub fn nx(&self) -> usize {
        self.xmax - self.xmin
    }

    pub fn ny(&self) -> usize {
        self.ymax - self.ymin
    }

    pub fn npix(&self) -> usize {
        self.nx() * self.ny()
    }

    /// Shape of an image covering this window, as `(ny, nx)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.ny(), self.nx())
    }

    pub fn is_empty(&self) -> bool {
        self.npix() == 0
    }

    pub fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.xmin && x < self.xmax && y >= self.ymin && y < self.ymax
    }

    /// Flattened row index of detector pixel `(x, y)`, if it lies inside the window.
    pub fn flat_index(&self, x: usize, y: usize) -> Option<usize> {
        self.contains(x, y)
            .then(|| (y - self.ymin) * self.nx() + (x - self.xmin))
    }

    /// Grows the window by `margin` pixels on every side, clipped to `limit`.
    pub fn expanded(&self, margin: usize, limit: &PixelBounds) -> Self {
        Self::new(
            self.xmin.saturating_sub(margin).max(limit.xmin),
            (self.xmax + margin).min(limit.xmax),
            self.ymin.saturating_sub(margin).max(limit.ymin),
            (self.ymax + margin).min(limit.ymax),
        )
    }

    /// Cuts this window out of an image whose pixel `[0, 0]` is detector pixel `(0, 0)`.
    pub fn crop<'a>(&self, image: &ArrayView2<'a, f64>) -> Option<ArrayView2<'a, f64>> {
        let (rows, cols) = image.dim();
        if self.ymax > rows || self.xmax > cols {
            return None;
        }
        Some(
            image
                .clone()
                .slice_move(s![self.ymin..self.ymax, self.xmin..self.xmax]),
        )
    }
}

impl fmt::Display for PixelBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x[{}..{}) y[{}..{})",
            self.xmin, self.xmax, self.ymin, self.ymax
        )
    }
}

/// Half-open range of spectrum indices `[specmin, specmax)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpectralRange {
    pub specmin: usize,
    pub specmax: usize,
}

impl SpectralRange {
    pub fn new(specmin: usize, specmax: usize) -> Self {
        Self {
            specmin,
            specmax: specmax.max(specmin),
        }
    }

    pub fn nspec(&self) -> usize {
        self.specmax - self.specmin
    }

    pub fn is_empty(&self) -> bool {
        self.nspec() == 0
    }

    pub fn iter(&self) -> std::ops::Range<usize> {
        self.specmin..self.specmax
    }

    /// Splits the range into consecutive blocks holding at most `size` spectra.
    pub fn chunks(&self, size: usize) -> Vec<SpectralRange> {
        let size = size.max(1);
        (self.specmin..self.specmax)
            .step_by(size)
            .map(|start| SpectralRange::new(start, (start + size).min(self.specmax)))
            .collect()
    }
}

impl fmt::Display for SpectralRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.specmin, self.specmax)
    }
}
