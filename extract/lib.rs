#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod diagnostics;
pub mod extraction;
pub mod faer_ndarray;
pub mod model;
pub mod operator;
pub mod psf;
pub mod region;
pub mod regularize;
pub mod resolution;
pub mod simulate;
pub mod solver;

pub use config::{ExtractionConfig, RunConfig};
pub use extraction::{Extraction, ExtractionDetails, ExtractionError, Extractor, extract};
pub use model::ForwardModel;
pub use region::{PixelBounds, SpectralRange};
pub use resolution::Resolution;
