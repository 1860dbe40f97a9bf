use crate::psf::GaussianPsfConfig;
use crate::regularize::DEFAULT_MIN_WEIGHT_FRACTION;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Knobs of a single extraction call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Extra diagonal regularization strength applied to every flux bin.
    pub regularization: f64,
    /// Keep the raw flux, operator and inverse covariance in the result.
    pub full_output: bool,
    /// Fraction of the best-supported bin's pixel weight below which a bin is
    /// pulled toward zero flux.
    pub min_weight_fraction: f64,
    /// Where to write a diagnostic dump when the resolution decomposition fails.
    /// Defaults to the working directory.
    pub dump_dir: PathBuf,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            regularization: 0.0,
            full_output: false,
            min_weight_fraction: DEFAULT_MIN_WEIGHT_FRACTION,
            dump_dir: PathBuf::from("."),
        }
    }
}

impl ExtractionConfig {
    pub fn with_regularization(mut self, regularization: f64) -> Self {
        self.regularization = regularization;
        self
    }

    pub fn with_full_output(mut self, full_output: bool) -> Self {
        self.full_output = full_output;
        self
    }

    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = dir.into();
        self
    }
}

/// Parameters of a simulated exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    /// Number of spectra, starting at spectrum 0.
    pub nspec: usize,
    /// Detector rows of spectrum 0 whose wavelengths form the extraction grid.
    pub wave_row_start: usize,
    pub wave_row_end: usize,
    pub flux_min: f64,
    pub flux_max: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            nspec: 10,
            wave_row_start: 10,
            wave_row_end: 60,
            flux_min: 1.0,
            flux_max: 1000.0,
        }
    }
}

/// Everything a command-line run needs, stored as one TOML document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub psf: GaussianPsfConfig,
    pub extraction: ExtractionConfig,
    pub simulation: SimulationConfig,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

impl RunConfig {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }
}
