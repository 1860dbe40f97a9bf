//! Post-mortem dumps of extraction problems whose resolution decomposition failed.
//!
//! A dump holds everything needed to replay the failing decomposition offline: the
//! image cutout, its inverse variance, the forward operator in CSR form and the
//! symmetrized inverse covariance that was handed to the eigensolver.

use crate::operator::{CsrParts, ForwardOperator, OperatorError};
use crate::region::{PixelBounds, SpectralRange};
use ndarray::{Array2, ArrayView2};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Upper bound on `.N` suffixes tried before giving up on a unique name.
const MAX_NAME_ATTEMPTS: usize = 10_000;

#[derive(Error, Debug)]
pub enum DumpError {
    #[error("Failed to write diagnostic dump: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to serialize diagnostic dump to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Failed to convert forward operator for the dump: {0}")]
    Operator(#[from] OperatorError),
    #[error("No unused dump file name left for '{0}'")]
    NamesExhausted(String),
}

/// The inputs of one failed extraction, borrowed from the extractor.
#[derive(Debug, Clone, Copy)]
pub struct FailureSnapshot<'a> {
    pub spectra: SpectralRange,
    pub wavelength_range: (f64, f64),
    pub bounds: PixelBounds,
    pub image: ArrayView2<'a, f64>,
    pub ivar: ArrayView2<'a, f64>,
    pub operator: &'a ForwardOperator,
    /// Symmetrized inverse covariance.
    pub icov: &'a Array2<f64>,
}

impl FailureSnapshot<'_> {
    /// `LinAlgError_{specmin}-{specmax}_{wmin}-{wmax}`
    pub fn tag(&self) -> String {
        format!(
            "LinAlgError_{}-{}_{}-{}",
            self.spectra.specmin,
            self.spectra.specmax,
            self.wavelength_range.0,
            self.wavelength_range.1
        )
    }
}

/// Persists a [`FailureSnapshot`] somewhere a person can find it.
pub trait DiagnosticDump: Send + Sync {
    /// Returns where the snapshot was written.
    fn dump(&self, snapshot: &FailureSnapshot<'_>) -> Result<PathBuf, DumpError>;
}

/// Writes each snapshot as a TOML document into a directory, never overwriting an
/// earlier dump.
#[derive(Debug, Clone)]
pub struct TomlDump {
    dir: PathBuf,
}

#[derive(Serialize)]
struct DumpRecord<'a> {
    specmin: usize,
    specmax: usize,
    wavemin: f64,
    wavemax: f64,
    bounds: PixelBounds,
    operator: CsrParts,
    image: ArrayView2<'a, f64>,
    ivar: ArrayView2<'a, f64>,
    icov: &'a Array2<f64>,
}

impl TomlDump {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Creates `{tag}.toml`, or `{tag}.1.toml`, `{tag}.2.toml`, ... when taken.
    fn create_unique(&self, tag: &str) -> Result<(PathBuf, File), DumpError> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{tag}.toml")
            } else {
                format!("{tag}.{attempt}.toml")
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(DumpError::NamesExhausted(tag.to_string()))
    }
}

impl DiagnosticDump for TomlDump {
    fn dump(&self, snapshot: &FailureSnapshot<'_>) -> Result<PathBuf, DumpError> {
        let record = DumpRecord {
            specmin: snapshot.spectra.specmin,
            specmax: snapshot.spectra.specmax,
            wavemin: snapshot.wavelength_range.0,
            wavemax: snapshot.wavelength_range.1,
            bounds: snapshot.bounds,
            operator: snapshot.operator.to_csr()?,
            image: snapshot.image,
            ivar: snapshot.ivar,
            icov: snapshot.icov,
        };
        let toml_string = toml::to_string(&record)?;

        fs::create_dir_all(&self.dir)?;
        let (path, file) = self.create_unique(&snapshot.tag())?;
        let mut writer = BufWriter::new(file);
        writer.write_all(toml_string.as_bytes())?;
        writer.flush()?;
        Ok(path)
    }
}
