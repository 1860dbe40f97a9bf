use approx::assert_abs_diff_eq;
use faer::linalg::solvers::EvdError;
use faer::sparse::Triplet;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spectroperf::config::{RunConfig, SimulationConfig};
use spectroperf::diagnostics::{DiagnosticDump, DumpError, FailureSnapshot};
use spectroperf::faer_ndarray::FaerLinalgError;
use spectroperf::operator::{ForwardOperator, OperatorError};
use spectroperf::psf::{GaussianPsf, GaussianPsfConfig};
use spectroperf::resolution::{
    FaerEigenSolver, SymmetricEigen, resolution_from_icov, symmetrize,
};
use spectroperf::simulate::{flux_pulls, image_pulls, simulate_exposure};
use spectroperf::solver::WeightedSystem;
use spectroperf::{
    ExtractionConfig, ExtractionError, Extractor, ForwardModel, PixelBounds, SpectralRange,
    extract,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Fixture {
    psf: GaussianPsf,
    spectra: SpectralRange,
    wavelengths: Array1<f64>,
    truth: Array2<f64>,
    noiseless: Array2<f64>,
    image: Array2<f64>,
    ivar: Array2<f64>,
}

/// Ten spectra sampled on the wavelengths of rows 10..60 of spectrum 0, with
/// unit read noise plus shot noise.
fn fixture() -> Fixture {
    let psf = GaussianPsf::new(GaussianPsfConfig::default());
    let config = SimulationConfig {
        flux_min: 100.0,
        ..SimulationConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(0);
    let exposure = simulate_exposure(&psf, &config, &mut rng).unwrap();
    Fixture {
        psf,
        spectra: exposure.spectra,
        wavelengths: exposure.wavelengths,
        truth: exposure.truth,
        noiseless: exposure.noiseless,
        image: exposure.image,
        ivar: exposure.ivar,
    }
}

fn flatten(values: &Array2<f64>) -> Array1<f64> {
    values.iter().copied().collect()
}

#[test]
fn noiseless_round_trip() {
    let fx = fixture();
    let ones = Array2::<f64>::ones(fx.noiseless.dim());
    let config = ExtractionConfig::default().with_full_output(true);
    let result = extract(
        fx.noiseless.view(),
        ones.view(),
        &fx.psf,
        fx.spectra,
        fx.wavelengths.view(),
        None,
        &config,
    )
    .unwrap();

    let rphot = result.resolution.convolve(flatten(&fx.truth).view());
    let max_bias = result
        .flux
        .iter()
        .zip(rphot.iter())
        .map(|(f, r)| ((f - r) / r).abs())
        .fold(0.0, f64::max);
    assert!(max_bias < 1e-9, "max relative bias {max_bias:e}");

    let details = result.details.unwrap();
    let ximg = fx
        .psf
        .project(
            fx.wavelengths.view(),
            details.raw_flux.view(),
            fx.spectra.specmin,
            result.bounds,
        )
        .unwrap();
    let noiseless_view = fx.noiseless.view();
    let expected = result.bounds.crop(&noiseless_view).unwrap();
    let max_dimg = ximg
        .iter()
        .zip(expected.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max);
    assert!(max_dimg < 1e-6, "max image residual {max_dimg:e}");
    assert!(details.regularized_bins.is_empty());
}

#[test]
fn zero_regularization_solves_the_unextended_system() {
    let fx = fixture();
    let config = ExtractionConfig::default()
        .with_regularization(0.0)
        .with_full_output(true);
    let result = extract(
        fx.image.view(),
        fx.ivar.view(),
        &fx.psf,
        fx.spectra,
        fx.wavelengths.view(),
        None,
        &config,
    )
    .unwrap();
    let details = result.details.as_ref().unwrap();
    assert!(details.regularized_bins.is_empty());

    let operator = fx
        .psf
        .forward_operator(fx.spectra, fx.wavelengths.view(), result.bounds)
        .unwrap();
    let image = fx.image.view();
    let ivar = fx.ivar.view();
    let pixels: Array1<f64> = result.bounds.crop(&image).unwrap().iter().copied().collect();
    let weights: Array1<f64> = result.bounds.crop(&ivar).unwrap().iter().copied().collect();
    let system = WeightedSystem::new(&operator, &weights, &pixels);
    let normal = system.normal_equations().unwrap();
    let xflux = normal.solve().unwrap();

    assert_eq!(flatten(&details.raw_flux), xflux);
    assert_eq!(details.icov, symmetrize(&normal.icov));
    let resolution = resolution_from_icov(&normal.icov, &FaerEigenSolver).unwrap();
    assert_eq!(result.resolution.matrix, resolution.matrix);
    assert_eq!(flatten(&result.ivar), resolution.ivar);
}

/// Pulls of a seeded exposure follow a unit normal. Image pulls are narrower by
/// the fitted degrees of freedom: `sqrt(1 - nflux / npix)`.
#[test]
fn pulls_of_simulated_exposure_are_unit_normal() {
    let psf = GaussianPsf::new(GaussianPsfConfig::default());
    let sim = SimulationConfig {
        seed: 1,
        ..SimulationConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(sim.seed);
    let exposure = simulate_exposure(&psf, &sim, &mut rng).unwrap();

    let extractor = Extractor::new(&psf, ExtractionConfig::default().with_full_output(true));
    let result = extractor
        .extract(
            exposure.image.view(),
            exposure.ivar.view(),
            exposure.spectra,
            exposure.wavelengths.view(),
            None,
        )
        .unwrap();

    let flux = flux_pulls(&result, exposure.truth.view()).unwrap();
    assert_eq!(flux.count, exposure.truth.len());
    assert!(flux.mean.abs() < 0.1, "flux pull mean {}", flux.mean);
    assert!((1.0 - flux.std).abs() < 0.05, "flux pull std {}", flux.std);

    let details = result.details.as_ref().unwrap();
    let image = image_pulls(
        details,
        result.bounds,
        exposure.image.view(),
        exposure.ivar.view(),
    )
    .unwrap();
    assert_eq!(image.count, result.bounds.npix());
    let expected_std = (1.0 - flux.count as f64 / image.count as f64).sqrt();
    assert!(image.mean.abs() < 0.05, "image pull mean {}", image.mean);
    assert!(
        (expected_std - image.std).abs() < 0.05,
        "image pull std {} (expected {expected_std})",
        image.std
    );
}

#[test]
fn small_regularization_barely_moves_supported_bins() {
    let fx = fixture();
    let plain = extract(
        fx.image.view(),
        fx.ivar.view(),
        &fx.psf,
        fx.spectra,
        fx.wavelengths.view(),
        None,
        &ExtractionConfig::default(),
    )
    .unwrap();
    let regularized = extract(
        fx.image.view(),
        fx.ivar.view(),
        &fx.psf,
        fx.spectra,
        fx.wavelengths.view(),
        None,
        &ExtractionConfig::default().with_regularization(1e-6),
    )
    .unwrap();
    for (a, b) in plain.flux.iter().zip(regularized.flux.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6 * a.abs().max(1.0));
    }
}

#[test]
fn subimage_with_explicit_bounds_is_identical() {
    let fx = fixture();
    let full = extract(
        fx.image.view(),
        fx.ivar.view(),
        &fx.psf,
        fx.spectra,
        fx.wavelengths.view(),
        None,
        &ExtractionConfig::default(),
    )
    .unwrap();

    let n = fx.wavelengths.len();
    let derived = fx
        .psf
        .pixel_bounds(fx.spectra, (fx.wavelengths[0], fx.wavelengths[n - 1]));
    assert_eq!(derived, full.bounds);
    let bounds = derived.expanded(10, &fx.psf.detector_bounds());
    assert!(bounds.npix() > derived.npix());

    let image = fx.image.view();
    let ivar = fx.ivar.view();
    let subimg = bounds.crop(&image).unwrap();
    let subivar = bounds.crop(&ivar).unwrap();
    let sub = extract(
        subimg,
        subivar,
        &fx.psf,
        fx.spectra,
        fx.wavelengths.view(),
        Some(bounds),
        &ExtractionConfig::default(),
    )
    .unwrap();

    assert_eq!(sub.bounds, bounds);
    assert_eq!(sub.flux, full.flux);
    assert_eq!(sub.ivar, full.ivar);
    assert_eq!(sub.resolution.matrix, full.resolution.matrix);
}

#[test]
fn resolution_rows_sum_to_one() {
    let fx = fixture();
    let result = extract(
        fx.image.view(),
        fx.ivar.view(),
        &fx.psf,
        fx.spectra,
        fx.wavelengths.view(),
        None,
        &ExtractionConfig::default(),
    )
    .unwrap();
    let nflux = fx.spectra.nspec() * fx.wavelengths.len();
    assert_eq!(result.resolution.matrix.dim(), (nflux, nflux));
    for row in result.resolution.matrix.axis_iter(Axis(0)) {
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-10);
    }
    assert!(result.ivar.iter().all(|&v| v > 0.0));
}

#[test]
fn wavelengths_partly_below_detector_stay_finite() {
    let psf = GaussianPsf::new(GaussianPsfConfig::default());
    let wmin = psf.config().wavelength_min;
    let ww = Array1::from_shape_fn(10, |i| wmin - 5.0 + i as f64);
    let spectra = SpectralRange::new(0, 2);
    let bounds = psf.pixel_bounds(spectra, (ww[0], ww[9]));
    assert!(!bounds.is_empty());

    let phot = Array2::<f64>::ones((2, 10));
    let img = psf.project(ww.view(), phot.view(), 0, bounds).unwrap();
    let ivar = Array2::<f64>::ones(img.dim());

    let config = ExtractionConfig::default().with_full_output(true);
    let result = extract(
        img.view(),
        ivar.view(),
        &psf,
        spectra,
        ww.view(),
        Some(bounds),
        &config,
    )
    .unwrap();
    assert!(result.flux.iter().all(|f| !f.is_nan()));
    assert!(result.ivar.iter().all(|v| !v.is_nan()));
    // The bins whose stamps are entirely off the detector were pinned.
    let details = result.details.unwrap();
    assert!(details.regularized_bins.contains(&0));
    assert!(details.regularized_bins.contains(&10));
}

#[test]
fn wavelengths_entirely_below_detector_give_zero_flux() {
    let psf = GaussianPsf::new(GaussianPsfConfig::default());
    let wmin = psf.config().wavelength_min;
    let ww = Array1::from_shape_fn(10, |i| wmin - 50.0 + i as f64);
    let image = Array2::<f64>::ones((120, 80));
    let result = extract(
        image.view(),
        image.view(),
        &psf,
        SpectralRange::new(0, 2),
        ww.view(),
        None,
        &ExtractionConfig::default(),
    )
    .unwrap();
    assert!(result.bounds.is_empty());
    assert_eq!(result.flux.dim(), (2, 10));
    assert!(result.flux.iter().all(|&f| f == 0.0));
    assert!(result.ivar.iter().all(|&v| v == 0.0));
}

/// The Gaussian model with a few flux bins that illuminate nothing.
struct DeadBins {
    psf: GaussianPsf,
    dead: Vec<usize>,
}

impl ForwardModel for DeadBins {
    fn pixel_bounds(&self, spectra: SpectralRange, wavelength_range: (f64, f64)) -> PixelBounds {
        self.psf.pixel_bounds(spectra, wavelength_range)
    }

    fn forward_operator(
        &self,
        spectra: SpectralRange,
        wavelengths: ArrayView1<f64>,
        bounds: PixelBounds,
    ) -> Result<ForwardOperator, OperatorError> {
        let csr = self
            .psf
            .forward_operator(spectra, wavelengths, bounds)?
            .to_csr()?;
        let mut triplets = Vec::new();
        for row in 0..csr.nrows {
            for k in csr.indptr[row]..csr.indptr[row + 1] {
                let col = csr.indices[k];
                if !self.dead.contains(&col) {
                    triplets.push(Triplet::new(row, col, csr.data[k]));
                }
            }
        }
        ForwardOperator::from_triplets(csr.nrows, csr.ncols, &triplets)
    }
}

#[test]
fn unsupported_bins_are_pinned_to_zero() {
    let model = DeadBins {
        psf: GaussianPsf::new(GaussianPsfConfig::default()),
        dead: vec![5, 17, 30],
    };
    let spectra = SpectralRange::new(0, 2);
    let ww = model.psf.wavelength_grid(0, 20..40).unwrap();
    let bounds = model.pixel_bounds(spectra, (ww[0], ww[19]));

    let mut rng = StdRng::seed_from_u64(17);
    let truth = Array1::from_shape_fn(40, |_| rng.gen_range(100.0..1000.0));
    let operator = model
        .forward_operator(spectra, ww.view(), bounds)
        .unwrap();
    let pixels = operator.matrix_vector_multiply(truth.view()).unwrap();
    let image = Array2::from_shape_fn(bounds.shape(), |(y, x)| pixels[y * bounds.nx() + x]);
    let ivar = Array2::<f64>::ones(image.dim());

    let config = ExtractionConfig::default()
        .with_regularization(1e-8)
        .with_full_output(true);
    let result = extract(
        image.view(),
        ivar.view(),
        &model,
        spectra,
        ww.view(),
        Some(bounds),
        &config,
    )
    .unwrap();

    let details = result.details.as_ref().unwrap();
    assert_eq!(details.regularized_bins, model.dead);

    let flux = flatten(&result.flux);
    let rphot = result.resolution.convolve(truth.view());
    for bin in 0..40 {
        if model.dead.contains(&bin) {
            assert_abs_diff_eq!(flux[bin], 0.0, epsilon = 1e-6);
            assert_abs_diff_eq!(details.raw_flux[[bin / 20, bin % 20]], 0.0, epsilon = 1e-9);
        } else {
            let bias = ((flux[bin] - rphot[bin]) / rphot[bin]).abs();
            assert!(bias < 1e-9, "bin {bin} bias {bias:e}");
        }
    }
}

struct NeverConverges;

impl SymmetricEigen for NeverConverges {
    fn symmetric_eigen(
        &self,
        _matrix: &Array2<f64>,
    ) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        Err(FaerLinalgError::SelfAdjointEigen(EvdError::NoConvergence))
    }
}

#[test]
fn failed_decomposition_is_dumped_before_returning() {
    let fx = fixture();
    let dir = tempfile::tempdir().unwrap();
    let spectra = SpectralRange::new(0, 2);
    let config = ExtractionConfig::default().with_dump_dir(dir.path());
    let extractor = Extractor::new(&fx.psf, config).with_eigen_solver(NeverConverges);

    let err = extractor
        .extract(
            fx.image.view(),
            fx.ivar.view(),
            spectra,
            fx.wavelengths.view(),
            None,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ExtractionError::Decomposition(FaerLinalgError::SelfAdjointEigen(EvdError::NoConvergence))
    ));

    let n = fx.wavelengths.len();
    let name = format!(
        "LinAlgError_0-2_{}-{}.toml",
        fx.wavelengths[0],
        fx.wavelengths[n - 1]
    );
    let path = dir.path().join(name);
    let text = std::fs::read_to_string(&path).unwrap();
    let parsed: toml::Value = toml::from_str(&text).unwrap();
    assert_eq!(parsed["specmin"].as_integer(), Some(0));
    assert_eq!(parsed["specmax"].as_integer(), Some(2));
    let icov_dim = parsed["icov"]["dim"].as_array().unwrap();
    assert_eq!(icov_dim[0].as_integer(), Some(2 * n as i64));
    assert!(!parsed["operator"]["data"].as_array().unwrap().is_empty());
}

struct BrokenDump {
    calls: AtomicUsize,
}

impl DiagnosticDump for BrokenDump {
    fn dump(&self, _snapshot: &FailureSnapshot<'_>) -> Result<PathBuf, DumpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DumpError::Io(std::io::Error::other("disk full")))
    }
}

#[test]
fn dump_failure_does_not_mask_decomposition_error() {
    let fx = fixture();
    let dump = BrokenDump {
        calls: AtomicUsize::new(0),
    };
    let extractor = Extractor::new(&fx.psf, ExtractionConfig::default())
        .with_eigen_solver(NeverConverges)
        .with_dump(&dump);
    let err = extractor
        .extract(
            fx.image.view(),
            fx.ivar.view(),
            SpectralRange::new(3, 5),
            fx.wavelengths.view(),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, ExtractionError::Decomposition(_)));
    assert_eq!(dump.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn chunked_extraction_matches_blockwise_calls() {
    let fx = fixture();
    let extractor = Extractor::new(&fx.psf, ExtractionConfig::default());
    let chunks = extractor
        .extract_chunks(
            fx.image.view(),
            fx.ivar.view(),
            fx.spectra,
            fx.wavelengths.view(),
            4,
        )
        .unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[2].flux.nrows(), 2);

    for (block, chunk) in fx.spectra.chunks(4).into_iter().zip(chunks.iter()) {
        let single = extractor
            .extract(
                fx.image.view(),
                fx.ivar.view(),
                block,
                fx.wavelengths.view(),
                None,
            )
            .unwrap();
        for (a, b) in single.flux.iter().zip(chunk.flux.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-9 * a.abs().max(1.0));
        }
        assert_eq!(single.bounds, chunk.bounds);
    }
}

#[test]
fn mismatched_inputs_are_rejected() {
    let fx = fixture();
    let extractor = Extractor::new(&fx.psf, ExtractionConfig::default());
    let ww = fx.wavelengths.view();

    let short_ivar = Array2::<f64>::ones((10, 10));
    assert!(matches!(
        extractor.extract(fx.image.view(), short_ivar.view(), fx.spectra, ww, None),
        Err(ExtractionError::ShapeMismatch { .. })
    ));

    let bounds = PixelBounds::new(0, 20, 0, 30);
    assert!(matches!(
        extractor.extract(fx.image.view(), fx.ivar.view(), fx.spectra, ww, Some(bounds)),
        Err(ExtractionError::CutoutMismatch { .. })
    ));

    let small = Array2::<f64>::ones((30, 30));
    assert!(matches!(
        extractor.extract(small.view(), small.view(), fx.spectra, ww, None),
        Err(ExtractionError::BoundsOutsideImage { .. })
    ));

    assert!(matches!(
        extractor.extract(
            fx.image.view(),
            fx.ivar.view(),
            SpectralRange::new(8, 12),
            ww,
            Some(fx.psf.detector_bounds())
        ),
        Err(ExtractionError::Operator(OperatorError::SpectrumOutOfRange { .. }))
    ));
}

/// Claims one pixel fewer than the window holds.
struct Misshapen(GaussianPsf);

impl ForwardModel for Misshapen {
    fn pixel_bounds(&self, spectra: SpectralRange, wavelength_range: (f64, f64)) -> PixelBounds {
        self.0.pixel_bounds(spectra, wavelength_range)
    }

    fn forward_operator(
        &self,
        spectra: SpectralRange,
        wavelengths: ArrayView1<f64>,
        bounds: PixelBounds,
    ) -> Result<ForwardOperator, OperatorError> {
        ForwardOperator::from_triplets(
            bounds.npix() - 1,
            spectra.nspec() * wavelengths.len(),
            &[],
        )
    }
}

#[test]
fn operator_of_wrong_shape_is_rejected() {
    let fx = fixture();
    let model = Misshapen(fx.psf.clone());
    let err = extract(
        fx.image.view(),
        fx.ivar.view(),
        &model,
        SpectralRange::new(0, 1),
        fx.wavelengths.view(),
        None,
        &ExtractionConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, ExtractionError::OperatorShape { .. }));
}

#[test]
fn run_config_round_trips_through_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.toml");
    let mut config = RunConfig::default();
    config.psf.sigma_y = 1.1;
    config.extraction = ExtractionConfig::default()
        .with_regularization(0.25)
        .with_dump_dir(dir.path().join("dumps"));
    config.simulation.seed = 99;

    config.save(&path).unwrap();
    let loaded = RunConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
}
