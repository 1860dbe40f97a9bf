#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::error::Error;
use std::path::PathBuf;
use std::process;

use spectroperf::psf::GaussianPsf;
use spectroperf::simulate::{flux_pulls, image_pulls, simulate_exposure};
use spectroperf::{Extractor, ForwardModel, RunConfig, SpectralRange};

#[derive(Parser)]
#[command(
    name = "spectroperf",
    about = "2D spectroperfectionism extraction of fiber spectrograph images",
    long_about = "Extracts per-spectrum flux and resolution matrices from 2D detector images \
                 by weighted least-squares deconvolution against a forward PSF model."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate an exposure from the configured PSF and extract it
    Extract(ExtractArgs),

    /// Print the pixel window covering a block of spectra
    Bounds(BoundsArgs),

    /// Write the default run configuration as TOML
    InitConfig {
        /// Output path for the configuration file
        #[arg(value_name = "PATH")]
        output: PathBuf,
    },

    /// Show version information
    Version,
}

#[derive(Args)]
struct ExtractArgs {
    /// Run configuration (.toml); built-in defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum number of spectra per extraction block
    #[arg(long, default_value = "5")]
    chunk_size: usize,

    /// Override the regularization strength from the config
    #[arg(long)]
    regularization: Option<f64>,

    /// Override the simulation seed from the config
    #[arg(long)]
    seed: Option<u64>,

    /// Directory for diagnostic dumps of failed decompositions (default: working directory)
    #[arg(long)]
    dump_dir: Option<PathBuf>,
}

#[derive(Args)]
struct BoundsArgs {
    /// Run configuration (.toml); built-in defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    specmin: usize,

    #[arg(long)]
    specmax: usize,

    #[arg(long)]
    wmin: f64,

    #[arg(long)]
    wmax: f64,
}

fn load_config(path: Option<&PathBuf>) -> Result<RunConfig, Box<dyn Error>> {
    match path {
        Some(path) => {
            log::info!("Loading run configuration from {}", path.display());
            Ok(RunConfig::load(path)?)
        }
        None => Ok(RunConfig::default()),
    }
}

fn run_extract(args: ExtractArgs) -> Result<(), Box<dyn Error>> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(regularization) = args.regularization {
        config.extraction.regularization = regularization;
    }
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }
    if let Some(dir) = args.dump_dir {
        config.extraction.dump_dir = dir;
    }
    // Image pulls need the raw flux and operator of every block.
    config.extraction.full_output = true;

    let psf = GaussianPsf::new(config.psf.clone());
    let mut rng = StdRng::seed_from_u64(config.simulation.seed);
    let exposure = simulate_exposure(&psf, &config.simulation, &mut rng)?;
    log::info!(
        "Simulated {} spectra x {} wavelengths on a {}x{} detector",
        exposure.spectra.nspec(),
        exposure.wavelengths.len(),
        config.psf.npix_y,
        config.psf.npix_x
    );

    log::info!(
        "Diagnostic dumps go to {}",
        config.extraction.dump_dir.display()
    );
    let extractor = Extractor::new(&psf, config.extraction.clone());

    let blocks = exposure.spectra.chunks(args.chunk_size);
    let extractions = extractor.extract_chunks(
        exposure.image.view(),
        exposure.ivar.view(),
        exposure.spectra,
        exposure.wavelengths.view(),
        args.chunk_size,
    )?;

    for (block, extraction) in blocks.iter().zip(extractions.iter()) {
        let offset = block.specmin - exposure.spectra.specmin;
        let truth = exposure
            .truth
            .slice(ndarray::s![offset..offset + block.nspec(), ..]);
        let flux_stats = flux_pulls(extraction, truth)?;
        println!(
            "spectra {block}: window {}, flux pull mean {:+.3} sigma {:.3}",
            extraction.bounds, flux_stats.mean, flux_stats.std
        );
        if let Some(details) = extraction.details.as_ref() {
            let image_stats = image_pulls(
                details,
                extraction.bounds,
                exposure.image.view(),
                exposure.ivar.view(),
            )?;
            println!(
                "    image pull mean {:+.3} sigma {:.3}, {} regularized bins",
                image_stats.mean,
                image_stats.std,
                details.regularized_bins.len()
            );
        }
    }
    Ok(())
}

fn run_bounds(args: BoundsArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(args.config.as_ref())?;
    let psf = GaussianPsf::new(config.psf);
    let spectra = SpectralRange::new(args.specmin, args.specmax);
    let bounds = psf.pixel_bounds(spectra, (args.wmin, args.wmax));
    let (wmin, wmax) = psf.wavelength_range();
    println!("spectra {spectra}, wavelengths {}-{}: {bounds}", args.wmin, args.wmax);
    if bounds.is_empty() {
        println!("(off detector; PSF covers wavelengths {wmin}-{wmax})");
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Extract(args)) => run_extract(args),
        Some(Commands::Bounds(args)) => run_bounds(args),
        Some(Commands::InitConfig { output }) => RunConfig::default()
            .save(&output)
            .map(|()| println!("Wrote default configuration to {}", output.display()))
            .map_err(Into::into),
        Some(Commands::Version) => {
            println!("spectroperf {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
