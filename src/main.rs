// main.rs

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use global_pca_denoising::{run, DenoiseSummary, NiftiStore};
use log::{info, LevelFilter};
use std::time::Instant;

fn main() -> Result<()> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    let log_level = if cli_args.verbose {
        LevelFilter::Debug
    } else {
        cli_args.log_level.parse::<LevelFilter>().unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            LevelFilter::Info
        })
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting global-pca-denoising with args: {:?}", cli_args);

    if let Some(num_threads) = cli_args.threads {
        if num_threads == 0 {
            return Err(anyhow!("--threads must be at least 1."));
        }
        info!("Using {} threads for parallel operations.", num_threads);
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build_global()
            .context("Failed to configure the rayon thread pool")?;
    }

    let request = cli_args.to_request();
    if cli_args.verbose {
        println!("Input signal:   {}", request.input.display());
        println!("Mask:           {}", request.mask.display());
        println!("Output:         {}", request.output.display());
        println!("Variance:       {}", request.config.variance);
        println!("Floor policy:   {:?}", request.config.floor_policy);
    }

    let summary = run(&NiftiStore, &request).with_context(|| {
        format!(
            "Denoising {} with mask {} failed",
            request.input.display(),
            request.mask.display()
        )
    })?;

    if cli_args.verbose {
        println!("{}", run_report(&summary));
    }
    info!(
        "Finished in {:?} ({:.2}% variance explained)",
        total_time_start.elapsed(),
        summary.explained_variance_ratio * 100.0
    );
    Ok(())
}

/// Component bounds are only known once the series length has been read, so they are
/// reported from the summary rather than the request.
fn run_report(summary: &DenoiseSummary) -> String {
    format!(
        "Min components: {}\n\
         Max components: {}\n\
         Reconstruction with {} components out of {}\n\
         Rows used: {} of {} masked voxels; rows floor-corrected: {}",
        summary.budget.min_components,
        summary.budget.max_components,
        summary.components_used,
        summary.series_length,
        summary.rows_used,
        summary.masked_voxels,
        summary.corrected_rows
    )
}

mod cli {
    use clap::{Parser, ValueEnum};
    use global_pca_denoising::{DegeneracyRule, DenoiseRequest, DenoisingConfig, FloorPolicy};
    use std::path::PathBuf;

    #[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) enum FloorPolicyArg {
        NonPositive,
        BelowUnity,
        Disabled,
    }

    impl From<FloorPolicyArg> for FloorPolicy {
        fn from(arg: FloorPolicyArg) -> Self {
            match arg {
                FloorPolicyArg::NonPositive => FloorPolicy::NonPositive,
                FloorPolicyArg::BelowUnity => FloorPolicy::BelowUnity,
                FloorPolicyArg::Disabled => FloorPolicy::Disabled,
            }
        }
    }

    #[derive(Parser, Debug)]
    #[command(
        author,
        version,
        about = "Variance-bounded global PCA denoising of a masked 4-D image series.",
        long_about = None
    )]
    pub(crate) struct CliArgs {
        /// 4-D input signal (.nii or .nii.gz)
        pub(crate) input: PathBuf,

        /// 3-D mask; non-zero voxels are denoised
        pub(crate) mask: PathBuf,

        /// Fraction of variance to retain, in (0, 1]
        pub(crate) variance: f64,

        /// Output path for the denoised signal
        pub(crate) output: PathBuf,

        /// Minimum number of components [default: ceil(0.05 T)]
        #[arg(long)]
        pub(crate) min_components: Option<usize>,

        /// Maximum number of components [default: ceil(0.3333 T)]
        #[arg(long)]
        pub(crate) max_components: Option<usize>,

        #[arg(long, value_enum, default_value_t = FloorPolicyArg::NonPositive)]
        pub(crate) floor_policy: FloorPolicyArg,

        /// Samples with |value| <= this count as zero
        #[arg(long, default_value_t = DegeneracyRule::default().zero_tolerance)]
        pub(crate) zero_tolerance: f32,

        /// Voxels with fewer non-zero samples than this fraction are left untouched
        #[arg(long, default_value_t = DegeneracyRule::default().min_nonzero_fraction)]
        pub(crate) min_nonzero_fraction: f64,

        /// Save the fitted component model (bincode) here
        #[arg(long)]
        pub(crate) model_output: Option<PathBuf>,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        /// Print the configuration and component count; implies debug logging
        #[arg(short, long)]
        pub(crate) verbose: bool,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }

    impl CliArgs {
        pub(crate) fn to_request(&self) -> DenoiseRequest {
            DenoiseRequest {
                input: self.input.clone(),
                mask: self.mask.clone(),
                output: self.output.clone(),
                config: DenoisingConfig {
                    variance: self.variance,
                    min_components: self.min_components,
                    max_components: self.max_components,
                    floor_policy: self.floor_policy.into(),
                    degeneracy: DegeneracyRule {
                        zero_tolerance: self.zero_tolerance,
                        min_nonzero_fraction: self.min_nonzero_fraction,
                    },
                },
                model_output: self.model_output.clone(),
            }
        }
    }
}
