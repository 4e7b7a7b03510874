#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;

use sieve::config::{ScreeningConfig, WarmStartStrategy};
use sieve::data::load_response_data;
use sieve::pipeline::{
    fit_reference_model, grm_fitter_for, reference_view, run_screening, write_artifacts,
};
use sieve::progress::ProgressBarObserver;
use sieve::report::{self, LOOCV_CHECKPOINT_FILE};
use sieve::simulate::{SimulationConfig, simulate, write_dataset};

#[derive(Clone, Copy, ValueEnum)]
pub enum WarmStartCli {
    MeanCentered,
    CorrelationConsistent,
}

impl From<WarmStartCli> for WarmStartStrategy {
    fn from(value: WarmStartCli) -> Self {
        match value {
            WarmStartCli::MeanCentered => WarmStartStrategy::MeanCentered,
            WarmStartCli::CorrelationConsistent => WarmStartStrategy::CorrelationConsistent,
        }
    }
}

/// Inputs and overrides shared by every command that reads survey data.
#[derive(Args)]
pub struct DataArgs {
    /// Item bank TSV with item_id, categories, dimension columns
    #[arg(value_name = "ITEMS_TSV")]
    pub items: PathBuf,

    /// Long-form response TSV with respondent_id, age, authentic, item_id, response columns
    #[arg(value_name = "RESPONSES_TSV")]
    pub responses: PathBuf,

    /// TOML run configuration; unspecified fields keep their defaults
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Minimum observed items for a respondent to be scored
    #[arg(long, value_name = "N")]
    pub min_items: Option<usize>,

    /// Worker threads for the parallel stages (default: all cores)
    #[arg(long, value_name = "N")]
    pub threads: Option<usize>,
}

impl DataArgs {
    fn screening_config(&self) -> Result<ScreeningConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => {
                println!("Loading configuration from: {}", path.display());
                ScreeningConfig::load(path)?
            }
            None => ScreeningConfig::default(),
        };
        if let Some(min_items) = self.min_items {
            config.min_items = min_items;
        }
        if let Some(threads) = self.threads {
            config.workers = Some(threads);
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args)]
pub struct ScreenArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Directory receiving every artifact of the run
    #[arg(long, value_name = "DIR", default_value = "screening")]
    pub out: PathBuf,

    /// Warm-start renormalization for leave-one-out refits
    #[arg(long, value_enum)]
    pub warm_start: Option<WarmStartCli>,

    /// Skip augmented influence fits for flagged respondents
    #[arg(long)]
    pub no_flagged_influence: bool,

    /// Do not write or resume from the leave-one-out checkpoint
    #[arg(long)]
    pub no_checkpoint: bool,
}

#[derive(Args)]
pub struct FitArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Where to save the fitted reference model
    #[arg(long, value_name = "PATH", default_value = "reference_model.toml")]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Directory receiving items.tsv and responses.tsv
    #[arg(long, value_name = "DIR", default_value = "simulated")]
    pub out: PathBuf,

    #[arg(long, default_value = "40")]
    pub reference: usize,

    #[arg(long, default_value = "10")]
    pub flagged: usize,

    #[arg(long, default_value = "10")]
    pub items: usize,

    #[arg(long, default_value = "2")]
    pub dimensions: usize,

    #[arg(long, default_value = "5")]
    pub categories: usize,

    /// Correlation between the two latent dimensions
    #[arg(long, default_value = "0.4", allow_negative_numbers = true)]
    pub correlation: f64,

    /// Probability that any single item is left unanswered
    #[arg(long, default_value = "0.0")]
    pub missing_rate: f64,

    #[arg(long, default_value = "42")]
    pub seed: u64,
}

#[derive(Parser)]
#[command(
    name = "sieve",
    about = "Leave-one-out influence screening and calibration weighting for survey responses",
    long_about = "Fits a graded response model to an authentic reference sample, scores every \
                 respondent by leave-one-out fit quality and influence, and derives quintile \
                 weights and ROC cut points that separate flagged response patterns."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full screening pipeline
    #[command(about = "Run the full screening pipeline (outputs: a directory of TSV/TOML artifacts)")]
    Screen(ScreenArgs),

    /// Fit the reference model only
    #[command(about = "Fit the reference graded response model (outputs: reference_model.toml)")]
    Fit(FitArgs),

    /// Generate a synthetic dataset
    #[command(about = "Simulate survey data (outputs: items.tsv, responses.tsv)")]
    Simulate(SimulateArgs),

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Screen(args)) => screen(args),
        Some(Commands::Fit(args)) => fit(args),
        Some(Commands::Simulate(args)) => run_simulate(args),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => {
            Cli::command().print_help().expect("print help");
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn screen(args: ScreenArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = args.data.screening_config()?;
    if let Some(strategy) = args.warm_start {
        config.warm_start.strategy = strategy.into();
    }
    if args.no_flagged_influence {
        config.influence.score_flagged = false;
    }

    println!(
        "Loading survey data from: {} and {}",
        args.data.items.display(),
        args.data.responses.display()
    );
    let data = load_response_data(&args.data.items, &args.data.responses)?;
    let reference = reference_view(&data, &config)?;
    let fitter = grm_fitter_for(&reference, &config);

    let checkpoint = if args.no_checkpoint {
        None
    } else {
        Some(report::artifact_path(&args.out, LOOCV_CHECKPOINT_FILE)?)
    };
    if let Some(path) = &checkpoint {
        println!("Leave-one-out checkpoint: {}", path.display());
    }

    let mut progress = ProgressBarObserver::new();
    let outcome = run_screening(
        &fitter,
        &data,
        &config,
        checkpoint.as_deref(),
        &mut progress,
    )?;
    write_artifacts(&outcome, &args.out)?;

    println!("{}", outcome.summary);
    println!("Artifacts saved to: {}", args.out.display());
    Ok(())
}

fn fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.data.screening_config()?;
    let data = load_response_data(&args.data.items, &args.data.responses)?;
    let reference = reference_view(&data, &config)?;
    let fitter = grm_fitter_for(&reference, &config);

    let fit = fit_reference_model(&fitter, &reference)?;
    fit.save(&args.output)?;
    println!(
        "Reference model ({} respondents, {} parameters) saved to: {}",
        fit.respondent_ids.len(),
        fit.layout().len(),
        args.output.display()
    );
    Ok(())
}

fn run_simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SimulationConfig {
        reference_count: args.reference,
        flagged_count: args.flagged,
        item_count: args.items,
        dimensions: args.dimensions,
        categories: args.categories,
        latent_correlation: args.correlation,
        missing_rate: args.missing_rate,
        seed: args.seed,
        ..SimulationConfig::default()
    };
    let data = simulate(&config)?;
    let items = report::artifact_path(&args.out, "items.tsv")?;
    let responses = report::artifact_path(&args.out, "responses.tsv")?;
    write_dataset(&data, &items, &responses)?;
    println!(
        "Simulated data written to: {} and {}",
        items.display(),
        responses.display()
    );
    Ok(())
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    if seconds < MINUTE {
        format!("{seconds} seconds ago")
    } else if seconds < HOUR {
        format!("{:.1} minutes ago", seconds as f64 / MINUTE as f64)
    } else if seconds < DAY {
        format!("{:.1} hours ago", seconds as f64 / HOUR as f64)
    } else {
        format!("{:.1} days ago", seconds as f64 / DAY as f64)
    }
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let release_tag = option_env!("SIEVE_RELEASE_TAG");
    let build_timestamp: u64 = env!("SIEVE_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("sieve {version}");
    match release_tag {
        Some(tag) => println!("Release: {tag}"),
        None => println!("Release: development build"),
    }

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}
