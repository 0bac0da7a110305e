#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use shardfit::collective::CollectiveGroup;
use shardfit::data::{MatrixLayout, load_feature_table, load_training_table, split_into_partitions};
use shardfit::progress::FitProgressObserver;
use shardfit::{
    AccumulationPrecision, ConvergenceController, FitState, SavedModel, StoragePrecision,
    TrainingConfig,
};

#[derive(Args)]
pub struct FitArgs {
    /// Path to a CSV (or .tsv) training file with a header row
    #[arg(value_name = "TRAINING_DATA")]
    pub training_data: PathBuf,

    /// Name of the label column; every other column except the weights is a feature
    #[arg(long, default_value = "label")]
    pub label: String,

    /// Name of an optional row-weight column
    #[arg(long)]
    pub weight: Option<String>,

    /// TOML file with [regularization] and [options] tables; flags below override it
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Number of row partitions, one rank each
    #[arg(long, default_value = "1")]
    pub workers: usize,

    /// Overall regularization strength (lambda)
    #[arg(long)]
    pub reg_param: Option<f64>,

    /// L1/L2 mixing parameter in [0, 1]; 0 is ridge, 1 is Lasso
    #[arg(long)]
    pub elastic_net_param: Option<f64>,

    /// Maximum number of coordinate-descent sweeps
    #[arg(long)]
    pub max_iter: Option<usize>,

    /// Relative coefficient change at which coordinate descent stops
    #[arg(long)]
    pub tolerance: Option<f64>,

    /// Solve on the raw feature scale
    #[arg(long)]
    pub no_standardization: bool,

    /// Fit without an intercept term
    #[arg(long)]
    pub no_intercept: bool,

    /// Number of devices the ranks are spread over
    #[arg(long)]
    pub devices: Option<usize>,

    /// Store features in f32 instead of f64
    #[arg(long)]
    pub single_precision: bool,

    /// Accumulate in the storage precision instead of f64
    #[arg(long, requires = "single_precision")]
    pub working_accumulation: bool,

    /// Hand partitions over as CSR sparse matrices
    #[arg(long)]
    pub sparse: bool,

    /// Stop after this many seconds, between iterations
    #[arg(long, value_name = "SECONDS")]
    pub max_wall_time: Option<f64>,

    /// Where to write the fitted model
    #[arg(long, default_value = "model.toml")]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Model file written by `shardfit fit`
    #[arg(value_name = "MODEL")]
    pub model: PathBuf,

    /// CSV (or .tsv) file containing the model's feature columns
    #[arg(value_name = "DATA")]
    pub data: PathBuf,

    /// Where to write the predictions
    #[arg(long, default_value = "predictions.tsv")]
    pub output: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "shardfit",
    about = "Distributed OLS, ridge, Lasso and elastic-net linear regression",
    long_about = "Fits linear regression models over row-partitioned data, one rank per \
                 partition, and applies fitted models to new data."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a linear model from a training file
    #[command(about = "Fit a regularized linear model (outputs: model.toml)")]
    Fit(FitArgs),

    /// Apply a fitted model to new data
    #[command(about = "Apply a fitted model to new data (outputs: predictions.tsv)")]
    Predict(PredictArgs),

    /// Display version information
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Fit(args)) => run_fit(args),
        Some(Commands::Predict(args)) => run_predict(args),
        Some(Commands::Version) => {
            println!("shardfit {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => match Cli::command().print_help() {
            Ok(()) => {
                println!();
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn build_config(args: &FitArgs) -> Result<TrainingConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => TrainingConfig::from_toml_path(path)?,
        None => TrainingConfig::default(),
    };
    let spec = &mut config.regularization;
    if let Some(reg_param) = args.reg_param {
        spec.reg_param = reg_param;
    }
    if let Some(alpha) = args.elastic_net_param {
        spec.elastic_net_param = alpha;
    }
    if let Some(max_iter) = args.max_iter {
        spec.max_iter = max_iter;
    }
    if let Some(tolerance) = args.tolerance {
        spec.tolerance = tolerance;
    }
    if args.no_standardization {
        spec.standardization = false;
    }
    if args.no_intercept {
        spec.fit_intercept = false;
    }

    let options = &mut config.options;
    if let Some(devices) = args.devices {
        options.devices.num_devices = devices;
    }
    if args.single_precision {
        options.precision.storage = StoragePrecision::Single;
    }
    if args.working_accumulation {
        options.precision.accumulation = AccumulationPrecision::Working;
    }
    if let Some(secs) = args.max_wall_time {
        options.max_wall_time_secs = Some(secs);
    }
    Ok(config)
}

fn run_fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&args)?;
    let controller = ConvergenceController::new(&config)?;

    println!("Loading training data from: {}", args.training_data.display());
    let table = load_training_table(&args.training_data, &args.label, args.weight.as_deref())?;
    let layout = if args.sparse {
        MatrixLayout::Sparse
    } else {
        MatrixLayout::Dense
    };
    let partitions = split_into_partitions(&table, args.workers, layout)?;
    println!(
        "Fitting {} features with {} over {} partition(s)",
        table.feature_names.len(),
        controller.algorithm(),
        partitions.len()
    );

    let group = CollectiveGroup::new(partitions.len());
    let mut progress = ConsoleProgress::new(config.regularization.max_iter as u64);
    let outcome = controller.fit(partitions, &group, &mut progress);
    progress.bar.finish_and_clear();
    let outcome = outcome?;

    for warning in &outcome.warnings {
        println!("Warning: {warning}");
    }
    println!(
        "Fit {} after {} iteration(s) ({} all-reduce calls)",
        outcome.status,
        outcome.summary.iterations,
        group.stats().all_reduce_calls()
    );
    println!("Intercept: {:.6}", outcome.model.intercept());
    for (name, coefficient) in table.feature_names.iter().zip(outcome.model.coefficients()) {
        println!("  {name}: {coefficient:.6}");
    }

    let saved = SavedModel::from_outcome(
        &outcome,
        config.regularization,
        table.label_name.clone(),
        table.feature_names.clone(),
    );
    saved.save(&args.output)?;
    println!("Model saved to: {}", args.output.display());
    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", args.model.display());
    let saved = SavedModel::load(&args.model)?;
    println!("Model expects {} features", saved.feature_names.len());

    let features = load_feature_table(&args.data, &saved.feature_names)?;
    let predictions = saved.model().predict(features.view())?;
    write_predictions(&args.output, predictions.as_slice().unwrap_or(&[]))?;
    println!(
        "{} predictions saved to: {}",
        predictions.len(),
        args.output.display()
    );
    Ok(())
}

fn write_predictions(path: &Path, predictions: &[f64]) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record(["row", "prediction"])?;
    for (row, value) in predictions.iter().enumerate() {
        writer.write_record([(row + 1).to_string(), value.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Renders the controller's progress as a terminal bar over the sweep budget.
struct ConsoleProgress {
    bar: ProgressBar,
}

impl ConsoleProgress {
    fn new(max_iter: u64) -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(max_iter), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self { bar }
    }
}

impl FitProgressObserver for ConsoleProgress {
    fn on_state(&mut self, state: FitState) {
        self.bar.set_message(format!("{state:?}"));
    }

    fn on_iteration(&mut self, iteration: usize, coefficients: &[f64], objective: f64) {
        let nonzero = coefficients.iter().filter(|b| **b != 0.0).count();
        self.bar.set_position(iteration as u64);
        self.bar
            .set_message(format!("objective {objective:.6e}, {nonzero} non-zero"));
    }
}
