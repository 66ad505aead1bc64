#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array2;
use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use skein::data::{self, Synthetic, VarSpec};
use skein::debias::{self, SupportMask};
use skein::extract;
use skein::gista::{self, GistaConfig};
use skein::layout::Flattening;
use skein::model::{CMlp, ModelConfig};
use skein::opt::{self, AdamConfig};
use skein::penalty::Penalty;

#[derive(Parser)]
#[command(
    name = "skein",
    version,
    about = "Nonlinear Granger causality discovery via componentwise sparse neural networks"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum PenaltyCli {
    /// One group per candidate series over its whole lag window.
    GroupLasso,
    /// Lag-nested groups: larger lags are always pruned first.
    Hierarchical,
}

impl From<PenaltyCli> for Penalty {
    fn from(value: PenaltyCli) -> Self {
        match value {
            PenaltyCli::GroupLasso => Penalty::GroupLasso,
            PenaltyCli::Hierarchical => Penalty::Hierarchical,
        }
    }
}

#[derive(Args)]
struct SimulateArgs {
    /// Number of observed series
    #[arg(long, default_value = "5")]
    series: usize,

    /// True autoregressive order of the generated process
    #[arg(long, default_value = "3")]
    lag: usize,

    /// Fraction of off-diagonal parents per target series
    #[arg(long, default_value = "0.2")]
    sparsity: f64,

    /// Number of observations to keep after burn-in
    #[arg(long, default_value = "1000")]
    steps: usize,

    /// RNG seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Where to write the generated sequence and its ground truth (TOML)
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args)]
struct TrainArgs {
    /// A sequence artifact produced by `simulate`; when omitted, a fresh
    /// VAR sequence is generated from the simulation flags below
    #[arg(long)]
    input: Option<PathBuf>,

    /// Number of series when simulating in-process
    #[arg(long, default_value = "5")]
    series: usize,

    /// Simulator autoregressive order when simulating in-process
    #[arg(long, default_value = "3")]
    true_lag: usize,

    /// Simulator edge fraction when simulating in-process
    #[arg(long, default_value = "0.2")]
    sparsity: f64,

    /// Simulator length when simulating in-process
    #[arg(long, default_value = "1000")]
    steps: usize,

    /// Lag window of the fitted model
    #[arg(long, default_value = "5")]
    lag: usize,

    /// Hidden layer widths, repeatable (e.g. --hidden 16 --hidden 8)
    #[arg(long, default_value = "16")]
    hidden: Vec<usize>,

    /// Group-sparsity strength
    #[arg(long, default_value = "0.2")]
    lam: f64,

    /// Ridge strength on non-first-layer weights
    #[arg(long, default_value = "0.01")]
    lam_ridge: f64,

    /// Initial proximal-gradient step size
    #[arg(long, default_value = "0.05")]
    step: f64,

    /// Group penalty variant
    #[arg(long, value_enum, default_value_t = PenaltyCli::Hierarchical)]
    penalty: PenaltyCli,

    /// Maximum proximal-gradient iterations
    #[arg(long, default_value = "2000")]
    max_iterations: usize,

    /// Convergence-check and trace-sampling interval
    #[arg(long, default_value = "50")]
    check_every: usize,

    /// Relative objective-change tolerance
    #[arg(long, default_value = "1e-4")]
    tolerance: f64,

    /// Adam iterations for the unregularized pretraining phase
    #[arg(long, default_value = "500")]
    pretrain_iterations: usize,

    /// Adam iterations for the debiased refit (0 skips debiasing)
    #[arg(long, default_value = "500")]
    debias_iterations: usize,

    /// Learning rate for both first-order phases
    #[arg(long, default_value = "1e-3")]
    learning_rate: f64,

    /// Group-norm threshold when reading off the causality matrix
    #[arg(long, default_value = "0.0")]
    threshold: f64,

    /// RNG seed for weight initialization (and simulation, if any)
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Where to save the final trained model (TOML)
    #[arg(long)]
    save: Option<PathBuf>,
}

#[derive(Args)]
struct ReportArgs {
    /// A trained model saved by `train`
    #[arg(long)]
    model: PathBuf,

    /// Group-norm threshold
    #[arg(long, default_value = "0.0")]
    threshold: f64,

    /// Also print the lag-resolved causality tensor
    #[arg(long)]
    lags: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a sparse stationary VAR sequence with known structure
    Simulate(SimulateArgs),
    /// Fit the causal structure of a sequence end to end
    Train(TrainArgs),
    /// Print the causal structure of a saved model
    Report(ReportArgs),
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        log::error!("{err}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match cli.command {
        Command::Simulate(args) => simulate(args),
        Command::Train(args) => train(args),
        Command::Report(args) => report(args),
    }
}

fn simulate(args: SimulateArgs) -> Result<(), Box<dyn Error>> {
    let spec = VarSpec {
        num_series: args.series,
        lag: args.lag,
        sparsity: args.sparsity,
        steps: args.steps,
        ..VarSpec::default()
    };
    let synthetic = data::simulate_var(&spec, args.seed)?;
    std::fs::write(&args.output, toml::to_string_pretty(&synthetic)?)?;
    log::info!(
        "Wrote {} observations of {} series to {}",
        synthetic.series.nrows(),
        synthetic.series.ncols(),
        args.output.display()
    );
    println!("True causality matrix:");
    print!("{}", render_matrix(&synthetic.truth));
    Ok(())
}

fn train(args: TrainArgs) -> Result<(), Box<dyn Error>> {
    let synthetic = match &args.input {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            toml::from_str::<Synthetic>(&text)?
        }
        None => {
            let spec = VarSpec {
                num_series: args.series,
                lag: args.true_lag,
                sparsity: args.sparsity,
                steps: args.steps,
                ..VarSpec::default()
            };
            data::simulate_var(&spec, args.seed)?
        }
    };
    let series = synthetic.series.view();

    let config = ModelConfig {
        num_series: series.ncols(),
        lag: args.lag,
        hidden: args.hidden.clone(),
        flattening: Flattening::SeriesMajor,
    };
    let mut model = CMlp::new(config, args.seed)?;

    let adam = AdamConfig {
        learning_rate: args.learning_rate,
        iterations: args.pretrain_iterations,
        check_every: args.check_every,
        ..AdamConfig::default()
    };
    if args.pretrain_iterations > 0 {
        let bar = phase_spinner("pretraining");
        let trace = opt::pretrain(&mut model, series, &adam)?;
        bar.finish_and_clear();
        if let Some(sample) = trace.samples.last() {
            log::info!("Pretraining done, mean loss {:.4e}", sample.mse);
        }
    }

    let gista_cfg = GistaConfig {
        lam: args.lam,
        lam_ridge: args.lam_ridge,
        step_size: args.step,
        penalty: args.penalty.into(),
        max_iterations: args.max_iterations,
        check_every: args.check_every,
        tolerance: args.tolerance,
        ..GistaConfig::default()
    };
    let bar = phase_spinner("proximal-gradient training");
    let summary = gista::train_gista(&mut model, series, &gista_cfg, None)?;
    bar.finish_and_clear();
    log::info!(
        "GISTA {:?} after {} iterations",
        summary.status,
        summary.iterations
    );
    if let Some(sample) = summary.trace.samples.last() {
        log::info!(
            "Final objective {:.4e}, mean MSE {:.4e}",
            sample.objective,
            sample.mse
        );
    }

    let causal = extract::causality_matrix(&model, args.threshold);
    println!("Estimated causality matrix (row = target, column = candidate):");
    print!("{}", render_matrix(&causal));
    println!(
        "Ground-truth agreement: {:.1}%",
        100.0 * extract::agreement(&causal, &synthetic.truth)
    );

    let final_model = if args.debias_iterations > 0 {
        let mask = SupportMask::from_causality(&model.layout, causal)?;
        let refit_cfg = AdamConfig {
            learning_rate: args.learning_rate,
            iterations: args.debias_iterations,
            check_every: args.check_every,
            ..AdamConfig::default()
        };
        let bar = phase_spinner("debiased refit");
        let refit = debias::debias(&model, series, &mask, &refit_cfg)?;
        bar.finish_and_clear();
        if let Some(sample) = refit.trace.samples.last() {
            log::info!("Refit done, mean loss {:.4e}", sample.mse);
        }
        refit.model
    } else {
        model
    };

    if let Some(path) = &args.save {
        final_model.save(path)?;
        log::info!("Saved model to {}", path.display());
    }
    Ok(())
}

fn report(args: ReportArgs) -> Result<(), Box<dyn Error>> {
    let model = CMlp::load(&args.model)?;
    let causal = extract::causality_matrix(&model, args.threshold);
    println!("Causality matrix (row = target, column = candidate):");
    print!("{}", render_matrix(&causal));
    if args.lags {
        let tensor = extract::lag_causality(&model, args.threshold);
        for k in 0..model.config.lag {
            let slice: Array2<bool> = tensor.index_axis(ndarray::Axis(0), k).to_owned();
            println!("Active at lag >= {}:", k + 1);
            print!("{}", render_matrix(&slice));
        }
    }
    Ok(())
}

fn render_matrix(matrix: &Array2<bool>) -> String {
    let mut out = String::new();
    for row in matrix.rows() {
        for &cell in row {
            out.push(if cell { '1' } else { '.' });
            out.push(' ');
        }
        out.pop();
        out.push('\n');
    }
    out
}

fn phase_spinner(label: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(label.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}
