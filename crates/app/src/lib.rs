use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use hiresfix_core::config::{config_path, data_dir, initialize_data_dir, AppConfig, HiresFixSettings};
use hiresfix_core::controller::RestoreReport;
use hiresfix_core::host::{GenerationRun, PassPlan, ScaledSlot, StepRecord};
use hiresfix_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use hiresfix_core::network::Network;
use hiresfix_core::resize::InterpolationMode;
use hiresfix_core::schedule::ScalePoint;
use hiresfix_core::script::{HiresFixScript, ProcessOutcome};
use hiresfix_core::types::Tensor;

#[derive(Parser)]
#[command(
    name = "hiresfix",
    about = "Simulate the step-gated Kohya hires fix on a toy encoder/decoder network"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated generation and report per-step patch state.
    Simulate(SimulateArgs),
    /// Print the resolved settings as TOML.
    Config(SettingsArgs),
    /// Create the data directory and a default config.toml.
    Init,
}

#[derive(Args)]
struct SimulateArgs {
    #[arg(long, default_value_t = 20, help = "Sampling steps of the first pass")]
    steps: usize,
    #[arg(long, default_value_t = 1)]
    passes: usize,
    #[arg(long, help = "Sampling steps of every pass after the first (default: --steps)")]
    pass_steps: Option<usize>,
    #[arg(long, default_value_t = 1.0, help = "Latent scale applied before every pass after the first")]
    pass_scale: f64,
    #[arg(long, default_value_t = 64, help = "Latent height and width")]
    size: usize,
    #[arg(long, default_value_t = 4)]
    channels: usize,
    #[arg(long, default_value_t = 12, help = "Blocks per encoder/decoder path")]
    blocks: usize,
    #[arg(long, help = "Emit the report as JSON")]
    json: bool,
    #[command(flatten)]
    settings: SettingsArgs,
}

/// Command-line overrides for `[hires_fix]`.
#[derive(Args, Default)]
struct SettingsArgs {
    #[arg(long, conflicts_with = "disable")]
    enable: bool,
    #[arg(long)]
    disable: bool,
    #[arg(long, value_name = "FRACTION", help = "Inner stop fraction")]
    s1: Option<f64>,
    #[arg(long, value_name = "DEPTH", help = "Inner depth")]
    d1: Option<usize>,
    #[arg(long, value_name = "FRACTION", help = "Outer stop fraction")]
    s2: Option<f64>,
    #[arg(long, value_name = "DEPTH", help = "Outer depth")]
    d2: Option<usize>,
    #[arg(long)]
    downscale: Option<f64>,
    #[arg(long)]
    upscale: Option<f64>,
    #[arg(long, value_name = "MODE", help = "bicubic, bilinear, nearest, nearest-exact or area")]
    interpolation: Option<String>,
    #[arg(long, value_name = "BOOL")]
    smooth_scaling: Option<bool>,
    #[arg(long, value_name = "BOOL")]
    early_out: Option<bool>,
    #[arg(long, value_name = "BOOL")]
    only_one_pass: Option<bool>,
}

impl SettingsArgs {
    fn apply(&self, settings: &mut HiresFixSettings) -> Result<()> {
        if self.enable {
            settings.enable = true;
        }
        if self.disable {
            settings.enable = false;
        }
        settings.inner = ScalePoint::new(
            self.s1.unwrap_or(settings.inner.stop_fraction),
            self.d1.unwrap_or(settings.inner.depth),
        );
        settings.outer = ScalePoint::new(
            self.s2.unwrap_or(settings.outer.stop_fraction),
            self.d2.unwrap_or(settings.outer.depth),
        );
        if let Some(downscale) = self.downscale {
            settings.downscale = downscale;
        }
        if let Some(upscale) = self.upscale {
            settings.upscale = upscale;
        }
        if let Some(mode) = self.interpolation.as_deref() {
            settings.interpolation = mode.parse::<InterpolationMode>()?;
        }
        if let Some(smooth_scaling) = self.smooth_scaling {
            settings.smooth_scaling = smooth_scaling;
        }
        if let Some(early_out) = self.early_out {
            settings.early_out = early_out;
        }
        if let Some(only_one_pass) = self.only_one_pass {
            settings.only_one_pass = only_one_pass;
        }
        settings.validate()
    }
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let retention_files = AppConfig::load_from_path(&config_path(&resolved_data_dir))
        .map(|config| config.logging.retention_files)
        .unwrap_or(logging::DEFAULT_LOG_RETENTION_FILES);
    init_logging(
        &resolved_data_dir,
        cli.verbose,
        cli.log_filter.as_deref(),
        retention_files,
    );
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Startup metadata"
    );

    match cli.command {
        Commands::Simulate(args) => {
            let config = load_config(&resolved_data_dir, &args.settings)?;
            let report = simulate(&config.hires_fix, &args)?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("failed to encode report")?
                );
            } else {
                print!("{}", render_report(&report)?);
            }
            Ok(())
        }
        Commands::Config(overrides) => {
            let config = load_config(&resolved_data_dir, &overrides)?;
            let encoded =
                toml::to_string_pretty(&config).context("failed to serialize config TOML")?;
            print!("{encoded}");
            Ok(())
        }
        Commands::Init => {
            let created = initialize_data_dir(&resolved_data_dir)?;
            let cfg_path = config_path(&resolved_data_dir);
            if created {
                println!("Wrote default config to {}", cfg_path.display());
            } else {
                println!("Config already exists at {}", cfg_path.display());
            }
            Ok(())
        }
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>, retention_files: usize) {
    let init_options = LoggingInitOptions {
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        retention_files,
        ..Default::default()
    };
    let plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = parse_env_filter_with_fallback(&plan.filters.console_filter, "console");

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    match plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_filter = parse_env_filter_with_fallback(&plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(file_filter),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }
            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_config(data_dir: &Path, overrides: &SettingsArgs) -> Result<AppConfig> {
    let cfg_path = config_path(data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    overrides
        .apply(&mut config.hires_fix)
        .context("invalid settings override")?;
    Ok(config)
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    title: &'static str,
    settings: HiresFixSettings,
    process: ProcessOutcome,
    passes: Vec<PassPlan>,
    steps: Vec<StepRecord>,
    total_cost: u64,
    baseline_cost: u64,
    restore: RestoreReport,
    restored: bool,
}

impl SimulationReport {
    fn saving_percent(&self) -> f64 {
        if self.baseline_cost == 0 {
            return 0.0;
        }
        (1.0 - self.total_cost as f64 / self.baseline_cost as f64) * 100.0
    }
}

fn pass_plans(args: &SimulateArgs) -> Result<Vec<PassPlan>> {
    if args.passes == 0 {
        bail!("--passes must be at least 1");
    }
    let later_steps = args.pass_steps.unwrap_or(args.steps);
    Ok((0..args.passes)
        .map(|index| {
            if index == 0 {
                PassPlan::new(args.steps)
            } else {
                PassPlan::new(later_steps).with_latent_scale(args.pass_scale)
            }
        })
        .collect())
}

fn initial_latent(channels: usize, size: usize) -> Tensor {
    Tensor::from_shape_fn((1, channels, size, size), |(_, c, y, x)| {
        ((x + 2 * y + 3 * c) % 7) as f32 / 7.0
    })
}

fn simulate(settings: &HiresFixSettings, args: &SimulateArgs) -> Result<SimulationReport> {
    if args.size == 0 {
        bail!("--size must be at least 1");
    }
    let passes = pass_plans(args)?;
    let script = HiresFixScript::new();

    let mut network = Network::symmetric(args.blocks, args.channels)?;
    let before = network.layout();
    let mut run = GenerationRun::new(passes.clone())?;
    let report = script.run_generation(
        settings,
        &mut network,
        &mut run,
        initial_latent(args.channels, args.size),
    )?;
    let restored = network.layout() == before;

    let mut baseline_network = Network::symmetric(args.blocks, args.channels)?;
    let mut baseline_run = GenerationRun::new(passes.clone())?;
    baseline_run.suppress_hires_fix = true;
    let baseline = script.run_generation(
        settings,
        &mut baseline_network,
        &mut baseline_run,
        initial_latent(args.channels, args.size),
    )?;

    info!(
        total_cost = report.sample.total_cost,
        baseline_cost = baseline.sample.total_cost,
        restored,
        "Simulation finished"
    );

    Ok(SimulationReport {
        title: script.title(),
        settings: settings.clone(),
        process: report.process,
        passes,
        steps: report.sample.steps,
        total_cost: report.sample.total_cost,
        baseline_cost: baseline.sample.total_cost,
        restore: report.restore,
        restored,
    })
}

fn format_slots(slots: &[ScaledSlot]) -> String {
    if slots.is_empty() {
        return "-".to_string();
    }
    slots
        .iter()
        .map(|slot| format!("{}@{:.3}", slot.index, slot.scale))
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_report(report: &SimulationReport) -> Result<String, fmt::Error> {
    let mut out = String::new();
    writeln!(out, "{} ({:?})", report.title, report.process)?;
    writeln!(
        out,
        "{:>4} {:>5} {:>16} {:>16} {:>9} {:>10}",
        "pass", "step", "encoder", "decoder", "latent", "cost"
    )?;
    for record in &report.steps {
        let latent = format!("{}x{}", record.latent.0, record.latent.1);
        writeln!(
            out,
            "{:>4} {:>5} {:>16} {:>16} {:>9} {:>10}",
            record.pass,
            format!("{}/{}", record.step, record.total_steps),
            format_slots(&record.input_blocks),
            format_slots(&record.output_blocks),
            latent,
            record.cost
        )?;
    }
    writeln!(
        out,
        "total cost {} vs {} unpatched ({:.1}% saved)",
        report.total_cost,
        report.baseline_cost,
        report.saving_percent()
    )?;
    writeln!(
        out,
        "teardown reverted {} encoder / {} decoder blocks; network restored: {}",
        report.restore.input_blocks,
        report.restore.output_blocks,
        if report.restored { "yes" } else { "NO" }
    )?;
    Ok(out)
}
