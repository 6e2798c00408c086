#![forbid(unsafe_code)]

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use simreg_harness::release::render_release_listing;
use simreg_harness::{
    ChildProcessRunner, DEFAULT_TOLERANCE, HarnessError, PipelineOrchestrator, RunLog, RunOptions,
    SuiteConfig, print_report, render_verdict, write_run_report,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Runs the simulation pipeline regression suite and compares its output
/// with the reference results of a solver release.
#[derive(Debug, Parser)]
#[command(name = "run_regression", version)]
struct Cli {
    /// Directory holding the pre-processor, solver and post-processor.
    #[arg(value_name = "EXE_PATH", required_unless_present = "list_releases")]
    exe_path: Option<PathBuf>,

    /// Largest accepted relative error per dataset.
    #[arg(short = 't', long, default_value_t = DEFAULT_TOLERANCE)]
    tolerance: f64,

    /// Release whose reference results are compared against (default: newest).
    #[arg(short = 'r', long)]
    release: Option<String>,

    /// Suite configuration file (JSON); the built-in suite is used otherwise.
    #[arg(long, value_name = "JSON")]
    suite: Option<PathBuf>,

    /// Override of the suite directory.
    #[arg(long)]
    suite_dir: Option<PathBuf>,

    /// Kill any pipeline executable running longer than this.
    #[arg(long, env = "SIMREG_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Write the machine-readable run report here.
    #[arg(long, value_name = "JSON")]
    report: Option<PathBuf>,

    /// Append one JSON line per pipeline step, case and dataset.
    #[arg(long, env = "SIMREG_RUN_LOG_PATH", value_name = "JSONL")]
    log_path: Option<PathBuf>,

    /// Print the releases with reference results and exit.
    #[arg(long)]
    list_releases: bool,

    /// Emit diagnostics as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_env("SIMREG_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("run_regression failed: {err}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32, HarnessError> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut suite = match &cli.suite {
        Some(path) => SuiteConfig::load(path)?,
        None => SuiteConfig::builtin(),
    };
    if let Some(dir) = &cli.suite_dir {
        suite.suite_dir.clone_from(dir);
    }

    let runner = ChildProcessRunner::new(cli.timeout_secs.map(Duration::from_secs));
    let mut orchestrator = PipelineOrchestrator::new(suite, runner)?;
    if let Some(path) = &cli.log_path {
        orchestrator = orchestrator.with_run_log(RunLog::at_path(path));
    }

    if cli.list_releases {
        let tags: Vec<String> = orchestrator.registry().tags().map(str::to_string).collect();
        println!("{}", render_release_listing(&tags));
        return Ok(0);
    }

    let Some(exe_path) = cli.exe_path else {
        Cli::command()
            .error(ErrorKind::MissingRequiredArgument, "EXE_PATH is required")
            .exit();
    };
    let exe_dir = std::path::absolute(&exe_path).unwrap_or(exe_path);
    let options = RunOptions {
        exe_dir,
        release: cli.release.clone(),
        tolerance: cli.tolerance,
    };

    let outcome = orchestrator.run(&options)?;
    info!(
        postprocessor = %outcome.executables.postprocessor.display(),
        "post-processor resolved; not invoked by this suite"
    );

    print_report(&outcome.matrix);
    for warning in &outcome.warnings {
        println!("warning: {warning}");
    }
    print!("{}", render_verdict(&outcome.verdict));

    if let Some(path) = &cli.report {
        write_run_report(path, &outcome.run_report())?;
        println!("wrote {}", path.display());
    }

    Ok(if outcome.passed() { 0 } else { 2 })
}
