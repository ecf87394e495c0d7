//! Command line entry point for virtscen

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use color_eyre::{
    eyre::{bail, Context as _},
    Report, Result,
};

use virtscen::config::{ScenarioConfig, ScenarioFile, DEFAULT_COMMAND_TIMEOUT};
use virtscen::executor::ProcessExecutor;
use virtscen::report;
use virtscen::runner::Runner;
use virtscen::scenarios::{self, SCENARIOS};

/// Run libvirt integration-test scenarios.
///
/// Each scenario sets up what it needs through virsh, performs the
/// operation under test, verifies the result and always cleans up after
/// itself. Exit status is 0 when the scenario passed, 1 when it failed
/// and 77 when it was skipped.
#[derive(Parser)]
#[command(name = "virtscen", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available scenarios
    List(ListOpts),
    /// Run one scenario
    Run(RunOpts),
}

#[derive(Parser)]
struct ListOpts {
    /// Print JSON instead of a table
    #[clap(long)]
    json: bool,
}

#[derive(Parser)]
struct RunOpts {
    /// Scenario to run; may also come from the scenario file
    scenario: Option<String>,

    /// TOML scenario file with `scenario`, `[runner]` and `[params]`
    #[clap(long)]
    config: Option<Utf8PathBuf>,

    /// Scenario parameter as key=value; overrides the scenario file
    #[clap(long = "param", short = 'p', value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Hypervisor connection URI passed to virsh as `-c`
    #[clap(long, short = 'c')]
    connect: Option<String>,

    /// Timeout for each external command, in seconds
    #[clap(long, value_name = "SECS")]
    command_timeout: Option<u64>,

    /// Print the result as JSON
    #[clap(long)]
    json: bool,
}

/// Install and configure the tracing/logging system.
///
/// Logs go to stderr, filtered by RUST_LOG and defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn list(opts: ListOpts) -> Result<i32> {
    if opts.json {
        let infos: Vec<report::ScenarioInfo> =
            SCENARIOS.iter().map(report::ScenarioInfo::from).collect();
        println!("{}", report::to_json(&infos)?);
    } else {
        println!("{}", report::scenarios_table(SCENARIOS));
    }
    Ok(0)
}

fn run(opts: RunOpts) -> Result<i32> {
    let file = match &opts.config {
        Some(path) => ScenarioFile::load(path)?,
        None => ScenarioFile::default(),
    };
    let Some(name) = opts.scenario.clone().or(file.scenario) else {
        bail!("No scenario given; pass one on the command line or set `scenario` in --config");
    };
    let overrides = ScenarioConfig::from_params(&opts.params).context("Parsing --param")?;
    let config = file.params.merged(overrides);
    let mut scenario = scenarios::build(&name, &config)?;

    let timeout = opts
        .command_timeout
        .or(file.runner.command_timeout)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT);
    let connect = opts.connect.or(file.runner.connect);

    let executor = ProcessExecutor::new()?;
    let result = Runner::new(Arc::new(executor))
        .command_timeout(timeout)
        .connect(connect)
        .run(scenario.as_mut());

    if opts.json {
        println!("{}", report::to_json(&result)?);
    } else {
        if let Some(table) = report::diagnostics_table(&result) {
            println!("{table}");
        }
        println!("{}", report::summary_line(&result));
    }
    Ok(result.outcome().exit_code())
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::List(opts) => list(opts)?,
        Commands::Run(opts) => run(opts)?,
    };
    tracing::debug!("exiting");
    std::process::exit(code)
}
