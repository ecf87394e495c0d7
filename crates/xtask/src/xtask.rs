//! See https://github.com/matklad/cargo-xtask
//! This is kind of like "Justfile but in Rust".

use std::process::Command;

use color_eyre::eyre::{eyre, Context, Report};
use color_eyre::Result;
use xshell::{cmd, Shell};

#[allow(clippy::type_complexity)]
const TASKS: &[(&str, fn(&Shell) -> Result<()>)] = &[
    ("build", build),
    ("test", unit_tests),
    ("test-integration", test_integration),
    ("cleanup", cleanup),
];

const VIRTSCEN_BIN: &str = "target/debug/virtscen";

fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false);
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;
    // Ensure our working directory is the toplevel
    {
        let toplevel_path = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .context("Invoking git rev-parse")?;
        if !toplevel_path.status.success() {
            return Err(eyre!("Failed to invoke git rev-parse"));
        }
        let path = String::from_utf8(toplevel_path.stdout)?;
        std::env::set_current_dir(path.trim()).context("Changing to toplevel")?;
    }

    let task = std::env::args().nth(1);

    let sh = xshell::Shell::new()?;
    if let Some(cmd) = task.as_deref() {
        let f = TASKS
            .iter()
            .find_map(|(k, f)| (*k == cmd).then_some(*f))
            .unwrap_or(print_help);
        f(&sh)?;
    } else {
        print_help(&sh)?;
    }
    Ok(())
}

fn print_help(_sh: &Shell) -> Result<()> {
    println!("Tasks:");
    for (name, _) in TASKS {
        println!("  - {name}");
    }
    Ok(())
}

fn build(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo build -p virtscen -p integration-tests --bins").run()?;
    Ok(())
}

fn unit_tests(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo test -p virtscen --lib").run()?;
    cmd!(sh, "cargo test -p integration-tests --lib").run()?;
    Ok(())
}

/// Build the CLI and run the live integration tests against it.
///
/// Extra arguments after the task name are passed to the test harness,
/// e.g. a test name filter.
fn test_integration(sh: &Shell) -> Result<()> {
    build(sh)?;
    let bin = sh.current_dir().join(VIRTSCEN_BIN);
    let args: Vec<String> = std::env::args().skip(2).collect();
    tracing::info!("Running integration tests against {}", bin.display());
    let _env = sh.push_env("VIRTSCEN_PATH", &bin);
    cmd!(sh, "cargo test -p integration-tests --test integration-tests -- {args...}").run()?;
    Ok(())
}

fn cleanup(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo run -p integration-tests --bin test-cleanup").run()?;
    Ok(())
}
