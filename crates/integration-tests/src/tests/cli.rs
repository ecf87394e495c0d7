//! Command line behavior that needs no hypervisor
//!
//! Parameter and scenario-file errors are reported before any command runs,
//! so these tests work on any host.

use color_eyre::eyre::{ensure, Context as _, ContextCompat as _};
use color_eyre::Result;
use integration_tests::integration_test;
use linkme::distributed_slice;
use std::io::Write as _;

use crate::run_virtscen;

fn test_list_table() -> Result<()> {
    let output = run_virtscen(&["list"])?;
    output.assert_success("virtscen list");
    for needle in ["NAME", "DESCRIPTION", "pool-volume", "checkpoint"] {
        ensure!(
            output.stdout.contains(needle),
            "list output lacks {needle}: {}",
            output.stdout
        );
    }
    Ok(())
}
integration_test!(test_list_table);

fn test_unknown_scenario() -> Result<()> {
    let output = run_virtscen(&["run", "no-such-scenario"])?;
    ensure!(output.exit_code() == Some(1), "unexpected exit: {:?}", output.exit_code());
    ensure!(
        output.stderr.contains("Unknown scenario 'no-such-scenario'"),
        "stderr: {}",
        output.stderr
    );
    Ok(())
}
integration_test!(test_unknown_scenario);

fn test_malformed_param() -> Result<()> {
    let output = run_virtscen(&["run", "pool-volume", "--param", "novalue"])?;
    ensure!(!output.output.status.success(), "run unexpectedly succeeded");
    ensure!(
        output.stderr.contains("expected key=value"),
        "stderr: {}",
        output.stderr
    );
    Ok(())
}
integration_test!(test_malformed_param);

fn test_scenario_file_requires_parameters() -> Result<()> {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .context("Creating scenario file")?;
    writeln!(
        file,
        "scenario = \"checkpoint\"\n\n[runner]\ncommand-timeout = 10\n\n[params]\ncheckpoint_name = \"cp\""
    )?;
    let path = file.path().to_str().context("temp path is not UTF-8")?;

    let output = run_virtscen(&["run", "--config", path])?;
    ensure!(!output.output.status.success(), "run unexpectedly succeeded");
    ensure!(output.stderr.contains("main_vm"), "stderr: {}", output.stderr);
    Ok(())
}
integration_test!(test_scenario_file_requires_parameters);

fn test_missing_scenario_name() -> Result<()> {
    let output = run_virtscen(&["run"])?;
    ensure!(!output.output.status.success(), "run unexpectedly succeeded");
    ensure!(
        output.stderr.contains("No scenario given"),
        "stderr: {}",
        output.stderr
    );
    Ok(())
}
integration_test!(test_missing_scenario_name);
