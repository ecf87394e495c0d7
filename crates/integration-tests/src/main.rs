//! Integration tests for virtscen
//!
//! These run the `virtscen` binary against a live libvirt. Scenario runs
//! that report "skipped" (exit status 77) are accepted, so the suite can run
//! on hosts without HBAs or a default network.

use camino::Utf8Path;
use std::process::Output;

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};
use serde_json::Value;
use xshell::{cmd, Shell};

pub(crate) use integration_tests::{IntegrationTest, INTEGRATION_TESTS};
use linkme::distributed_slice;

mod tests {
    pub mod cli;
    pub mod net_define_undefine;
    pub mod pool_volume;
}

/// Exit status of a skipped scenario
pub(crate) const EXIT_SKIPPED: i32 = 77;

/// Get the path to the virtscen binary, checking VIRTSCEN_PATH env var first, then falling back to "virtscen"
pub(crate) fn get_virtscen_command() -> Result<String> {
    if let Ok(path) = std::env::var("VIRTSCEN_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/virtscen", "target/release/virtscen"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set VIRTSCEN_PATH={path} to run using this binary"
        ));
    }
    Ok("virtscen".to_owned())
}

/// libvirt connection URI for the tests, from VIRTSCEN_TEST_CONNECT
pub(crate) fn get_test_connect() -> String {
    std::env::var("VIRTSCEN_TEST_CONNECT").unwrap_or_else(|_| "qemu:///system".to_string())
}

/// Captured output from a command with decoded stdout/stderr strings
pub(crate) struct CapturedOutput {
    pub output: Output,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// Create from a raw Output
    pub fn new(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Self {
            output,
            stdout,
            stderr,
        }
    }

    /// Assert that the command succeeded, printing debug info on failure
    pub fn assert_success(&self, context: &str) {
        assert!(
            self.output.status.success(),
            "{} failed: {}",
            context,
            self.stderr
        );
    }

    /// Get the exit code
    pub fn exit_code(&self) -> Option<i32> {
        self.output.status.code()
    }

    /// Parse stdout as JSON
    pub fn json(&self) -> Result<Value> {
        serde_json::from_str(&self.stdout)
            .with_context(|| format!("Failed to parse JSON output: {}", self.stdout))
    }
}

/// Run the virtscen command, capturing output
pub(crate) fn run_virtscen(args: &[&str]) -> Result<CapturedOutput> {
    let bin = get_virtscen_command()?;
    let output = std::process::Command::new(&bin)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {bin}"))?;
    Ok(CapturedOutput::new(output))
}

/// Run a scenario with `--json` and return the parsed result.
///
/// Returns `None` when the scenario was skipped on this host.
pub(crate) fn run_scenario(scenario: &str, params: &[&str]) -> Result<Option<Value>> {
    let connect = get_test_connect();
    let mut args = vec!["run", scenario, "--json", "--connect", connect.as_str()];
    for p in params {
        args.extend(["--param", *p]);
    }
    let output = run_virtscen(&args)?;
    let result = output.json()?;
    match output.exit_code() {
        Some(0) => Ok(Some(result)),
        Some(EXIT_SKIPPED) => {
            println!("{scenario} skipped: {}", result["diagnostics"]);
            Ok(None)
        }
        code => Err(eyre!(
            "{scenario} exited with {code:?}: {}\n{}",
            result["diagnostics"],
            output.stderr
        )),
    }
}

/// Whether virsh can reach the test connection.
pub(crate) fn libvirt_available() -> bool {
    let Ok(sh) = Shell::new() else {
        return false;
    };
    let connect = get_test_connect();
    cmd!(sh, "virsh -c {connect} uri")
        .quiet()
        .ignore_stdout()
        .ignore_stderr()
        .run()
        .is_ok()
}

#[distributed_slice(INTEGRATION_TESTS)]
static TEST_LIST_JSON: IntegrationTest = IntegrationTest::new("list_json", test_list_json);

fn test_list_json() -> Result<()> {
    let output = run_virtscen(&["list", "--json"])?;
    output.assert_success("virtscen list --json");

    let scenarios = output.json()?;
    let scenarios = scenarios
        .as_array()
        .ok_or_else(|| eyre!("Expected JSON array in output, got: {}", output.stdout))?;
    for name in [
        "pool-volume",
        "net-define-undefine",
        "disk-reservations",
        "checkpoint",
    ] {
        if !scenarios.iter().any(|s| s["name"] == name) {
            return Err(eyre!("Scenario {name} missing from list output"));
        }
    }
    Ok(())
}

fn main() {
    let args = Arguments::from_args();

    // Collect tests from the distributed slice
    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let name = test.name;
            let f = test.f;
            Trial::test(name, move || f().map_err(|e| format!("{:?}", e).into()))
        })
        .collect();

    // Run the tests and exit with the result
    libtest_mimic::run(&args, tests).exit();
}
