//! Live storage pool scenarios
//!
//! Uses directory pools under a temporary directory so no host storage is
//! touched. Every pool name carries the integration-test prefix and is
//! removed by the scenario itself; `test-cleanup` catches leftovers.

use color_eyre::eyre::{ensure, Context as _, ContextCompat as _};
use color_eyre::Result;
use integration_tests::{integration_test, unique_name};
use linkme::distributed_slice;
use tempfile::TempDir;

use crate::{get_test_connect, libvirt_available, run_scenario, run_virtscen, EXIT_SKIPPED};

fn pool_exists(name: &str) -> bool {
    let connect = get_test_connect();
    std::process::Command::new("virsh")
        .args(["-c", connect.as_str(), "pool-info", name])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn test_pool_volume_dir_lifecycle() -> Result<()> {
    if !libvirt_available() {
        println!("libvirt not reachable, nothing to test");
        return Ok(());
    }
    let target = TempDir::new().context("Creating pool target")?;
    let target = target.path().to_str().context("temp path is not UTF-8")?;
    let pool = unique_name("pool");
    let pool_param = format!("pool_name={pool}");
    let target_param = format!("pool_target={target}");

    let Some(result) = run_scenario(
        "pool-volume",
        &[
            &pool_param,
            "pool_type=dir",
            &target_param,
            "need_vol_create=yes",
            "volume_name=virtscen-it.img",
            "volume_capacity=1M",
            "allocation=1M",
        ],
    )?
    else {
        return Ok(());
    };

    let released: Vec<_> = result["released"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    ensure!(
        released == ["volume:virtscen-it.img".to_owned(), format!("pool:{pool}")],
        "unexpected release order: {released:?}"
    );
    ensure!(!pool_exists(&pool), "pool {pool} left behind");
    Ok(())
}
integration_test!(test_pool_volume_dir_lifecycle);

fn test_pool_volume_expect_inactive_fails() -> Result<()> {
    if !libvirt_available() {
        println!("libvirt not reachable, nothing to test");
        return Ok(());
    }
    let target = TempDir::new().context("Creating pool target")?;
    let target = target.path().to_str().context("temp path is not UTF-8")?;
    let pool = unique_name("pool");
    let connect = get_test_connect();
    let pool_param = format!("pool_name={pool}");
    let target_param = format!("pool_target={target}");

    let output = run_virtscen(&[
        "run",
        "pool-volume",
        "--json",
        "--connect",
        &connect,
        "--param",
        &pool_param,
        "--param",
        &target_param,
        "--param",
        "expect_active=no",
    ])?;
    if output.exit_code() == Some(EXIT_SKIPPED) {
        return Ok(());
    }
    ensure!(output.exit_code() == Some(1), "unexpected exit: {:?}", output.exit_code());
    let result = output.json()?;
    ensure!(result["outcome"] == "failed", "outcome: {}", result["outcome"]);
    let message = result["diagnostics"][0]["message"].as_str().unwrap_or_default();
    ensure!(
        message == format!("pool {pool} is running, expected it to be inactive"),
        "diagnostic: {message}"
    );
    ensure!(!pool_exists(&pool), "pool {pool} left behind");
    Ok(())
}
integration_test!(test_pool_volume_expect_inactive_fails);
