//! Cleanup utility for integration test resources
//!
//! This binary removes storage pools and networks left behind by
//! integration tests, identified by their name prefix.

use std::time::Duration;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::{info, warn};

use integration_tests::is_test_resource;
use virtscen::executor::{CommandExecutor, ProcessExecutor};
use virtscen::virsh::{self, Virsh};

const TIMEOUT: Duration = Duration::from_secs(60);

/// One kind of libvirt object and the commands that remove it.
struct Kind {
    what: &'static str,
    list: &'static str,
    remove: [&'static str; 2],
}

const KINDS: [Kind; 2] = [
    Kind {
        what: "pool",
        list: "pool-list",
        remove: ["pool-destroy", "pool-undefine"],
    },
    Kind {
        what: "network",
        list: "net-list",
        remove: ["net-destroy", "net-undefine"],
    },
];

fn cleanup(exec: &ProcessExecutor, virsh: &Virsh, kind: &Kind) -> Result<usize> {
    let out = exec.execute(&virsh.cmd(kind.list).args(["--all", "--name"]), TIMEOUT)?;
    if !out.success() {
        return Err(eyre!("{} failed: {}", kind.list, out.stderr.trim()));
    }
    let leftovers: Vec<_> = virsh::parse_names(&out.stdout)
        .into_iter()
        .filter(|n| is_test_resource(n))
        .collect();
    if leftovers.is_empty() {
        info!("No integration test {}s found to clean up", kind.what);
        return Ok(0);
    }

    let mut cleaned = 0;
    for name in &leftovers {
        // The first step fails for inactive objects; only the last one counts
        let [stop, undefine] = kind.remove;
        exec.execute(&virsh.cmd(stop).arg(name.as_str()), TIMEOUT)?;
        let out = exec.execute(&virsh.cmd(undefine).arg(name.as_str()), TIMEOUT)?;
        if out.success() {
            info!("Removed {} {name}", kind.what);
            cleaned += 1;
        } else {
            warn!("Failed to remove {} {name}: {}", kind.what, out.stderr.trim());
        }
    }
    Ok(cleaned)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    color_eyre::install()?;

    let connect = std::env::var("VIRTSCEN_TEST_CONNECT").ok();
    let virsh = Virsh::new(Some(connect.as_deref().unwrap_or("qemu:///system")));
    let exec = ProcessExecutor::new()?;

    let mut errors = Vec::new();
    for kind in &KINDS {
        match cleanup(&exec, &virsh, kind) {
            Ok(n) => info!("Cleanup completed: {n} {}(s) removed", kind.what),
            Err(e) => {
                warn!("Error during {} cleanup: {e}", kind.what);
                errors.push(format!("{}: {e}", kind.what));
            }
        }
    }

    if !errors.is_empty() {
        eprintln!("Cleanup completed with errors: {}", errors.join(", "));
        std::process::exit(1);
    }
    Ok(())
}
