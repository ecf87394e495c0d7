//! Built-in libvirt scenarios
//!
//! Each scenario is constructed from a [`ScenarioConfig`]; parameter errors
//! surface at construction time so nothing runs with a bad configuration.

use color_eyre::{eyre::eyre, Result};
use itertools::Itertools;

use crate::config::ScenarioConfig;
use crate::document::{Document, XmlTempFile};
use crate::error::{ConfigError, ScenarioError};
use crate::resources::{Release, ResourceHandle, ResourceKind};
use crate::runner::{Scenario, ScenarioContext};

pub mod checkpoint;
pub mod disk_reservations;
pub mod net_define_undefine;
pub mod pool_volume;

/// A registered scenario.
#[derive(Debug)]
pub struct ScenarioEntry {
    /// Name used on the command line
    pub name: &'static str,
    /// One-line description
    pub summary: &'static str,
    /// Constructor from parameters
    pub build: fn(&ScenarioConfig) -> Result<Box<dyn Scenario>, ConfigError>,
}

/// All built-in scenarios.
pub static SCENARIOS: &[ScenarioEntry] = &[
    ScenarioEntry {
        name: pool_volume::NAME,
        summary: "Storage pool lifecycle with optional NPIV vHBA and volume attach",
        build: pool_volume::build,
    },
    ScenarioEntry {
        name: net_define_undefine::NAME,
        summary: "virsh net-define / net-undefine with state checks",
        build: net_define_undefine::build,
    },
    ScenarioEntry {
        name: disk_reservations::NAME,
        summary: "Block disk with SCSI persistent reservations and iSCSI auth",
        build: disk_reservations::build,
    },
    ScenarioEntry {
        name: checkpoint::NAME,
        summary: "Domain checkpoint creation from a generated descriptor",
        build: checkpoint::build,
    },
];

/// Look up a scenario by name.
pub fn find(name: &str) -> Option<&'static ScenarioEntry> {
    SCENARIOS.iter().find(|s| s.name == name)
}

/// Construct the named scenario from `config`.
pub fn build(name: &str, config: &ScenarioConfig) -> Result<Box<dyn Scenario>> {
    let entry = find(name).ok_or_else(|| {
        let known = SCENARIOS.iter().map(|s| s.name).join(", ");
        eyre!("Unknown scenario '{}' (known: {})", name, known)
    })?;
    Ok((entry.build)(config)?)
}

/// Whether the domain is currently running.
pub(crate) fn domain_running(ctx: &mut ScenarioContext, vm: &str) -> Result<bool, ScenarioError> {
    let out = ctx.run(&ctx.virsh().cmd("domstate").arg(vm))?;
    Ok(out.success() && out.stdout.trim() == "running")
}

/// Save the inactive definition of `vm` and restore it during cleanup.
///
/// The restore forcibly stops the domain first, since a running domain
/// would keep the test devices until its next boot.
pub(crate) fn backup_domain(
    ctx: &mut ScenarioContext,
    vm: &str,
) -> Result<ResourceHandle, ScenarioError> {
    let virsh = ctx.virsh();
    let out = ctx.run_checked(&virsh.cmd("dumpxml").args(["--inactive", vm]))?;
    // Validate before trusting it for the restore
    Document::parse(&out.stdout)?;
    let backup = XmlTempFile::new(&out.stdout)?;
    let vm = vm.to_owned();
    let label = vm.clone();
    Ok(ctx.acquire(
        ResourceKind::Backup,
        label,
        Release::custom(move |s| {
            s.run(&virsh.cmd("destroy").arg(vm.as_str()))?;
            s.run_checked(&virsh.cmd("define").arg(backup.path().as_str()))?;
            Ok(())
        }),
    ))
}
