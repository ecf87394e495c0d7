//! Storage pool lifecycle
//!
//! Defines a pool (from a descriptor file or with `pool-define-as`),
//! optionally builds it and creates a volume, starts it, and checks the
//! resulting state. For NPIV setups a vHBA can be created from a WWNN/WWPN
//! pair first, and with a domain configured the first volume of the pool is
//! hot-plugged into it and detached again.

use camino::Utf8PathBuf;
use tracing::{debug, info};

use super::{backup_domain, domain_running};
use crate::cmdext::CommandLine;
use crate::config::ScenarioConfig;
use crate::document::XmlTempFile;
use crate::error::{ConfigError, ScenarioError};
use crate::libvirt_xml::{vhba_xml, DiskBuilder, DiskSource};
use crate::resources::{CleanupStep, Release, ResourceHandle, ResourceKind};
use crate::runner::{Scenario, ScenarioContext};
use crate::virsh;
use crate::wait::Retry;

/// Registry name.
pub const NAME: &str = "pool-volume";

#[derive(Debug, Clone)]
struct Params {
    pool_name: String,
    pool_type: String,
    pool_target: String,
    define_pool: bool,
    pool_xml_file: Option<Utf8PathBuf>,
    need_pool_build: bool,
    need_vol_create: bool,
    volume_name: String,
    volume_capacity: String,
    allocation: String,
    volume_format: String,
    source_dev: Option<String>,
    source_name: Option<String>,
    source_format: Option<String>,
    adapter_type: Option<String>,
    adapter_parent: Option<String>,
    pool_wwnn: Option<String>,
    pool_wwpn: Option<String>,
    vhba: Option<(String, String)>,
    expect_active: bool,
    main_vm: Option<String>,
    target_dev: String,
    retry: Retry,
}

impl Params {
    fn from_config(c: &ScenarioConfig) -> Result<Self, ConfigError> {
        let define_pool = c.flag("define_pool", false)?;
        let define_pool_as = c.flag("define_pool_as", true)?;
        let pool_xml_file = c.optional("pool_xml_file").map(Utf8PathBuf::from);
        if define_pool && pool_xml_file.is_none() {
            return Err(ConfigError::Missing("pool_xml_file".into()));
        }
        if !define_pool && !define_pool_as {
            return Err(ConfigError::Syntax(
                "one of define_pool or define_pool_as must be enabled".into(),
            ));
        }
        let vhba = match (c.optional("vhba_wwnn"), c.optional("vhba_wwpn")) {
            (Some(wwnn), Some(wwpn)) => Some((wwnn, wwpn)),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("vhba_wwpn".into())),
            (None, Some(_)) => return Err(ConfigError::Missing("vhba_wwnn".into())),
        };
        Ok(Self {
            pool_name: c.string("pool_name", "virt_test_pool_tmp"),
            pool_type: c.string("pool_type", "dir"),
            pool_target: c.string("pool_target", "pool_target"),
            define_pool,
            pool_xml_file,
            need_pool_build: c.flag("need_pool_build", false)?,
            need_vol_create: c.flag("need_vol_create", false)?,
            volume_name: c.string("volume_name", "imagefrommapper.qcow2"),
            volume_capacity: c.string("volume_capacity", "1G"),
            allocation: c.string("allocation", "1G"),
            volume_format: c.string("volume_format", "raw"),
            source_dev: c.optional("source_dev"),
            source_name: c.optional("source_name"),
            source_format: c.optional("source_format"),
            adapter_type: c.optional("pool_adapter_type"),
            adapter_parent: c.optional("pool_adapter_parent"),
            pool_wwnn: c.optional("pool_wwnn"),
            pool_wwpn: c.optional("pool_wwpn"),
            vhba,
            expect_active: c.flag("expect_active", true)?,
            main_vm: c.optional("main_vm"),
            target_dev: c.string("target_dev", "vdb"),
            retry: Retry::from_config(c, 15)?,
        })
    }

    fn is_scsi(&self) -> bool {
        self.pool_type == "scsi"
    }
}

/// Pool lifecycle scenario.
#[derive(Debug)]
pub struct PoolVolume {
    params: Params,
    hba_parent: Option<String>,
    old_disk_count: usize,
    disk: Option<ResourceHandle>,
    pool_xml: Option<XmlTempFile>,
    vhba_xml: Option<XmlTempFile>,
    disk_xml: Option<XmlTempFile>,
}

/// Construct from parameters.
pub fn build(config: &ScenarioConfig) -> Result<Box<dyn Scenario>, ConfigError> {
    Ok(Box::new(PoolVolume {
        params: Params::from_config(config)?,
        hba_parent: None,
        old_disk_count: 0,
        disk: None,
        pool_xml: None,
        vhba_xml: None,
        disk_xml: None,
    }))
}

fn count_fc_hosts(ctx: &mut ScenarioContext) -> Result<usize, ScenarioError> {
    let out = ctx.run_checked(&ctx.virsh().cmd("nodedev-list").args(["--cap", "fc_host"]))?;
    Ok(virsh::parse_names(&out.stdout).len())
}

fn domain_disk_count(ctx: &mut ScenarioContext, vm: &str) -> Result<usize, ScenarioError> {
    let out = ctx.run_checked(&ctx.virsh().cmd("domblklist").arg(vm))?;
    Ok(virsh::parse_domblklist(&out.stdout).len())
}

impl PoolVolume {
    fn create_vhba(&mut self, ctx: &mut ScenarioContext, parent: &str) -> Result<(), ScenarioError> {
        let Some((wwnn, wwpn)) = self.params.vhba.clone() else {
            return Ok(());
        };
        let before = count_fc_hosts(ctx)?;
        let file = XmlTempFile::new(&vhba_xml(parent, &wwnn, &wwpn)?)?;
        let virsh = ctx.virsh();
        let out = ctx.run_checked(&virsh.cmd("nodedev-create").arg(file.path().as_str()))?;
        let name = virsh::parse_created_nodedev(&out.stdout).ok_or_else(|| {
            ScenarioError::Other(color_eyre::eyre::eyre!(
                "Could not find vHBA name in: {}",
                out.stdout.trim()
            ))
        })?;
        info!("Created vHBA {name}");
        ctx.acquire(
            ResourceKind::NodeDevice,
            name.as_str(),
            Release::command(virsh.cmd("nodedev-destroy").arg(name.as_str())),
        );
        self.vhba_xml = Some(file);
        ctx.wait_until("vHBA to appear", self.params.retry, |s, _| {
            let out = s.run_checked(&virsh.cmd("nodedev-list").args(["--cap", "fc_host"]))?;
            Ok(virsh::parse_names(&out.stdout).len() > before)
        })
    }

    fn define_command(&mut self, ctx: &mut ScenarioContext) -> Result<CommandLine, ScenarioError> {
        let p = &self.params;
        let virsh = ctx.virsh();
        if let (true, Some(path)) = (p.define_pool, &p.pool_xml_file) {
            let mut doc = ctx.documents().load(path)?;
            doc.set("name", &p.pool_name);
            let adapter = [
                ("source/adapter@type", &p.adapter_type),
                ("source/adapter@parent", &self.hba_parent),
                ("source/adapter@wwnn", &p.pool_wwnn),
                ("source/adapter@wwpn", &p.pool_wwpn),
            ];
            for (field, value) in adapter {
                if let Some(value) = value {
                    doc.set(field, value);
                }
            }
            let file = doc.write_temp()?;
            let cmd = virsh.cmd("pool-define").arg(file.path().as_str());
            self.pool_xml = Some(file);
            return Ok(cmd);
        }

        let mut cmd = virsh
            .cmd("pool-define-as")
            .arg(p.pool_name.as_str())
            .arg(p.pool_type.as_str())
            .opt("--source-dev", p.source_dev.as_deref())
            .opt("--source-name", p.source_name.as_deref())
            .opt("--source-format", p.source_format.as_deref())
            .opt("--target", Some(p.pool_target.as_str()));
        if p.is_scsi() {
            cmd = cmd
                .opt("--adapter-wwnn", p.pool_wwnn.as_deref())
                .opt("--adapter-wwpn", p.pool_wwpn.as_deref())
                .opt("--adapter-parent", self.hba_parent.as_deref());
        }
        Ok(cmd)
    }
}

impl Scenario for PoolVolume {
    fn name(&self) -> &str {
        NAME
    }

    fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        let p = self.params.clone();
        if p.is_scsi() && p.pool_wwnn.is_none() && p.pool_wwpn.is_none() {
            return Err(ScenarioError::Skipped(
                "no wwnn/wwpn provided for npiv scsi pool".into(),
            ));
        }

        let out = ctx.run_checked(&ctx.virsh().cmd("pool-list").args(["--all", "--name"]))?;
        if virsh::parse_names(&out.stdout).contains(&p.pool_name) {
            return Err(ScenarioError::Precondition(format!(
                "pool {} already exists",
                p.pool_name
            )));
        }

        if p.vhba.is_some() || p.is_scsi() {
            let out = ctx.run_checked(&ctx.virsh().cmd("nodedev-list").args(["--cap", "vports"]))?;
            let hbas = virsh::parse_names(&out.stdout);
            debug!("Online HBAs: {hbas:?}");
            let Some(first) = hbas.first() else {
                return Err(ScenarioError::Skipped("host has no online HBA".into()));
            };
            let parent = p.adapter_parent.clone().unwrap_or_else(|| first.clone());
            self.create_vhba(ctx, &parent)?;
            self.hba_parent = Some(parent);
        }

        if let Some(vm) = &p.main_vm {
            backup_domain(ctx, vm)?;
            if !domain_running(ctx, vm)? {
                ctx.run_checked(&ctx.virsh().cmd("start").arg(vm.as_str()))?;
            }
        }
        Ok(())
    }

    fn action(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        let p = self.params.clone();
        let virsh = ctx.virsh();

        let define = self.define_command(ctx)?;
        ctx.run_checked(&define)?;
        let mut release = vec![CleanupStep::tolerated(
            virsh.cmd("pool-destroy").arg(p.pool_name.as_str()),
        )];
        if p.need_pool_build {
            release.push(CleanupStep::tolerated(
                virsh.cmd("pool-delete").arg(p.pool_name.as_str()),
            ));
        }
        release.push(CleanupStep::required(
            virsh.cmd("pool-undefine").arg(p.pool_name.as_str()),
        ));
        ctx.acquire(ResourceKind::Pool, p.pool_name.as_str(), Release::Steps(release));

        if p.need_pool_build {
            ctx.run_checked(&virsh.cmd("pool-build").arg(p.pool_name.as_str()))?;
        }
        ctx.run_checked(&virsh.cmd("pool-start").arg(p.pool_name.as_str()))?;
        info!("Started pool {}", p.pool_name);

        if p.need_vol_create {
            ctx.run_checked(
                &virsh
                    .cmd("vol-create-as")
                    .args([p.pool_name.as_str(), p.volume_name.as_str()])
                    .arg(p.volume_capacity.as_str())
                    .opt("--allocation", Some(p.allocation.as_str()))
                    .opt("--format", Some(p.volume_format.as_str())),
            )?;
            ctx.acquire(
                ResourceKind::Volume,
                p.volume_name.as_str(),
                Release::command(
                    virsh
                        .cmd("vol-delete")
                        .arg(p.volume_name.as_str())
                        .opt("--pool", Some(p.pool_name.as_str())),
                ),
            );
        }

        let Some(vm) = &p.main_vm else {
            return Ok(());
        };

        let vol_list = virsh.cmd("vol-list").arg(p.pool_name.as_str());
        let mut volume = None;
        ctx.wait_until(
            &format!("volumes in pool {}", p.pool_name),
            p.retry,
            |s, _| {
                let out = s.run_checked(&vol_list)?;
                volume = virsh::parse_vol_list(&out.stdout)
                    .into_iter()
                    .next()
                    .map(|(name, _)| name);
                Ok(volume.is_some())
            },
        )?;
        let Some(volume) = volume else {
            return Ok(());
        };
        info!("Using volume {volume} to attach to {vm}");

        self.old_disk_count = domain_disk_count(ctx, vm)?;
        let disk = DiskBuilder::new(
            DiskSource::Volume {
                pool: p.pool_name.clone(),
                volume,
            },
            &p.target_dev,
        )
        .with_driver_type(&p.volume_format);
        let file = XmlTempFile::new(&disk.build_xml()?)?;
        let path = file.path().as_str().to_owned();
        ctx.run_checked(&virsh.cmd("attach-device").args([vm.as_str(), path.as_str()]))?;
        self.disk = Some(ctx.acquire(
            ResourceKind::Disk,
            p.target_dev.as_str(),
            Release::command(virsh.cmd("detach-device").args([vm.as_str(), path.as_str()])),
        ));
        self.disk_xml = Some(file);
        Ok(())
    }

    fn verify(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        let p = &self.params;
        let out = ctx.run_checked(&ctx.virsh().cmd("pool-info").arg(p.pool_name.as_str()))?;
        let info = virsh::parse_info(&out.stdout);
        let state = info.get("State").map(String::as_str).unwrap_or("unknown");
        let active = state == "running";
        ctx.check(
            active == p.expect_active,
            format!(
                "pool {} is {}, expected it to be {}",
                p.pool_name,
                state,
                if p.expect_active { "running" } else { "inactive" }
            ),
        );

        if let (Some(vm), Some(disk)) = (&p.main_vm, self.disk) {
            let new_count = domain_disk_count(ctx, vm)?;
            ctx.check(
                new_count > self.old_disk_count,
                format!(
                    "domain {} has {} disks after attach, had {}",
                    vm, new_count, self.old_disk_count
                ),
            );
            if let Err(e) = ctx.release(disk) {
                ctx.fail(format!("failed to detach disk: {e}"));
            }
        }
        Ok(())
    }
}
