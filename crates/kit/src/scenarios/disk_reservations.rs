//! Block disk with SCSI persistent reservations
//!
//! Adds a `lun` disk backed by a host block device to an inactive domain,
//! optionally with CHAP authentication through a libvirt secret, then boots
//! the domain and checks the reservations settings made it into the live
//! definition. The block device itself is provided by the caller.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;
use tracing::debug;

use super::{backup_domain, domain_running};
use crate::config::ScenarioConfig;
use crate::document::{Document, XmlTempFile};
use crate::error::{ConfigError, ScenarioError};
use crate::libvirt_xml::{
    AuthPlace, DiskAuth, DiskBuilder, DiskSource, Reservations, SecretBuilder, SecretRef,
};
use crate::resources::{Release, ResourceKind};
use crate::runner::{Scenario, ScenarioContext};
use crate::virsh;

/// Registry name.
pub const NAME: &str = "disk-reservations";

#[derive(Debug, Clone)]
struct Params {
    vm: String,
    source_dev: String,
    device: String,
    target_dev: String,
    device_format: String,
    device_type: String,
    device_bus: String,
    reservations: Reservations,
    chap_user: String,
    chap_passwd: String,
    auth_uuid: bool,
    auth_usage: bool,
    secret_usage_target: String,
    auth_place: AuthPlace,
    uuid: Option<String>,
    status_error: bool,
    define_error: bool,
    expect_error: Option<Regex>,
}

impl Params {
    fn from_config(c: &ScenarioConfig) -> Result<Self, ConfigError> {
        let reservations = if c.flag("reservations_managed", true)? {
            Reservations::Managed
        } else {
            Reservations::Unmanaged {
                source_type: c.string("reservations_source_type", "unix"),
                path: c.string("reservations_source_path", "/var/run/qemu-pr-helper.sock"),
                mode: c.choice("reservations_source_mode", "client", &["client", "server"])?,
            }
        };
        let auth_place = c.choice("auth_place", "source", &["source", "disk", "both"])?;
        let expect_error = c
            .optional("expect_error_pattern")
            .map(|p| Regex::new(&p).map_err(|e| ConfigError::Syntax(format!("expect_error_pattern: {e}"))))
            .transpose()?;
        Ok(Self {
            vm: c.required("main_vm")?,
            source_dev: c.required("source_dev")?,
            device: c.string("device", "lun"),
            target_dev: c.string("target_dev", "sdb"),
            device_format: c.string("device_format", "raw"),
            device_type: c.choice("device_type", "block", &["block", "file"])?,
            device_bus: c.string("device_bus", "scsi"),
            reservations,
            chap_user: c.string("chap_user", ""),
            chap_passwd: c.string("chap_passwd", ""),
            auth_uuid: c.flag("auth_uuid", false)?,
            auth_usage: c.flag("auth_usage", false)?,
            secret_usage_target: c.string("secret_usage_target", "libvirtiscsi"),
            auth_place: auth_place
                .parse()
                .map_err(|_| ConfigError::Syntax(auth_place.clone()))?,
            uuid: c.optional("uuid"),
            status_error: c.flag("status_error", false)?,
            define_error: c.flag("define_error", false)?,
            expect_error,
        })
    }

    fn wants_auth(&self) -> bool {
        self.auth_uuid || self.auth_usage
    }

    fn wants_secret(&self) -> bool {
        self.wants_auth() && !self.chap_user.is_empty() && !self.chap_passwd.is_empty()
    }
}

/// Disk reservations scenario.
#[derive(Debug)]
pub struct DiskReservations {
    params: Params,
    secret_uuid: Option<String>,
    domain_xml: Option<XmlTempFile>,
    started: bool,
}

/// Construct from parameters.
pub fn build(config: &ScenarioConfig) -> Result<Box<dyn Scenario>, ConfigError> {
    Ok(Box::new(DiskReservations {
        params: Params::from_config(config)?,
        secret_uuid: None,
        domain_xml: None,
        started: false,
    }))
}

impl DiskReservations {
    fn define_secret(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        let virsh = ctx.virsh();
        let xml = SecretBuilder::iscsi(&self.params.secret_usage_target)
            .with_description("virtscen iSCSI CHAP secret")
            .build_xml()?;
        let file = XmlTempFile::new(&xml)?;
        let out = ctx.run_checked(&virsh.cmd("secret-define").arg(file.path().as_str()))?;
        let uuid = virsh::parse_secret_uuid(&out.stdout).ok_or_else(|| {
            color_eyre::eyre::eyre!("No secret UUID in secret-define output: {}", out.stdout.trim())
        })?;
        ctx.acquire(
            ResourceKind::Secret,
            uuid.as_str(),
            Release::command(virsh.cmd("secret-undefine").arg(uuid.as_str())),
        );
        let value = STANDARD.encode(&self.params.chap_passwd);
        ctx.run_checked(&virsh.cmd("secret-set-value").args([uuid.as_str(), value.as_str()]))?;
        self.secret_uuid = Some(uuid);
        Ok(())
    }

    fn disk(&self) -> DiskBuilder {
        let p = &self.params;
        let source = match p.device_type.as_str() {
            "file" => DiskSource::File {
                path: p.source_dev.clone(),
            },
            _ => DiskSource::Block {
                dev: p.source_dev.clone(),
            },
        };
        let mut disk = DiskBuilder::new(source, &p.target_dev)
            .with_device(&p.device)
            .with_driver_type(&p.device_format)
            .with_bus(&p.device_bus)
            .with_reservations(p.reservations.clone());
        if p.wants_auth() {
            // A configured uuid overrides the real one to provoke lookup errors
            let secret = if p.auth_uuid {
                SecretRef::Uuid(
                    p.uuid
                        .clone()
                        .or_else(|| self.secret_uuid.clone())
                        .unwrap_or_default(),
                )
            } else {
                SecretRef::Usage(p.secret_usage_target.clone())
            };
            disk = disk.with_auth(DiskAuth {
                username: p.chap_user.clone(),
                secret_type: "iscsi".to_owned(),
                secret,
                place: p.auth_place,
            });
        }
        disk
    }
}

impl Scenario for DiskReservations {
    fn name(&self) -> &str {
        NAME
    }

    fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        let vm = self.params.vm.clone();
        backup_domain(ctx, &vm)?;
        if domain_running(ctx, &vm)? {
            ctx.run_checked(&ctx.virsh().cmd("destroy").arg(vm.as_str()))?;
        }
        if self.params.wants_secret() {
            self.define_secret(ctx)?;
        }
        Ok(())
    }

    fn action(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        let virsh = ctx.virsh();
        let p = self.params.clone();

        let out = ctx.run_checked(&virsh.cmd("dumpxml").args(["--inactive", p.vm.as_str()]))?;
        let mut doc = Document::parse(&out.stdout)?;
        doc.append("devices", self.disk().build_node());
        debug!("Domain XML with test disk:\n{doc}");
        let file = doc.write_temp()?;

        let define = ctx.run(&virsh.cmd("define").arg(file.path().as_str()))?;
        self.domain_xml = Some(file);
        if !define.success() {
            if !p.define_error {
                ctx.fail(format!("Failed to define VM:\n{}", define.stderr.trim()));
            }
            return Ok(());
        }
        if p.define_error {
            ctx.fail("VM defined unexpectedly.");
            return Ok(());
        }

        let start = ctx.run(&virsh.cmd("start").arg(p.vm.as_str()))?;
        if start.success() {
            self.started = true;
            if p.status_error {
                ctx.fail("VM started unexpectedly.");
            }
        } else if !p.status_error {
            ctx.fail(format!("VM failed to start. Error: {}", start.stderr.trim()));
        } else if let Some(pattern) = &p.expect_error {
            ctx.check(
                pattern.is_match(&start.stderr),
                format!(
                    "Start error does not match '{pattern}': {}",
                    start.stderr.trim()
                ),
            );
        }
        Ok(())
    }

    fn verify(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        if !self.started {
            return Ok(());
        }
        let p = &self.params;
        let out = ctx.run_checked(&ctx.virsh().cmd("dumpxml").arg(p.vm.as_str()))?;
        let doc = Document::parse(&out.stdout)?;
        let disks = doc.nodes("devices/disk");
        let disk = disks.iter().find(|d| {
            d.child("target")
                .and_then(|t| t.attr("dev"))
                .is_some_and(|dev| dev == p.target_dev)
        });
        let Some(disk) = disk else {
            ctx.fail(format!("Disk {} not found in live domain XML", p.target_dev));
            return Ok(());
        };
        let expected = match p.reservations {
            Reservations::Managed => "yes",
            Reservations::Unmanaged { .. } => "no",
        };
        let managed = disk
            .child("source")
            .and_then(|s| s.child("reservations"))
            .and_then(|r| r.attr("managed"));
        ctx.check(
            managed == Some(expected),
            format!(
                "Disk {} reservations managed={:?}, expected {expected}",
                p.target_dev, managed
            ),
        );
        Ok(())
    }
}
