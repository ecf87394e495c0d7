//! virsh net-define / net-undefine
//!
//! Every existing network is backed up first and restored at the end, with
//! its active and autostart state, so the scenario may freely remove
//! networks. The test network is derived from the `default` network's XML.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::cmdext::CommandLine;
use crate::config::ScenarioConfig;
use crate::document::{Document, XmlTempFile};
use crate::error::{ConfigError, ScenarioError};
use crate::resources::{CleanupStep, Release, ResourceKind};
use crate::runner::{Scenario, ScenarioContext};
use crate::session::Session;
use crate::virsh::{self, NetState, Virsh};
use crate::wait::Retry;

/// Registry name.
pub const NAME: &str = "net-define-undefine";

/// Which arguments the define and undefine commands get.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "snake_case")]
enum OptionsRef {
    CorrectArg,
    NoOption,
    NotExistOption,
}

/// Which part of the define/undefine transaction is under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "snake_case")]
enum TransRef {
    Trans,
    Define,
    Undefine,
}

#[derive(Debug, Clone)]
struct Params {
    net_name: String,
    net_uuid: Option<String>,
    bridge: Option<String>,
    strip_ip: bool,
    options_ref: OptionsRef,
    trans_ref: TransRef,
    extra: String,
    remove_existing: bool,
    status_error: bool,
    check_states: bool,
    daemon_restart: CommandLine,
    retry: Retry,
}

impl Params {
    fn from_config(c: &ScenarioConfig) -> Result<Self, ConfigError> {
        let options_ref = c.choice(
            "options_ref",
            "correct_arg",
            &["correct_arg", "no_option", "not_exist_option"],
        )?;
        let trans_ref = c.choice("trans_ref", "trans", &["trans", "define", "undefine"])?;
        let extra = c.string("extra", "");
        // Reject bad quoting before anything runs
        let _ = CommandLine::new("virsh").extra(&extra)?;
        Ok(Self {
            net_name: c.string("net_name", "default"),
            net_uuid: c.optional("net_uuid"),
            bridge: c.optional("bridge"),
            strip_ip: c.flag("strip_ip", false)?,
            options_ref: options_ref
                .parse()
                .map_err(|_| ConfigError::Syntax(options_ref.clone()))?,
            trans_ref: trans_ref
                .parse()
                .map_err(|_| ConfigError::Syntax(trans_ref.clone()))?,
            extra,
            remove_existing: c.flag("remove_existing", true)?,
            status_error: c.flag("status_error", false)?,
            check_states: c.flag("check_states", false)?,
            daemon_restart: CommandLine::parse(
                &c.string("daemon_restart_cmd", "systemctl restart libvirtd"),
            )?,
            retry: Retry::from_config(c, 30)?,
        })
    }
}

/// Saved definition and state of a network.
#[derive(Debug, Clone)]
struct NetBackup {
    name: String,
    xml: String,
    state: NetState,
}

/// net-define/net-undefine scenario.
#[derive(Debug)]
pub struct NetDefineUndefine {
    params: Params,
    test_xml: Option<XmlTempFile>,
    define_status: Option<i32>,
    start_status: Option<i32>,
    undefine_status: Option<i32>,
}

/// Construct from parameters.
pub fn build(config: &ScenarioConfig) -> Result<Box<dyn Scenario>, ConfigError> {
    Ok(Box::new(NetDefineUndefine {
        params: Params::from_config(config)?,
        test_xml: None,
        define_status: None,
        start_status: None,
        undefine_status: None,
    }))
}

fn net_states(session: &mut Session) -> Result<BTreeMap<String, NetState>, ScenarioError> {
    let out = session.run_checked(&session.virsh().cmd("net-list").arg("--all"))?;
    Ok(virsh::parse_net_list(&out.stdout))
}

/// Destroy and undefine every network, ignoring failures.
fn remove_networks(
    session: &mut Session,
    virsh: &Virsh,
    nets: &BTreeMap<String, NetState>,
) -> Result<(), ScenarioError> {
    for (name, state) in nets {
        if state.active {
            session.run(&virsh.cmd("net-destroy").arg(name.as_str()))?;
        }
        if state.persistent {
            session.run(&virsh.cmd("net-undefine").arg(name.as_str()))?;
        }
    }
    Ok(())
}

fn restore_networks(session: &mut Session, virsh: &Virsh, backups: &[NetBackup]) -> Result<(), ScenarioError> {
    let leftovers = net_states(session)?;
    remove_networks(session, virsh, &leftovers)?;

    let mut errors = Vec::new();
    for backup in backups {
        let file = XmlTempFile::new(&backup.xml)?;
        let steps = [
            Some(virsh.cmd("net-define").arg(file.path().as_str())),
            backup
                .state
                .active
                .then(|| virsh.cmd("net-start").arg(backup.name.as_str())),
            backup
                .state
                .autostart
                .then(|| virsh.cmd("net-autostart").arg(backup.name.as_str())),
        ];
        for cmd in steps.into_iter().flatten() {
            if let Err(e) = session.run_checked(&cmd) {
                errors.push(format!("{}: {e}", backup.name));
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ScenarioError::Other(color_eyre::eyre::eyre!(
            "failed to restore networks: {}",
            errors.join("; ")
        )))
    }
}

impl NetDefineUndefine {
    fn define_command(&self, virsh: &Virsh) -> Result<CommandLine, ScenarioError> {
        let cmd = virsh.cmd("net-define");
        let cmd = match self.params.options_ref {
            OptionsRef::CorrectArg => match &self.test_xml {
                Some(file) => cmd.arg(file.path().as_str()),
                None => cmd,
            },
            OptionsRef::NoOption => cmd,
            OptionsRef::NotExistOption => cmd.arg("/not/exist/file"),
        };
        let extra = if self.params.trans_ref == TransRef::Define {
            self.params.extra.as_str()
        } else {
            ""
        };
        Ok(cmd.extra(extra)?)
    }

    fn undefine_command(&self, virsh: &Virsh) -> Result<CommandLine, ScenarioError> {
        let cmd = virsh.cmd("net-undefine");
        let cmd = match self.params.options_ref {
            OptionsRef::CorrectArg => cmd.arg(self.params.net_name.as_str()),
            OptionsRef::NoOption => cmd,
            OptionsRef::NotExistOption => cmd.arg("NOT_EXIST_NETWORK"),
        };
        Ok(cmd.extra(&self.params.extra)?)
    }

    /// Check the test network's state flags against the expected ones.
    fn check_state(
        &self,
        ctx: &mut ScenarioContext,
        what: &str,
        expected: NetState,
    ) -> Result<(), ScenarioError> {
        let states = net_states(ctx.session())?;
        let actual = states
            .get(&self.params.net_name)
            .copied()
            .unwrap_or_default();
        ctx.check(
            actual == expected,
            format!(
                "Found wrong network states for {what} network {}: {:?}",
                self.params.net_name, actual
            ),
        );
        Ok(())
    }

    fn check_lifecycle(&mut self, ctx: &mut ScenarioContext, virsh: &Virsh) -> Result<(), ScenarioError> {
        let name = self.params.net_name.clone();
        self.check_state(
            ctx,
            "started",
            NetState {
                active: true,
                autostart: false,
                persistent: true,
            },
        )?;

        ctx.run(&virsh.cmd("net-autostart").arg(name.as_str()))?;
        let states = net_states(ctx.session())?;
        ctx.check(
            states.get(&name).is_some_and(|s| s.autostart),
            format!("Failed to set autostart for network {name}"),
        );

        info!("Restarting libvirt daemon");
        ctx.run_checked(&self.params.daemon_restart)?;
        let list = virsh.cmd("list");
        ctx.wait_until("libvirt daemon to answer", self.params.retry, |s, _| {
            Ok(s.run(&list)?.success())
        })?;
        let states = net_states(ctx.session())?;
        ctx.check(
            states.get(&name).is_some_and(|s| s.active && s.autostart),
            format!(
                "Found wrong network state after restarting libvirtd: {:?}",
                states.get(&name)
            ),
        );

        let status = ctx.run(&self.undefine_command(virsh)?)?.exit_status;
        self.undefine_status = Some(status);
        if status == 0 {
            self.check_state(
                ctx,
                "undefined",
                NetState {
                    active: true,
                    autostart: false,
                    persistent: false,
                },
            )?;
        }
        Ok(())
    }
}

impl Scenario for NetDefineUndefine {
    fn name(&self) -> &str {
        NAME
    }

    fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        let virsh = ctx.virsh();
        let states = net_states(ctx.session())?;
        if !states.contains_key("default") {
            return Err(ScenarioError::Skipped(
                "test requires the default network to exist".into(),
            ));
        }

        let mut backups = Vec::new();
        for (name, state) in &states {
            let out = ctx.run_checked(&virsh.cmd("net-dumpxml").args(["--inactive", name.as_str()]))?;
            backups.push(NetBackup {
                name: name.clone(),
                xml: out.stdout,
                state: *state,
            });
        }
        debug!("Backed up networks: {states:?}");

        let default_xml = backups
            .iter()
            .find(|b| b.name == "default")
            .map(|b| b.xml.clone())
            .unwrap_or_default();
        let restore_virsh = virsh.clone();
        let restore = backups.clone();
        ctx.acquire(
            ResourceKind::Backup,
            "networks",
            Release::custom(move |s| restore_networks(s, &restore_virsh, &restore)),
        );

        let p = &self.params;
        let mut doc = Document::parse(&default_xml)?;
        doc.set("name", &p.net_name);
        match &p.net_uuid {
            Some(uuid) => doc.set("uuid", uuid),
            None => {
                doc.remove("uuid");
            }
        }
        if let Some(bridge) = &p.bridge {
            doc.set("bridge@name", bridge);
        }
        if p.strip_ip {
            doc.remove("ip");
        }
        debug!("Test network XML:\n{doc}");
        self.test_xml = Some(doc.write_temp()?);

        if p.remove_existing {
            remove_networks(ctx.session(), &virsh, &states)?;
        }
        Ok(())
    }

    fn action(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        let virsh = ctx.virsh();
        let name = self.params.net_name.clone();

        let define_status = ctx.run(&self.define_command(&virsh)?)?.exit_status;
        self.define_status = Some(define_status);
        if define_status == 0 {
            ctx.acquire(
                ResourceKind::Network,
                name.as_str(),
                Release::Steps(vec![
                    CleanupStep::tolerated(virsh.cmd("net-destroy").arg(name.as_str())),
                    CleanupStep::tolerated(virsh.cmd("net-undefine").arg(name.as_str())),
                ]),
            );
            if self.params.check_states {
                self.check_state(
                    ctx,
                    "defined",
                    NetState {
                        active: false,
                        autostart: false,
                        persistent: true,
                    },
                )?;
            }
            let start = ctx.run(&virsh.cmd("net-start").arg(name.as_str()))?;
            self.start_status = Some(start.exit_status);
        }

        if self.params.trans_ref == TransRef::Trans {
            if define_status != 0 {
                ctx.fail("Define network with right command failed.");
            } else if self.start_status != Some(0) {
                ctx.fail("Network is defined as expected, but failed to start it.");
            }
        }

        if self.params.check_states && !self.params.status_error {
            self.check_lifecycle(ctx, &virsh)?;
        }

        ctx.run(&virsh.cmd("net-destroy").arg(name.as_str()))?;

        if !self.params.check_states {
            let status = ctx.run(&self.undefine_command(&virsh)?)?.exit_status;
            self.undefine_status = Some(status);
        }
        Ok(())
    }

    fn verify(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        let defined = self.define_status == Some(0);
        let started = self.start_status == Some(0);
        let undefined = self.undefine_status == Some(0);
        match (self.params.status_error, self.params.trans_ref) {
            (true, TransRef::Undefine) => {
                ctx.check(!undefined, "Run successfully with wrong command.");
            }
            (true, _) if defined => {
                ctx.fail(if started {
                    "Define an unexpected network, and start it successfully."
                } else {
                    "Define an unexpected network, but start it failed."
                });
            }
            (true, _) => {}
            (false, TransRef::Undefine) => {
                ctx.check(
                    undefined,
                    "Define network for transaction successfully, but undefine failed.",
                );
            }
            (false, _) if !defined => ctx.fail("Run failed with right command"),
            (false, _) => {
                ctx.check(started, "Network is defined as expected, but start it failed.");
            }
        }
        Ok(())
    }
}
