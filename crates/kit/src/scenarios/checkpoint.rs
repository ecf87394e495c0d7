//! Domain checkpoint creation

use crate::config::ScenarioConfig;
use crate::document::{Document, XmlTempFile};
use crate::error::{ConfigError, ScenarioError};
use crate::libvirt_xml::{checkpoint_xml, parse_checkpoint_disks, CheckpointDisk};
use crate::resources::{Release, ResourceKind};
use crate::runner::{Scenario, ScenarioContext};
use crate::virsh;

/// Registry name.
pub const NAME: &str = "checkpoint";

#[derive(Debug, Clone)]
struct Params {
    vm: String,
    name: String,
    description: Option<String>,
    disks: Vec<CheckpointDisk>,
}

impl Params {
    fn from_config(c: &ScenarioConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            vm: c.required("main_vm")?,
            name: c.string("checkpoint_name", "checkpoint_1"),
            description: c.optional("checkpoint_description"),
            disks: parse_checkpoint_disks(&c.string("checkpoint_disks", "vda:no,vdb:bitmap:bt1"))?,
        })
    }
}

/// Checkpoint scenario.
#[derive(Debug)]
pub struct Checkpoint {
    params: Params,
    descriptor: Option<XmlTempFile>,
}

/// Construct from parameters.
pub fn build(config: &ScenarioConfig) -> Result<Box<dyn Scenario>, ConfigError> {
    Ok(Box::new(Checkpoint {
        params: Params::from_config(config)?,
        descriptor: None,
    }))
}

fn list_checkpoints(ctx: &mut ScenarioContext, vm: &str) -> Result<Vec<String>, ScenarioError> {
    let out = ctx.run_checked(&ctx.virsh().cmd("checkpoint-list").args([vm, "--name"]))?;
    Ok(virsh::parse_names(&out.stdout))
}

impl Scenario for Checkpoint {
    fn name(&self) -> &str {
        NAME
    }

    fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        let p = &self.params;
        if !ctx.run(&ctx.virsh().cmd("dominfo").arg(p.vm.as_str()))?.success() {
            return Err(ScenarioError::Precondition(format!(
                "domain {} does not exist",
                p.vm
            )));
        }
        if list_checkpoints(ctx, &p.vm)?.contains(&p.name) {
            return Err(ScenarioError::Precondition(format!(
                "checkpoint {} already exists on {}",
                p.name, p.vm
            )));
        }
        Ok(())
    }

    fn action(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        let virsh = ctx.virsh();
        let p = &self.params;
        let xml = checkpoint_xml(&p.name, p.description.as_deref(), &p.disks)?;
        let file = XmlTempFile::new(&xml)?;
        ctx.run_checked(
            &virsh
                .cmd("checkpoint-create")
                .args([p.vm.as_str(), file.path().as_str()]),
        )?;
        ctx.acquire(
            ResourceKind::Checkpoint,
            p.name.as_str(),
            Release::command(
                virsh
                    .cmd("checkpoint-delete")
                    .args([p.vm.as_str(), p.name.as_str()]),
            ),
        );
        self.descriptor = Some(file);
        Ok(())
    }

    fn verify(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        let p = &self.params;
        let listed = list_checkpoints(ctx, &p.vm)?;
        ctx.check(
            listed.contains(&p.name),
            format!("checkpoint {} is not listed for {}", p.name, p.vm),
        );

        let out = ctx.run_checked(
            &ctx.virsh()
                .cmd("checkpoint-dumpxml")
                .args([p.vm.as_str(), p.name.as_str()]),
        )?;
        let doc = Document::parse(&out.stdout)?;
        ctx.check(
            doc.get("name").as_deref() == Some(p.name.as_str()),
            format!("checkpoint name is {:?}, expected {}", doc.get("name"), p.name),
        );
        if let Some(description) = &p.description {
            ctx.check(
                doc.get("description").as_deref() == Some(description.as_str()),
                format!(
                    "checkpoint description is {:?}, expected {description}",
                    doc.get("description")
                ),
            );
        }

        let dumped = doc.nodes("disks/disk");
        for disk in &p.disks {
            let found = dumped
                .iter()
                .find(|d| d.attr("name") == Some(disk.name.as_str()));
            let Some(found) = found else {
                ctx.fail(format!("disk {} missing from checkpoint XML", disk.name));
                continue;
            };
            ctx.check(
                found.attr("checkpoint") == Some(disk.checkpoint.as_str()),
                format!(
                    "disk {} has checkpoint mode {:?}, expected {}",
                    disk.name,
                    found.attr("checkpoint"),
                    disk.checkpoint
                ),
            );
            if let Some(bitmap) = &disk.bitmap {
                ctx.check(
                    found.attr("bitmap") == Some(bitmap.as_str()),
                    format!(
                        "disk {} has bitmap {:?}, expected {bitmap}",
                        disk.name,
                        found.attr("bitmap")
                    ),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdext::CommandOutput;
    use crate::executor::scripted::ScriptedExecutor;
    use crate::result::{Outcome, ScenarioResult};
    use crate::runner::Runner;
    use indoc::indoc;
    use std::sync::Arc;

    const DUMPED: &str = indoc! {r#"
        <domaincheckpoint>
          <name>checkpoint_1</name>
          <description>nightly</description>
          <creationTime>1760870400</creationTime>
          <disks>
            <disk name="vda" checkpoint="no"/>
            <disk name="vdb" checkpoint="bitmap" bitmap="bt1"/>
          </disks>
        </domaincheckpoint>
    "#};

    fn run(
        config: &[(&str, &str)],
        exec: ScriptedExecutor,
    ) -> (ScenarioResult, Arc<ScriptedExecutor>) {
        let exec = Arc::new(exec);
        let mut all: Vec<(&str, &str)> = vec![("main_vm", "vm1")];
        all.extend_from_slice(config);
        let config: ScenarioConfig = all.into_iter().collect();
        let mut scenario = build(&config).unwrap();
        let result = Runner::new(exec.clone()).run(scenario.as_mut());
        (result, exec)
    }

    fn created() -> ScriptedExecutor {
        ScriptedExecutor::new()
            .once("virsh checkpoint-list vm1", CommandOutput::ok(""))
            .on("virsh checkpoint-list vm1", CommandOutput::ok("checkpoint_1\n"))
            .on("virsh checkpoint-dumpxml vm1 checkpoint_1", CommandOutput::ok(DUMPED))
    }

    #[test]
    fn test_checkpoint_created_and_deleted() {
        let (result, exec) = run(&[("checkpoint_description", "nightly")], created());
        assert!(result.success(), "{:?}", result.messages());
        assert_eq!(exec.count("virsh checkpoint-create vm1"), 1);
        assert_eq!(exec.count("virsh checkpoint-delete vm1 checkpoint_1"), 1);
        assert_eq!(result.released(), ["checkpoint:checkpoint_1"]);
    }

    #[test]
    fn test_missing_domain() {
        let exec = ScriptedExecutor::new().on(
            "virsh dominfo vm1",
            CommandOutput::failed(1, "error: failed to get domain 'vm1'"),
        );
        let (result, exec) = run(&[], exec);
        assert_eq!(result.outcome(), Outcome::Failed);
        assert_eq!(
            result.messages(),
            ["Setup failed: precondition not met: domain vm1 does not exist"]
        );
        assert_eq!(exec.count("virsh checkpoint-create"), 0);
    }

    #[test]
    fn test_existing_checkpoint() {
        let exec = ScriptedExecutor::new()
            .on("virsh checkpoint-list vm1", CommandOutput::ok("checkpoint_1\n"));
        let (result, exec) = run(&[], exec);
        assert_eq!(result.outcome(), Outcome::Failed);
        assert_eq!(exec.count("virsh checkpoint-create"), 0);
        assert!(result.released().is_empty());
    }

    #[test]
    fn test_dumped_modes_are_checked() {
        let (result, _) = run(
            &[
                ("checkpoint_description", "weekly"),
                ("checkpoint_disks", "vda:bitmap,vdc:no"),
            ],
            created(),
        );
        assert_eq!(
            result.messages(),
            [
                r#"checkpoint description is Some("nightly"), expected weekly"#,
                r#"disk vda has checkpoint mode Some("no"), expected bitmap"#,
                "disk vdc missing from checkpoint XML",
            ]
        );
    }

    #[test]
    fn test_bad_disk_spec() {
        let config: ScenarioConfig = [("main_vm", "vm1"), ("checkpoint_disks", "vda:maybe")]
            .into_iter()
            .collect();
        assert!(matches!(build(&config).unwrap_err(), ConfigError::Syntax(_)));
    }
}
