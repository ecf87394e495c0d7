//! Human and JSON rendering of scenario listings and results

use color_eyre::{eyre::Context, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use crate::result::ScenarioResult;
use crate::scenarios::ScenarioEntry;

/// Serializable view of a registered scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioInfo {
    /// Name used on the command line
    pub name: &'static str,
    /// One-line description
    pub summary: &'static str,
}

impl From<&ScenarioEntry> for ScenarioInfo {
    fn from(entry: &ScenarioEntry) -> Self {
        Self {
            name: entry.name,
            summary: entry.summary,
        }
    }
}

/// Table of available scenarios.
pub fn scenarios_table(entries: &[ScenarioEntry]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["NAME", "DESCRIPTION"]);
    for entry in entries {
        table.add_row(vec![entry.name, entry.summary]);
    }
    table
}

/// Table of the diagnostics of a run, or `None` when there are none.
pub fn diagnostics_table(result: &ScenarioResult) -> Option<Table> {
    if result.diagnostics().is_empty() {
        return None;
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["PHASE", "KIND", "MESSAGE"]);
    for d in result.diagnostics() {
        table.add_row(vec![d.phase.to_string(), d.kind.to_string(), d.message.clone()]);
    }
    Some(table)
}

/// One-line summary such as `pool-volume: passed in 1.2s, released 3 resources`.
pub fn summary_line(result: &ScenarioResult) -> String {
    let released = result.released().len();
    format!(
        "{}: {} in {:.1}s, released {} resource{}",
        result.scenario(),
        result.outcome(),
        result.duration().as_secs_f64(),
        released,
        if released == 1 { "" } else { "s" }
    )
}

/// Pretty JSON for `--json` output.
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("Failed to serialize as JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdext::CommandOutput;
    use crate::executor::scripted::ScriptedExecutor;
    use crate::runner::Runner;
    use crate::scenarios::{self, SCENARIOS};
    use crate::config::ScenarioConfig;
    use std::sync::Arc;

    fn failed_pool_run() -> ScenarioResult {
        let exec = Arc::new(
            ScriptedExecutor::new().on("virsh pool-start", CommandOutput::failed(1, "error")),
        );
        let config: ScenarioConfig = [("pool_name", "poolA")].into_iter().collect();
        let mut scenario = scenarios::build("pool-volume", &config).unwrap();
        Runner::new(exec).run(scenario.as_mut())
    }

    #[test]
    fn test_scenarios_table() {
        let rendered = scenarios_table(SCENARIOS).to_string();
        for entry in SCENARIOS {
            assert!(rendered.contains(entry.name), "{rendered}");
        }
        assert!(rendered.contains("DESCRIPTION"));
    }

    #[test]
    fn test_diagnostics_table_and_summary() {
        let result = failed_pool_run();
        let rendered = diagnostics_table(&result).unwrap().to_string();
        assert!(rendered.contains("exit_status=1"), "{rendered}");
        assert!(rendered.contains("phase_error"), "{rendered}");

        let line = summary_line(&result);
        assert!(line.starts_with("pool-volume: failed in "), "{line}");
        assert!(line.ends_with("released 1 resource"), "{line}");
    }

    #[test]
    fn test_json() {
        let result = failed_pool_run();
        let v: serde_json::Value = serde_json::from_str(&to_json(&result).unwrap()).unwrap();
        assert_eq!(v["scenario"], "pool-volume");
        assert_eq!(v["outcome"], "failed");
        assert_eq!(v["success"], false);
        assert_eq!(v["diagnostics"][0]["kind"], "phase_error");
        assert_eq!(v["diagnostics"][0]["phase"], "action");

        let infos: Vec<ScenarioInfo> = SCENARIOS.iter().map(ScenarioInfo::from).collect();
        let v: serde_json::Value = serde_json::from_str(&to_json(&infos).unwrap()).unwrap();
        assert_eq!(v.as_array().map(Vec::len), Some(SCENARIOS.len()));
    }
}
