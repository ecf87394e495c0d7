//! virsh command lines and output parsing
//!
//! The parsers here read the human-oriented tables virsh prints. They are
//! deliberately loose: header rows are skipped by looking for the dashed
//! separator line, and columns are split on whitespace.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::cmdext::CommandLine;

/// Builds virsh command lines against an optional connection URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Virsh {
    connect: Option<String>,
}

impl Virsh {
    /// A builder for the given connection, or the default one.
    pub fn new(connect: Option<&str>) -> Self {
        Self {
            connect: connect.filter(|c| !c.is_empty()).map(str::to_owned),
        }
    }

    /// Connection URI, if one was given.
    pub fn connect_uri(&self) -> Option<&str> {
        self.connect.as_deref()
    }

    /// Start a `virsh [-c URI] <subcommand>` command line.
    pub fn cmd(&self, subcommand: &str) -> CommandLine {
        let mut cmd = CommandLine::new("virsh");
        if let Some(uri) = &self.connect {
            cmd = cmd.arg("-c").arg(uri.as_str());
        }
        cmd.arg(subcommand)
    }
}

/// Lifecycle flags of a network as shown by `net-list --all`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetState {
    /// Network is running
    pub active: bool,
    /// Network starts with the daemon
    pub autostart: bool,
    /// Network has a persistent definition
    pub persistent: bool,
}

/// Rows of a virsh table, after the dashed separator line.
fn table_rows(output: &str) -> impl Iterator<Item = Vec<&str>> {
    output
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .filter(|cols| !cols.is_empty())
}

/// Parse `net-list --all`.
pub fn parse_net_list(output: &str) -> BTreeMap<String, NetState> {
    table_rows(output)
        .filter_map(|cols| match cols.as_slice() {
            [name, state, autostart, persistent, ..] => Some((
                (*name).to_owned(),
                NetState {
                    active: *state == "active",
                    autostart: *autostart == "yes",
                    persistent: *persistent == "yes",
                },
            )),
            _ => None,
        })
        .collect()
}

/// Parse output of `--name` listings: one name per line.
pub fn parse_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse `vol-list <pool>` into `(name, path)` pairs.
pub fn parse_vol_list(output: &str) -> Vec<(String, String)> {
    table_rows(output)
        .filter_map(|cols| match cols.as_slice() {
            [name, path, ..] => Some(((*name).to_owned(), (*path).to_owned())),
            [name] => Some(((*name).to_owned(), String::new())),
            [] => None,
        })
        .collect()
}

/// Parse `Key: value` output such as `pool-info` or `dominfo`.
pub fn parse_info(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Target devices listed by `domblklist <domain>`.
pub fn parse_domblklist(output: &str) -> Vec<String> {
    table_rows(output)
        .filter_map(|cols| cols.first().map(|t| (*t).to_owned()))
        .collect()
}

/// UUID from `secret-define` output ("Secret <uuid> created").
pub fn parse_secret_uuid(output: &str) -> Option<String> {
    static SECRET_CREATED: OnceLock<Regex> = OnceLock::new();
    let re = SECRET_CREATED.get_or_init(|| {
        Regex::new(r"Secret\s+([0-9a-fA-F-]{36})\s+created").expect("valid secret-define pattern")
    });
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
}

/// Name of a node device from `nodedev-create` output ("Node device <name> created from ...").
pub fn parse_created_nodedev(output: &str) -> Option<String> {
    static NODEDEV_CREATED: OnceLock<Regex> = OnceLock::new();
    let re = NODEDEV_CREATED.get_or_init(|| {
        Regex::new(r"Node device\s+'?([^'\s]+)'?\s+created").expect("valid nodedev-create pattern")
    });
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
}
