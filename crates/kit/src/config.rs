//! Scenario parameters and scenario files
//!
//! A [`ScenarioConfig`] is a flat, immutable mapping of parameter names to
//! values. It is assembled from an optional TOML scenario file and
//! `key=value` pairs given on the command line, with the latter winning.
//!
//! ```toml
//! scenario = "pool-volume"
//!
//! [runner]
//! connect = "qemu:///system"
//! command-timeout = 120
//!
//! [params]
//! pool_name = "poolA"
//! need_vol_create = true
//! ```

use camino::Utf8Path;
use color_eyre::{eyre::Context as _, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Boolean flag
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Free-form string
    Str(String),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// Flat parameter mapping for one scenario run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioConfig {
    values: BTreeMap<String, ConfigValue>,
}

impl<K: Into<String>, V: Into<ConfigValue>> FromIterator<(K, V)> for ScenarioConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl ScenarioConfig {
    /// Parse `key=value` pairs as given with `--param`.
    ///
    /// Values are kept as text; the typed getters interpret them.
    pub fn from_params<S: AsRef<str>>(params: &[S]) -> Result<Self, ConfigError> {
        params
            .iter()
            .map(|p| {
                let p = p.as_ref();
                let (key, value) = p
                    .split_once('=')
                    .ok_or_else(|| ConfigError::Syntax(format!("expected key=value, got '{p}'")))?;
                let key = key.trim();
                if key.is_empty() {
                    return Err(ConfigError::Syntax(format!("empty key in '{p}'")));
                }
                Ok((key.to_owned(), ConfigValue::Str(value.to_owned())))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(|values| Self { values })
    }

    /// Return a new config where entries of `overrides` replace ours.
    pub fn merged(mut self, overrides: ScenarioConfig) -> Self {
        self.values.extend(overrides.values);
        self
    }

    /// Raw value lookup.
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    /// Iterate over all parameters in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no parameters are set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// String value, or `default` when unset.
    pub fn string(&self, key: &str, default: &str) -> String {
        self.get(key)
            .map(|v| v.to_string())
            .unwrap_or_else(|| default.to_owned())
    }

    /// String value; unset and empty values are both `None`.
    pub fn optional(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|v| v.to_string())
            .filter(|s| !s.is_empty())
    }

    /// Non-empty string value that must be present.
    pub fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::Missing(key.to_owned()))
    }

    /// Boolean flag. Strings `yes`/`no`/`true`/`false`/`1`/`0` are accepted.
    pub fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(ConfigValue::Bool(b)) => Ok(*b),
            Some(ConfigValue::Int(0)) => Ok(false),
            Some(ConfigValue::Int(1)) => Ok(true),
            Some(ConfigValue::Str(s)) => match s.to_ascii_lowercase().as_str() {
                "yes" | "true" | "1" => Ok(true),
                "no" | "false" | "0" => Ok(false),
                "" => Ok(default),
                _ => Err(self.wrong_type(key, "a boolean")),
            },
            Some(_) => Err(self.wrong_type(key, "a boolean")),
        }
    }

    /// Integer value.
    pub fn int(&self, key: &str, default: i64) -> Result<i64, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(ConfigValue::Int(i)) => Ok(*i),
            Some(ConfigValue::Str(s)) => s
                .trim()
                .parse()
                .map_err(|_| self.wrong_type(key, "an integer")),
            Some(ConfigValue::Bool(_)) => Err(self.wrong_type(key, "an integer")),
        }
    }

    /// Non-negative integer value, for counts and durations.
    pub fn count(&self, key: &str, default: u32) -> Result<u32, ConfigError> {
        let v = self.int(key, default.into())?;
        u32::try_from(v).map_err(|_| self.wrong_type(key, "a non-negative integer"))
    }

    /// One of a fixed set of string values.
    pub fn choice(&self, key: &str, default: &str, allowed: &[&str]) -> Result<String, ConfigError> {
        let value = self.string(key, default);
        if allowed.contains(&value.as_str()) {
            Ok(value)
        } else {
            Err(ConfigError::Unsupported {
                key: key.to_owned(),
                value,
                allowed: allowed.join(", "),
            })
        }
    }

    fn wrong_type(&self, key: &str, expected: &'static str) -> ConfigError {
        ConfigError::WrongType {
            key: key.to_owned(),
            expected,
            found: self.string(key, ""),
        }
    }
}

/// Default timeout for a single executor call.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Runner settings from the `[runner]` table of a scenario file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RunnerSettings {
    /// Hypervisor connection URI (e.g. qemu:///system)
    pub connect: Option<String>,

    /// Per-command timeout in seconds
    pub command_timeout: Option<u64>,
}

/// A scenario file on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ScenarioFile {
    /// Scenario to run, if not given on the command line
    pub scenario: Option<String>,

    /// Runner settings
    #[serde(default)]
    pub runner: RunnerSettings,

    /// Scenario parameters
    #[serde(default)]
    pub params: ScenarioConfig,
}

impl ScenarioFile {
    /// Parse a scenario file from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse scenario file")
    }

    /// Load a scenario file from disk.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file: {}", path))?;
        Self::from_toml(&content).with_context(|| format!("In {}", path))
    }
}
