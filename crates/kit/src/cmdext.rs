//! Command lines and their captured results

use serde::Serialize;
use std::fmt;
use std::process::Output;

use crate::error::ConfigError;

/// A program and its argument vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Start a command line for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Split a shell-style string into a command line.
    pub fn parse(command: &str) -> Result<Self, ConfigError> {
        let mut words = shlex::split(command)
            .ok_or_else(|| ConfigError::Syntax(format!("unbalanced quoting in '{command}'")))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| ConfigError::Syntax("empty command".into()))?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append `arg` only when it is non-empty.
    pub fn arg_nonempty(self, arg: &str) -> Self {
        if arg.is_empty() {
            self
        } else {
            self.arg(arg)
        }
    }

    /// Append `flag value` when `value` is present and non-empty.
    pub fn opt(self, flag: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => self.arg(flag).arg(v),
            _ => self,
        }
    }

    /// Append extra arguments given as a shell-style string.
    pub fn extra(self, extra: &str) -> Result<Self, ConfigError> {
        if extra.trim().is_empty() {
            return Ok(self);
        }
        let words = shlex::split(extra)
            .ok_or_else(|| ConfigError::Syntax(format!("unbalanced quoting in '{extra}'")))?;
        Ok(self.args(words))
    }

    /// The program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The arguments, excluding the program.
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Program followed by arguments.
    pub fn argv(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str))
    }

    /// Build a tokio command for this line.
    pub(crate) fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, word) in self.argv().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match shlex::try_quote(word) {
                Ok(quoted) => f.write_str(&quoted)?,
                Err(_) => f.write_str(word)?,
            }
        }
        Ok(())
    }
}

/// Exit status and decoded output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// Exit status; `128 + signal` when killed by a signal
    pub exit_status: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given status and stderr.
    pub fn failed(exit_status: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Check if the command succeeded
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        use std::os::unix::process::ExitStatusExt;

        let exit_status = output
            .status
            .code()
            .unwrap_or_else(|| 128 + output.status.signal().unwrap_or(0));
        Self {
            exit_status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let cmd = CommandLine::parse("virsh -c qemu:///system net-define '/tmp/my net.xml'").unwrap();
        assert_eq!(cmd.program(), "virsh");
        assert_eq!(
            cmd.arguments(),
            &["-c", "qemu:///system", "net-define", "/tmp/my net.xml"]
        );
        let shown = cmd.to_string();
        assert!(shown.starts_with("virsh -c qemu:///system net-define "));
        assert_eq!(CommandLine::parse(&shown).unwrap(), cmd);
    }

    #[test]
    fn test_parse_rejects_empty_and_unbalanced() {
        assert!(CommandLine::parse("").is_err());
        assert!(CommandLine::parse("virsh 'oops").is_err());
    }

    #[test]
    fn test_optional_arguments() {
        let cmd = CommandLine::new("virsh")
            .arg("pool-define-as")
            .arg_nonempty("")
            .opt("--source-dev", Some("/dev/sdb"))
            .opt("--source-name", Some(""))
            .opt("--adapter-wwnn", None)
            .extra("--print-xml  --foo")
            .unwrap();
        assert_eq!(
            cmd.argv().collect::<Vec<_>>(),
            ["virsh", "pool-define-as", "--source-dev", "/dev/sdb", "--print-xml", "--foo"]
        );
    }

    #[test]
    fn test_output_helpers() {
        assert!(CommandOutput::ok("x").success());
        let failed = CommandOutput::failed(1, "boom");
        assert!(!failed.success());
        assert_eq!(failed.stderr, "boom");
    }
}
