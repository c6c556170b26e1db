//! Shell-style command line tokenizing

use std::fmt;

use crate::common::{Error, Result};

/// One CLI invocation, split into arguments the way a POSIX shell would
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    raw: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Parse a command string. Quoted arguments are kept as one argument.
    pub fn parse(raw: &str) -> Result<Self> {
        let args = shell_words::split(raw).map_err(|e| Error::InvalidCommandLine {
            command: raw.to_string(),
            reason: e.to_string(),
        })?;

        if args.is_empty() {
            return Err(Error::InvalidCommandLine {
                command: raw.to_string(),
                reason: "command is empty".to_string(),
            });
        }

        Ok(Self {
            raw: raw.trim().to_string(),
            args,
        })
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
