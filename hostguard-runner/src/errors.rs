// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by hostguard.

use crate::{dump::DumpKind, stop::CapabilityKind};
use camino::Utf8PathBuf;
use config::ConfigError;
use std::{fmt, num::ParseIntError};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse hostguard config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    err: ConfigError,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, err: ConfigError) -> Self {
        Self {
            config_file: config_file.into(),
            err,
        }
    }

    /// Returns the config file that failed to parse.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }
}

/// A session configuration was rejected before any attempt ran.
///
/// These errors always map to the `InvalidCommandLine` exit code.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PolicyViolation {
    /// A flag was specified without the flag it depends on.
    #[error("`{flag}` requires `{requires}` to be specified")]
    MissingPrerequisite {
        /// The dependent flag.
        flag: &'static str,

        /// The flag that must also be specified.
        requires: &'static str,
    },

    /// A flag requires a capability that the host doesn't declare.
    #[error("`{flag}` requires the test host to declare the `{capability}` capability")]
    MissingCapability {
        /// The flag that was specified.
        flag: &'static str,

        /// The capability that is missing.
        capability: CapabilityKind,
    },

    /// A flag was given an out-of-range or malformed value.
    #[error("invalid value for `{flag}`: {message}")]
    InvalidValue {
        /// The flag or config key that was specified.
        flag: &'static str,

        /// A description of the problem.
        message: String,
    },

    /// No test host command was provided on the command line or in the config.
    #[error("no test host command specified (pass it after `--`, or set `host.command` in config)")]
    MissingHostCommand,
}

/// An error that occurred while parsing a hang timeout such as `90s` or `1.5m`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid hang timeout `{input}`: {message}")]
pub struct HangTimeoutParseError {
    input: String,
    message: &'static str,
}

impl HangTimeoutParseError {
    pub(crate) fn new(input: impl Into<String>, message: &'static str) -> Self {
        Self {
            input: input.into(),
            message,
        }
    }
}

/// An error that occurred while parsing a [`DumpKind`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error(
    "unrecognized dump type: {input}\n(known values: {})",
    DumpKind::variants().join(", "),
)]
pub struct DumpKindParseError {
    input: String,
}

impl DumpKindParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurred while parsing the `--ignore-exit-code` list.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid exit code `{input}` in ignore list")]
pub struct IgnoreExitCodeParseError {
    input: String,
    #[source]
    err: ParseIntError,
}

impl IgnoreExitCodeParseError {
    pub(crate) fn new(input: impl Into<String>, err: ParseIntError) -> Self {
        Self {
            input: input.into(),
            err,
        }
    }
}

/// An error that occurred while spawning the test host.
#[derive(Debug, Error)]
#[error("failed to spawn test host `{program}`")]
pub struct HostSpawnError {
    program: String,
    #[source]
    err: std::io::Error,
}

impl HostSpawnError {
    pub(crate) fn new(program: impl Into<String>, err: std::io::Error) -> Self {
        Self {
            program: program.into(),
            err,
        }
    }
}

/// An error that occurred while enumerating processes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessEnumError {
    /// Reading the process table failed.
    #[error("failed to read process table at `{path}`")]
    ReadProcTable {
        /// The path that was read.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Running the process listing command failed.
    #[error("failed to run `{command}`")]
    Command {
        /// The command that was run.
        command: String,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Querying the job object failed.
    #[error("failed to query job object: {message}")]
    JobObject {
        /// A description of the failure.
        message: String,
    },
}

/// An error that occurred while writing a dump.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DumpWriteError {
    /// The dump tool could not be executed.
    #[error("failed to execute dump tool `{tool}` for pid {pid}")]
    Exec {
        /// The dump tool.
        tool: String,

        /// The process being dumped.
        pid: u32,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The dump tool exited unsuccessfully.
    #[error("dump tool `{tool}` failed for pid {pid}{}", DisplayExitCode(.exit_code))]
    ToolFailed {
        /// The dump tool.
        tool: String,

        /// The process being dumped.
        pid: u32,

        /// The exit code of the tool, if any.
        exit_code: Option<i32>,
    },

    /// The dump task panicked or was cancelled.
    #[error("dump task for pid {pid} did not complete")]
    TaskFailed {
        /// The process being dumped.
        pid: u32,
    },
}

struct DisplayExitCode<'a>(&'a Option<i32>);

impl fmt::Display for DisplayExitCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self.0 {
            Some(code) => write!(f, " with exit code {code}"),
            None => write!(f, " (terminated by signal)"),
        }
    }
}

/// An error that occurred while moving an attempt's artifacts into place.
#[derive(Debug, Error)]
#[error("failed to move artifacts from `{from}` to `{to}`")]
pub struct ArtifactRelocateError {
    from: Utf8PathBuf,
    to: Utf8PathBuf,
    #[source]
    err: std::io::Error,
}

impl ArtifactRelocateError {
    pub(crate) fn new(from: Utf8PathBuf, to: Utf8PathBuf, err: std::io::Error) -> Self {
        Self { from, to, err }
    }
}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] std::io::Error);

/// An error that ended a session before a final exit code could be resolved.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The session was rejected before any attempt ran.
    #[error(transparent)]
    PolicyViolation(#[from] PolicyViolation),

    /// The test host could not be spawned.
    #[error(transparent)]
    HostSpawn(#[from] HostSpawnError),

    /// The results directory could not be created.
    #[error("failed to create results directory `{dir}`")]
    CreateResultsDir {
        /// The directory.
        dir: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The signal handler could not be set up.
    #[error(transparent)]
    SignalHandlerSetup(#[from] SignalHandlerSetupError),
}
