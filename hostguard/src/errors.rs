// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use hostguard_metadata::HostGuardExitCode;
use hostguard_runner::errors::*;
use owo_colors::OwoColorize;
use std::{error::Error, path::PathBuf};
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// The #[error()] strings are mostly placeholders: errors are expected to be printed with
// display_to_stderr, which colorizes them and prints the chain of causes.

/// An error that ends hostguard before the test host's outcome could be resolved.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("could not read current directory")]
    CurrentDirFailed {
        #[source]
        err: std::io::Error,
    },
    #[error("current directory is not valid UTF-8")]
    CurrentDirInvalidUtf8 { path: PathBuf },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("failed to create async runtime")]
    RuntimeCreateFailed {
        #[source]
        err: std::io::Error,
    },
    #[error("session error")]
    SessionError {
        #[from]
        err: SessionError,
    },
}

impl ExpectedError {
    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::ConfigParseError { .. } => HostGuardExitCode::INVALID_COMMAND_LINE,
            Self::SessionError { err } => match err {
                SessionError::PolicyViolation(_) => HostGuardExitCode::INVALID_COMMAND_LINE,
                SessionError::SignalHandlerSetup(_) => HostGuardExitCode::INVALID_PLATFORM_SETUP,
                _ => HostGuardExitCode::GENERIC_FAILURE,
            },
            Self::CurrentDirFailed { .. }
            | Self::CurrentDirInvalidUtf8 { .. }
            | Self::RuntimeCreateFailed { .. } => HostGuardExitCode::GENERIC_FAILURE,
        }
    }

    /// Displays this error to stderr, followed by its chain of causes.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match &self {
            Self::CurrentDirFailed { err } => {
                error!("could not read current directory");
                Some(err as &dyn Error)
            }
            Self::CurrentDirInvalidUtf8 { path } => {
                error!(
                    "current directory `{}` is not valid UTF-8",
                    path.display().style(styles.bold)
                );
                None
            }
            Self::ConfigParseError { err } => {
                error!(
                    "failed to parse config at `{}`",
                    err.config_file().style(styles.bold)
                );
                err.source()
            }
            Self::RuntimeCreateFailed { err } => {
                error!("failed to create async runtime");
                Some(err as &dyn Error)
            }
            Self::SessionError { err } => match err {
                SessionError::CreateResultsDir { dir, err } => {
                    error!(
                        "failed to create results directory `{}`",
                        dir.style(styles.bold)
                    );
                    Some(err as &dyn Error)
                }
                other => {
                    error!("{other}");
                    other.source()
                }
            },
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
