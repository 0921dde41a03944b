// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{DumpToolConfig, HangTimeout, HostGuardConfig};
use crate::{
    dump::{DumpGeneratorSettings, DumpKind, DumpSettings},
    errors::PolicyViolation,
    exit_code::{ExitCodeResolver, IgnoreExitCodes},
    retry::ThresholdPolicy,
    stop::{CapabilityKind, CapabilityRegistry, GracefulStopCapability},
};
use camino::{Utf8Path, Utf8PathBuf};
use std::{sync::Arc, time::Duration};
use tracing::warn;

/// Session options as specified on the command line, before validation.
///
/// Fields left as `None` fall back to the config.
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    /// The host command line. Falls back to `host.command` if empty.
    pub host_command: Vec<String>,

    /// `--results-directory`.
    pub results_directory: Option<Utf8PathBuf>,

    /// `--retry-failed-tests`.
    pub retry_failed_tests: Option<usize>,

    /// `--retry-failed-tests-max-percentage`.
    pub retry_failed_tests_max_percentage: Option<f64>,

    /// `--retry-failed-tests-max-tests`.
    pub retry_failed_tests_max_tests: Option<usize>,

    /// `--crashdump`.
    pub crashdump: bool,

    /// `--crashdump-type`.
    pub crashdump_type: Option<DumpKind>,

    /// `--crashdump-filename`.
    pub crashdump_filename: Option<String>,

    /// `--hangdump`.
    pub hangdump: bool,

    /// `--hangdump-timeout`.
    pub hangdump_timeout: Option<HangTimeout>,

    /// `--hangdump-type`.
    pub hangdump_type: Option<DumpKind>,

    /// `--hangdump-filename`.
    pub hangdump_filename: Option<String>,

    /// `--maximum-failed-tests`.
    pub maximum_failed_tests: Option<usize>,

    /// `--minimum-expected-tests`.
    pub minimum_expected_tests: Option<usize>,

    /// `--ignore-exit-code`.
    pub ignore_exit_codes: IgnoreExitCodes,
}

impl SessionOptions {
    /// Validates these options against each other and the config.
    ///
    /// Returns an error, before anything is run, if a flag is given without its prerequisite, a
    /// value is out of range, or a flag depends on a capability the host doesn't declare.
    pub fn resolve(
        self,
        config: &HostGuardConfig,
        cwd: &Utf8Path,
    ) -> Result<SessionSettings, PolicyViolation> {
        let threshold = self.threshold_policy()?;
        let dumps = self.dump_settings(config)?;

        let hang_timeout = if self.hangdump {
            Some(
                self.hangdump_timeout
                    .unwrap_or_else(|| config.hang_timeout())
                    .duration(),
            )
        } else {
            None
        };

        let capabilities = CapabilityRegistry::from_declared(config.capabilities());
        let graceful_stop = match self.maximum_failed_tests {
            Some(0) => {
                return Err(PolicyViolation::InvalidValue {
                    flag: "--maximum-failed-tests",
                    message: "must be greater than 0".to_owned(),
                });
            }
            Some(max_failed) => {
                capabilities.require(CapabilityKind::GracefulStop, "--maximum-failed-tests")?;
                capabilities
                    .graceful_stop()
                    .map(|capability| GracefulStopSettings {
                        max_failed,
                        capability: capability.clone(),
                    })
            }
            None => None,
        };

        if self.minimum_expected_tests == Some(0) {
            return Err(PolicyViolation::InvalidValue {
                flag: "--minimum-expected-tests",
                message: "must be greater than 0".to_owned(),
            });
        }

        let command = if self.host_command.is_empty() {
            config.host_command().to_vec()
        } else {
            self.host_command
        };
        let mut command = command.into_iter();
        let Some(program) = command.next() else {
            return Err(PolicyViolation::MissingHostCommand);
        };
        let host = HostCommand {
            program,
            args: command.collect(),
        };

        let tree_poll_interval = config.tree_poll_interval();
        if tree_poll_interval.is_zero() {
            return Err(PolicyViolation::InvalidValue {
                flag: "supervisor.tree-poll-interval",
                message: "must be greater than 0".to_owned(),
            });
        }
        if tree_poll_interval >= Duration::from_secs(1) {
            warn!(
                "tree-poll-interval is {}: processes that start and exit between polls \
                 will not be dumped",
                humantime::format_duration(tree_poll_interval),
            );
        }

        let results_directory = match self.results_directory {
            Some(dir) => cwd.join(dir),
            None => cwd.join(config.results_directory()),
        };

        Ok(SessionSettings {
            host,
            results_directory,
            retries_enabled: self.retry_failed_tests.is_some(),
            threshold,
            dumps,
            hang_timeout,
            graceful_stop,
            exit_code_resolver: ExitCodeResolver::new(
                self.ignore_exit_codes,
                self.minimum_expected_tests,
            ),
            dump_tool: config.dump_tool().clone(),
            tree_poll_interval,
            abort_grace_period: config.abort_grace_period(),
            stop_ack_timeout: config.stop_ack_timeout(),
        })
    }

    fn threshold_policy(&self) -> Result<ThresholdPolicy, PolicyViolation> {
        let Some(max_retries) = self.retry_failed_tests else {
            require_absent(
                self.retry_failed_tests_max_percentage.is_some(),
                "--retry-failed-tests-max-percentage",
                "--retry-failed-tests",
            )?;
            require_absent(
                self.retry_failed_tests_max_tests.is_some(),
                "--retry-failed-tests-max-tests",
                "--retry-failed-tests",
            )?;
            return Ok(ThresholdPolicy::no_retries());
        };

        if let Some(percentage) = self.retry_failed_tests_max_percentage
            && !(0.0..=100.0).contains(&percentage)
        {
            return Err(PolicyViolation::InvalidValue {
                flag: "--retry-failed-tests-max-percentage",
                message: format!("{percentage} is not between 0 and 100"),
            });
        }
        if self.retry_failed_tests_max_tests == Some(0) {
            return Err(PolicyViolation::InvalidValue {
                flag: "--retry-failed-tests-max-tests",
                message: "must be greater than 0".to_owned(),
            });
        }

        Ok(ThresholdPolicy {
            max_retries,
            max_failed_percentage: self.retry_failed_tests_max_percentage,
            max_failed_tests: self.retry_failed_tests_max_tests,
        })
    }

    fn dump_settings(&self, config: &HostGuardConfig) -> Result<DumpSettings, PolicyViolation> {
        let crash = if self.crashdump {
            Some(DumpGeneratorSettings {
                kind: self.crashdump_type.unwrap_or_else(|| config.crash_dump_kind()),
                file_template: self.crashdump_filename.clone(),
            })
        } else {
            require_absent(self.crashdump_type.is_some(), "--crashdump-type", "--crashdump")?;
            require_absent(
                self.crashdump_filename.is_some(),
                "--crashdump-filename",
                "--crashdump",
            )?;
            None
        };

        let hang = if self.hangdump {
            Some(DumpGeneratorSettings {
                kind: self.hangdump_type.unwrap_or_else(|| config.hang_dump_kind()),
                file_template: self.hangdump_filename.clone(),
            })
        } else {
            require_absent(self.hangdump_timeout.is_some(), "--hangdump-timeout", "--hangdump")?;
            require_absent(self.hangdump_type.is_some(), "--hangdump-type", "--hangdump")?;
            require_absent(
                self.hangdump_filename.is_some(),
                "--hangdump-filename",
                "--hangdump",
            )?;
            None
        };

        Ok(DumpSettings { crash, hang })
    }
}

fn require_absent(
    present: bool,
    flag: &'static str,
    requires: &'static str,
) -> Result<(), PolicyViolation> {
    if present {
        Err(PolicyViolation::MissingPrerequisite { flag, requires })
    } else {
        Ok(())
    }
}

/// The command line used to launch the test host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostCommand {
    /// The program to run.
    pub program: String,

    /// Arguments passed before any supervisor-provided arguments.
    pub args: Vec<String>,
}

/// Settings for the cooperative stop on `--maximum-failed-tests`.
#[derive(Clone, Debug)]
pub struct GracefulStopSettings {
    /// Stop once this many distinct tests have failed.
    pub max_failed: usize,

    /// How to ask the host to stop.
    pub capability: Arc<dyn GracefulStopCapability>,
}

/// Validated settings for a session. Immutable once built.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    /// The host command line.
    pub host: HostCommand,

    /// The absolute results directory.
    pub results_directory: Utf8PathBuf,

    /// True if `--retry-failed-tests` was given, even with 0 retries.
    pub retries_enabled: bool,

    /// The retry limits.
    pub threshold: ThresholdPolicy,

    /// Which dump generators are enabled.
    pub dumps: DumpSettings,

    /// The hang timeout, if hang detection is enabled.
    pub hang_timeout: Option<Duration>,

    /// The cooperative stop settings, if `--maximum-failed-tests` was given.
    pub graceful_stop: Option<GracefulStopSettings>,

    /// Maps the session's outcome to an exit code.
    pub exit_code_resolver: ExitCodeResolver,

    /// The tool used to write dumps.
    pub dump_tool: DumpToolConfig,

    /// How often the process tree is enumerated.
    pub tree_poll_interval: Duration,

    /// How long an aborted host has to exit before it is killed.
    pub abort_grace_period: Duration,

    /// How long to wait for a stop request to be acknowledged.
    pub stop_ack_timeout: Duration,
}
