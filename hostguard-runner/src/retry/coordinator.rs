// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{RetryDecision, ThresholdPolicy};
use crate::{
    config::SessionSettings,
    errors::{ArtifactRelocateError, SessionError},
    exit_code::{ExitCodeResolver, OutcomeFacts},
    helpers::DisplayErrorChain,
    results::{Attempt, SessionEnd, SessionOutcome, TestResults},
};
use camino::{Utf8Path, Utf8PathBuf};
use hostguard_metadata::TestUid;
use rand::{Rng, distr::Alphanumeric};
use std::future::Future;
use tracing::{debug, info, warn};

/// The directory, under the results directory, that retry artifacts are moved to.
pub const RETRIES_DIR: &str = "Retries";

/// The file name of the session summary, written to the results directory.
pub const SUMMARY_FILE_NAME: &str = "hostguard-summary.json";

// Kept short to stay well clear of path length limits.
const RETRY_ID_LEN: usize = 5;
const MAX_ID_TRIES: usize = 16;

/// A request to run one attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttemptRequest {
    /// The 1-based attempt index.
    pub index: usize,

    /// The maximum number of attempts in this session.
    pub max_attempts: usize,

    /// Uids to run. Empty on the first attempt, meaning the full suite.
    pub filter: Vec<TestUid>,

    /// The directory the host should write its artifacts to.
    pub artifacts_dir: Utf8PathBuf,
}

/// Runs a single attempt of the test host.
pub trait RunAttempt {
    /// Runs the attempt described by `request`.
    fn run(
        &mut self,
        request: AttemptRequest,
    ) -> impl Future<Output = Result<Attempt, SessionError>>;
}

/// A retry-related event, for display.
#[derive(Clone, Debug)]
pub enum SessionEvent<'a> {
    /// An attempt is starting.
    AttemptStarted {
        /// The attempt index.
        index: usize,

        /// The maximum number of attempts.
        max_attempts: usize,

        /// The uids being re-run. Empty for the full suite.
        filter: &'a [TestUid],
    },

    /// An attempt failed and will be retried.
    AttemptFailed {
        /// The attempt index.
        index: usize,

        /// The maximum number of attempts.
        max_attempts: usize,

        /// The number of tests that failed in the attempt.
        failed: usize,

        /// The host's exit code.
        exit_code: Option<i32>,
    },

    /// A retry was suppressed by the threshold policy.
    RetrySuppressed {
        /// The threshold that was exceeded.
        reason: &'a str,
    },

    /// An attempt's artifacts were moved.
    ArtifactsRelocated {
        /// The attempt index.
        index: usize,

        /// The new location of the artifacts.
        dir: &'a Utf8Path,
    },

    /// The session is over.
    SessionFinished {
        /// How the retry state machine ended.
        end: SessionEnd,

        /// The number of attempts that ran.
        attempts: usize,

        /// The maximum number of attempts.
        max_attempts: usize,
    },
}

/// Drives attempts until the suite passes, the threshold policy says stop, or attempts run out.
///
/// Attempts run strictly one at a time. Attempt 1 runs the full suite and writes to the results
/// directory; later attempts re-run previously failed uids and have their artifacts moved under
/// `Retries/<id>/`.
#[derive(Clone, Debug)]
pub struct RetryCoordinator {
    threshold: ThresholdPolicy,
    retries_enabled: bool,
    results_directory: Utf8PathBuf,
    resolver: ExitCodeResolver,
}

impl RetryCoordinator {
    /// Creates a new coordinator.
    pub fn new(
        threshold: ThresholdPolicy,
        retries_enabled: bool,
        results_directory: Utf8PathBuf,
        resolver: ExitCodeResolver,
    ) -> Self {
        Self {
            threshold,
            retries_enabled,
            results_directory,
            resolver,
        }
    }

    /// Creates a coordinator from validated session settings.
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self::new(
            settings.threshold,
            settings.retries_enabled,
            settings.results_directory.clone(),
            settings.exit_code_resolver.clone(),
        )
    }

    /// Runs the session to completion.
    ///
    /// Retry events are only reported if retries are enabled.
    pub async fn run<R: RunAttempt>(
        &self,
        runner: &mut R,
        mut on_event: impl FnMut(SessionEvent<'_>),
    ) -> Result<SessionOutcome, SessionError> {
        create_dir_all(&self.results_directory)?;

        let max_attempts = self.threshold.max_attempts();
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut merged = TestResults::new();
        let mut filter = Vec::new();

        let end = loop {
            let index = attempts.len() + 1;
            let artifacts_dir = if index == 1 {
                self.results_directory.clone()
            } else {
                self.retries_dir().join(format!(".attempt-{index}"))
            };
            let res = match create_dir_all(&artifacts_dir) {
                Ok(()) => {
                    if self.retries_enabled {
                        on_event(SessionEvent::AttemptStarted {
                            index,
                            max_attempts,
                            filter: &filter,
                        });
                    }
                    debug!(index, max_attempts, filter_len = filter.len(), "starting attempt");

                    runner
                        .run(AttemptRequest {
                            index,
                            max_attempts,
                            filter: std::mem::take(&mut filter),
                            artifacts_dir,
                        })
                        .await
                }
                Err(err) => Err(err),
            };

            // Once an attempt has completed, its results still decide the exit code.
            let mut attempt = match res {
                Ok(attempt) => attempt,
                Err(err) if index == 1 => return Err(err),
                Err(err) => {
                    warn!(
                        "{}: retry attempt {index}/{max_attempts} could not be run",
                        DisplayErrorChain::new(&err),
                    );
                    break SessionEnd::RetryFailed;
                }
            };

            if index > 1 {
                match self.relocate(&attempt.artifacts_dir) {
                    Ok(to) => {
                        attempt.relocate(to);
                        if self.retries_enabled {
                            on_event(SessionEvent::ArtifactsRelocated {
                                index,
                                dir: &attempt.artifacts_dir,
                            });
                        }
                    }
                    Err(err) => {
                        warn!(
                            "{}: attempt {index} artifacts remain in `{}`",
                            DisplayErrorChain::new(&err),
                            attempt.artifacts_dir,
                        );
                    }
                }
            }

            merged.merge(&attempt.results);
            let end = self.decide(&attempt, &merged, &mut on_event);
            if end.is_none() {
                filter = merged.failed_uids();
            }
            attempts.push(attempt);

            if let Some(end) = end {
                break end;
            }
        };

        if self.retries_enabled {
            on_event(SessionEvent::SessionFinished {
                end,
                attempts: attempts.len(),
                max_attempts,
            });
        }

        let facts = OutcomeFacts::from_session(&attempts, &merged, end);
        let final_exit_code = self.resolver.resolve(&facts);
        info!(?end, final_exit_code, "session finished");

        let outcome = SessionOutcome {
            attempts,
            results: merged,
            end,
            final_exit_code,
        };
        self.write_summary(&outcome);
        Ok(outcome)
    }

    /// Decides what happens after `attempt`. Returns `None` to retry.
    ///
    /// Thresholds are evaluated against `merged`, so that a retry of a single failed test is
    /// measured against the whole suite rather than against itself.
    fn decide(
        &self,
        attempt: &Attempt,
        merged: &TestResults,
        on_event: &mut impl FnMut(SessionEvent<'_>),
    ) -> Option<SessionEnd> {
        if attempt.aborted() {
            return Some(SessionEnd::Aborted);
        }
        // A stopped attempt ran only part of the suite on purpose: don't retry it.
        if attempt.stopped_for_max_failures {
            return Some(SessionEnd::StoppedForMaxFailures);
        }

        let counts = merged.counts();
        if !attempt.is_non_graceful() && attempt.all_passed() && counts.failed == 0 {
            return Some(SessionEnd::Succeeded);
        }

        match self
            .threshold
            .evaluate(attempt.index, attempt.is_non_graceful(), counts)
        {
            RetryDecision::Retry => {
                if self.retries_enabled {
                    on_event(SessionEvent::AttemptFailed {
                        index: attempt.index,
                        max_attempts: attempt.max_attempts,
                        failed: counts.failed,
                        exit_code: attempt.exit_code,
                    });
                }
                None
            }
            RetryDecision::NoRetriesLeft => Some(SessionEnd::Exhausted),
            RetryDecision::NonGraceful => Some(SessionEnd::StoppedByThreshold),
            // Only tests left in progress at a graceful exit: nothing to re-run.
            RetryDecision::NothingFailed => Some(SessionEnd::Succeeded),
            RetryDecision::ThresholdExceeded { reason } => {
                info!("retry suppressed: {reason}");
                on_event(SessionEvent::RetrySuppressed { reason: &reason });
                Some(SessionEnd::StoppedByThreshold)
            }
        }
    }

    fn retries_dir(&self) -> Utf8PathBuf {
        self.results_directory.join(RETRIES_DIR)
    }

    /// Moves a retry's staging directory to `Retries/<id>`.
    fn relocate(&self, from: &Utf8Path) -> Result<Utf8PathBuf, ArtifactRelocateError> {
        let retries_dir = self.retries_dir();
        let mut to = retries_dir.join(retry_id());
        for _ in 1..MAX_ID_TRIES {
            if !to.exists() {
                break;
            }
            to = retries_dir.join(retry_id());
        }

        match fs_err::rename(from, &to) {
            Ok(()) => {
                debug!(%from, %to, "relocated attempt artifacts");
                Ok(to)
            }
            Err(err) => Err(ArtifactRelocateError::new(from.to_owned(), to, err)),
        }
    }

    fn write_summary(&self, outcome: &SessionOutcome) {
        let path = self.results_directory.join(SUMMARY_FILE_NAME);
        let res = fs_err::File::create(&path)
            .map_err(|err| err.to_string())
            .and_then(|file| {
                serde_json::to_writer_pretty(std::io::BufWriter::new(file), outcome)
                    .map_err(|err| err.to_string())
            });
        if let Err(err) = res {
            warn!("failed to write session summary to `{path}`: {err}");
        }
    }
}

/// Generates a short lowercase alphanumeric id.
fn retry_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(RETRY_ID_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

fn create_dir_all(dir: &Utf8Path) -> Result<(), SessionError> {
    fs_err::create_dir_all(dir).map_err(|err| SessionError::CreateResultsDir {
        dir: dir.to_owned(),
        err,
    })
}
