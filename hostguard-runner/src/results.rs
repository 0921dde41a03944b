// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test results, attempts and session outcomes.

use crate::{dump::CapturedDump, monitor::HangReport};
use camino::Utf8PathBuf;
use chrono::{DateTime, FixedOffset, Local};
use hostguard_metadata::{TestOutcome, TestUid, TestUpdate};
use indexmap::IndexMap;
use serde::Serialize;
use std::time::Duration;

/// The latest known state of a single test.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestResult {
    /// The unique identifier of the test.
    pub uid: TestUid,

    /// The display name of the test. Not unique.
    pub display_name: String,

    /// The latest outcome.
    pub outcome: TestOutcome,

    /// When the latest transition happened, according to the host.
    pub timestamp: DateTime<FixedOffset>,
}

impl From<TestUpdate> for TestResult {
    fn from(update: TestUpdate) -> Self {
        Self {
            uid: update.uid,
            display_name: update.display_name,
            outcome: update.outcome,
            timestamp: update.timestamp,
        }
    }
}

/// An ordered collection of test results, keyed by uid.
///
/// Tests are kept in the order they were first seen. A later transition for the same uid
/// replaces the earlier one in place.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TestResults {
    results: IndexMap<TestUid, TestResult>,
}

impl TestResults {
    /// Creates an empty set of results.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a transition, replacing any earlier state for the same uid.
    pub fn record(&mut self, result: TestResult) {
        self.results.insert(result.uid.clone(), result);
    }

    /// Returns the result for the given uid.
    pub fn get(&self, uid: &TestUid) -> Option<&TestResult> {
        self.results.get(uid)
    }

    /// Iterates over results in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &TestResult> + '_ {
        self.results.values()
    }

    /// Returns the number of distinct tests seen.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns true if no tests were seen.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Counts tests by outcome.
    pub fn counts(&self) -> ResultCounts {
        let mut counts = ResultCounts::default();
        for result in self.results.values() {
            match result.outcome {
                TestOutcome::InProgress => counts.in_progress += 1,
                TestOutcome::Passed => counts.passed += 1,
                TestOutcome::Failed => counts.failed += 1,
                TestOutcome::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// Returns the uids of failed tests, in first-seen order.
    pub fn failed_uids(&self) -> Vec<TestUid> {
        self.results
            .values()
            .filter(|result| result.outcome == TestOutcome::Failed)
            .map(|result| result.uid.clone())
            .collect()
    }

    /// Overlays the results of a later attempt on top of these results.
    ///
    /// For every uid in `later`, the later state wins.
    pub fn merge(&mut self, later: &TestResults) {
        for result in later.iter() {
            self.record(result.clone());
        }
    }
}

impl Serialize for TestResults {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.results.values())
    }
}

/// Counts of tests by outcome.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResultCounts {
    /// Tests that passed.
    pub passed: usize,

    /// Tests that failed.
    pub failed: usize,

    /// Tests that were skipped.
    pub skipped: usize,

    /// Tests that started but never finished.
    pub in_progress: usize,
}

impl ResultCounts {
    /// Returns the number of tests that reached a final state.
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped
    }

    /// Returns the number of tests that actually executed, excluding skipped tests.
    pub fn executed(&self) -> usize {
        self.passed + self.failed
    }
}

/// How an attempt ended.
///
/// A crash and a hang are mutually exclusive by construction.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum AttemptStatus {
    /// The host completed through its normal exit path.
    Completed,

    /// The host terminated non-gracefully.
    Crashed {
        /// Why the termination was considered non-graceful.
        reason: String,

        /// Dumps captured for live descendants.
        dumps: Vec<CapturedDump>,
    },

    /// The host stopped making progress and was killed.
    Hung {
        /// The tests that were executing when the hang was detected.
        report: HangReport,

        /// Dumps captured for every live process in the tree.
        dumps: Vec<CapturedDump>,
    },

    /// The session was cancelled by the operator while this attempt was running.
    Aborted,
}

/// The result of a single invocation of the test host.
///
/// Created by the attempt runner and immutable once returned.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Attempt {
    /// The 1-based index of this attempt.
    pub index: usize,

    /// The maximum number of attempts in this session.
    pub max_attempts: usize,

    /// Test results reported by the host.
    pub results: TestResults,

    /// The host's OS exit code, or `None` if it was terminated by a signal.
    pub exit_code: Option<i32>,

    /// Where this attempt's artifacts live.
    pub artifacts_dir: Utf8PathBuf,

    /// How the attempt ended.
    #[serde(flatten)]
    pub status: AttemptStatus,

    /// True if the host was asked to stop because `--maximum-failed-tests` was reached.
    pub stopped_for_max_failures: bool,

    /// When the attempt started.
    pub start_time: DateTime<Local>,

    /// How long the attempt took.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Attempt {
    /// Returns true if the host crashed.
    pub fn crashed(&self) -> bool {
        matches!(self.status, AttemptStatus::Crashed { .. })
    }

    /// Returns true if the host hung.
    pub fn hung(&self) -> bool {
        matches!(self.status, AttemptStatus::Hung { .. })
    }

    /// Returns true if the session was aborted during this attempt.
    pub fn aborted(&self) -> bool {
        matches!(self.status, AttemptStatus::Aborted)
    }

    /// Returns true if the host terminated non-gracefully.
    pub fn is_non_graceful(&self) -> bool {
        self.crashed() || self.hung()
    }

    /// Returns true if every test in this attempt passed or was skipped.
    pub fn all_passed(&self) -> bool {
        let counts = self.results.counts();
        counts.failed == 0 && counts.in_progress == 0
    }

    /// Returns the dumps captured during this attempt.
    pub fn dumps(&self) -> &[CapturedDump] {
        match &self.status {
            AttemptStatus::Crashed { dumps, .. } | AttemptStatus::Hung { dumps, .. } => dumps,
            AttemptStatus::Completed | AttemptStatus::Aborted => &[],
        }
    }

    /// Points this attempt at its new artifact directory, after the directory was moved.
    pub(crate) fn relocate(&mut self, to: Utf8PathBuf) {
        if let AttemptStatus::Crashed { dumps, .. } | AttemptStatus::Hung { dumps, .. } =
            &mut self.status
        {
            for dump in dumps {
                if let Ok(rel) = dump.path.strip_prefix(&self.artifacts_dir) {
                    dump.path = to.join(rel);
                }
            }
        }
        self.artifacts_dir = to;
    }
}

/// The final state of the retry state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionEnd {
    /// The last attempt passed.
    Succeeded,

    /// A retry was suppressed by the threshold policy, or the attempt was non-graceful.
    StoppedByThreshold,

    /// Every allowed attempt ran and tests still failed.
    Exhausted,

    /// The host was stopped because the maximum number of failed tests was reached.
    StoppedForMaxFailures,

    /// The operator cancelled the session.
    Aborted,

    /// A retry attempt could not be started. Earlier attempts still count.
    RetryFailed,
}

/// Everything that happened during a session.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionOutcome {
    /// Every attempt that ran, in order.
    pub attempts: Vec<Attempt>,

    /// Results merged across attempts: for every uid, the latest outcome wins.
    pub results: TestResults,

    /// How the retry state machine ended.
    pub end: SessionEnd,

    /// The resolved process exit code.
    pub final_exit_code: i32,
}

impl SessionOutcome {
    /// Returns the last attempt, if any ran.
    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Returns true if the host was stopped because of `--maximum-failed-tests`.
    pub fn stopped_for_max_failures(&self) -> bool {
        self.end == SessionEnd::StoppedForMaxFailures
    }
}
