// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The line-delimited JSON protocol between the supervisor and a test host.
//!
//! The host writes [`HostMessage`]s to its standard output, one per line. Lines that don't parse
//! as a `HostMessage` are treated as regular host output. The supervisor writes
//! [`ControlMessage`]s to the host's standard input.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// The globally unique identifier of a test.
///
/// This is the only correlation key for a test. Display names are not unique and must never be
/// used for identity.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestUid(SmolStr);

impl TestUid {
    /// Creates a new `TestUid`.
    pub fn new(uid: impl AsRef<str>) -> Self {
        Self(SmolStr::new(uid))
    }

    /// Returns the uid as a string.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for TestUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for TestUid {
    fn from(uid: &str) -> Self {
        Self::new(uid)
    }
}

/// The state of a test as reported by the host.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestOutcome {
    /// The test has started running.
    InProgress,

    /// The test passed.
    Passed,

    /// The test failed.
    Failed,

    /// The test was skipped.
    Skipped,
}

impl TestOutcome {
    /// Returns true if this outcome is final for the current attempt.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "in-progress"),
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// A single test state transition.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestUpdate {
    /// The unique identifier of the test.
    pub uid: TestUid,

    /// The human-readable name of the test. Not unique.
    pub display_name: String,

    /// The new state of the test.
    pub outcome: TestOutcome,

    /// When the transition happened, according to the host.
    pub timestamp: DateTime<FixedOffset>,
}

/// A message sent by the host to the supervisor.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
    /// A test changed state. Every update counts as a liveness heartbeat.
    TestUpdate(TestUpdate),

    /// The host received a [`ControlMessage::StopRequest`] and will not start any new tests.
    StopAcknowledged,

    /// The host finished the session and is exiting through its normal exit path.
    SessionCompleted,
}

impl HostMessage {
    /// Parses a single line of host output.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }

    /// Serializes this message as a single line, including the trailing newline.
    pub fn to_line(&self) -> String {
        let mut line =
            serde_json::to_string(self).expect("HostMessage serialization is infallible");
        line.push('\n');
        line
    }
}

/// A message sent by the supervisor to the host.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Stop starting new tests. Tests already running may finish.
    StopRequest {
        /// Why the stop was requested.
        reason: String,
    },
}

impl ControlMessage {
    /// Parses a single line sent by the supervisor.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }

    /// Serializes this message as a single line, including the trailing newline.
    pub fn to_line(&self) -> String {
        let mut line =
            serde_json::to_string(self).expect("ControlMessage serialization is infallible");
        line.push('\n');
        line
    }
}

/// Command-line arguments and environment variables passed to the host.
pub mod host_env {
    /// Followed by the directory the host should write its artifacts to.
    pub const RESULTS_DIRECTORY_ARG: &str = "--results-directory";

    /// Followed by the uid of a test to run. Repeated once per uid. If absent, the host runs its
    /// full suite.
    pub const FILTER_UID_ARG: &str = "--filter-uid";

    /// The 1-based index of the current attempt.
    pub const ATTEMPT: &str = "HOSTGUARD_ATTEMPT";

    /// The maximum number of attempts in the session.
    pub const TOTAL_ATTEMPTS: &str = "HOSTGUARD_TOTAL_ATTEMPTS";

    /// The directory the host should write its artifacts to.
    pub const RESULTS_DIR: &str = "HOSTGUARD_RESULTS_DIR";

    /// Set if crash dumps are enabled: the requested dump type, e.g. `Full`.
    pub const CRASHDUMP_TYPE: &str = "HOSTGUARD_CRASHDUMP_TYPE";

    /// Set if crash dumps are enabled: the path template for a dump the host writes of itself.
    /// `%p` is the process ID and `%e` the process name.
    pub const CRASHDUMP_FILE: &str = "HOSTGUARD_CRASHDUMP_FILE";
}
