// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::helpers::display_exited_with;
use hostguard_metadata::HostMessage;
use std::process::ExitStatus;

/// How the host process terminated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExitClassification {
    /// The host went through its normal managed exit path.
    Graceful,

    /// The host terminated abnormally.
    NonGraceful {
        /// A description of how the host exited.
        reason: String,
    },
}

/// Classifies host termination as graceful or non-graceful.
///
/// An exit is graceful only if the host announced `session-completed` and then exited with an
/// exit code. Being killed by a signal, or exiting without completing the session (for example
/// through a fail-fast), is non-graceful. Test results already reported have no bearing on the
/// classification.
#[derive(Clone, Debug, Default)]
pub struct CrashDetector {
    session_completed: bool,
}

impl CrashDetector {
    /// Creates a new detector for one attempt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes a protocol message from the host.
    pub fn observe(&mut self, message: &HostMessage) {
        if matches!(message, HostMessage::SessionCompleted) {
            self.session_completed = true;
        }
    }

    /// Classifies the host's exit. Consumes the detector, so it fires at most once per attempt.
    pub fn classify(self, status: ExitStatus) -> ExitClassification {
        match status.code() {
            Some(_) if self.session_completed => ExitClassification::Graceful,
            Some(_) => ExitClassification::NonGraceful {
                reason: format!(
                    "test host {} without completing the session",
                    display_exited_with(status)
                ),
            },
            None => ExitClassification::NonGraceful {
                reason: format!("test host {}", display_exited_with(status)),
            },
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    #[test]
    fn completed_session_is_graceful_regardless_of_code() {
        let mut detector = CrashDetector::new();
        detector.observe(&HostMessage::SessionCompleted);
        assert_eq!(detector.classify(exited(2)), ExitClassification::Graceful);
    }

    #[test]
    fn exit_without_completion_is_non_graceful() {
        let detector = CrashDetector::new();
        assert_eq!(
            detector.classify(exited(0)),
            ExitClassification::NonGraceful {
                reason: "test host exited with exit code 0 without completing the session"
                    .to_owned()
            }
        );
    }

    #[test]
    fn signal_is_non_graceful_even_after_completion() {
        let mut detector = CrashDetector::new();
        detector.observe(&HostMessage::SessionCompleted);
        assert_eq!(
            detector.classify(ExitStatus::from_raw(6)),
            ExitClassification::NonGraceful {
                reason: "test host terminated by signal 6 (SIGABRT)".to_owned()
            }
        );
    }
}
