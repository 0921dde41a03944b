// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::results::ResultCounts;

/// Limits that govern whether a failed attempt is retried.
///
/// Built once per session. Evaluation is pure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThresholdPolicy {
    /// The maximum number of retries. The session runs at most `max_retries + 1` attempts.
    pub max_retries: usize,

    /// Retries are suppressed if more than this percentage of tests failed.
    pub max_failed_percentage: Option<f64>,

    /// Retries are suppressed if more than this many tests failed.
    pub max_failed_tests: Option<usize>,
}

/// The result of evaluating a [`ThresholdPolicy`] against an attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Re-run the failed tests.
    Retry,

    /// Don't retry: every allowed attempt has run.
    NoRetriesLeft,

    /// Don't retry: the host crashed or hung.
    NonGraceful,

    /// Don't retry: no tests failed.
    NothingFailed,

    /// Don't retry: a failure threshold was exceeded.
    ThresholdExceeded {
        /// A description of the threshold that was exceeded.
        reason: String,
    },
}

impl ThresholdPolicy {
    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            max_failed_percentage: None,
            max_failed_tests: None,
        }
    }

    /// Returns the maximum number of attempts.
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Decides whether the attempt with the given index and results should be retried.
    pub fn evaluate(
        &self,
        index: usize,
        non_graceful: bool,
        counts: ResultCounts,
    ) -> RetryDecision {
        if index > self.max_retries {
            return RetryDecision::NoRetriesLeft;
        }
        if non_graceful {
            return RetryDecision::NonGraceful;
        }

        let (failed, total) = (counts.failed, counts.total());
        if let Some(max_failed) = self.max_failed_tests
            && failed > max_failed
        {
            return RetryDecision::ThresholdExceeded {
                reason: format!(
                    "Maximum failed tests threshold is {max_failed} and {failed} tests failed"
                ),
            };
        }

        if let Some(max_percentage) = self.max_failed_percentage
            && total > 0
        {
            // Compare the unrounded value: rounding is for display only.
            let percentage = 100.0 * failed as f64 / total as f64;
            if percentage > max_percentage {
                return RetryDecision::ThresholdExceeded {
                    reason: format!(
                        "Percentage failed threshold is {max_percentage}% and \
                         {percentage:.2}% tests failed ({failed}/{total})"
                    ),
                };
            }
        }

        if failed > 0 {
            RetryDecision::Retry
        } else {
            RetryDecision::NothingFailed
        }
    }
}
