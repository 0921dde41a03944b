// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolving the final exit code of a session.

use crate::{
    errors::IgnoreExitCodeParseError,
    results::{Attempt, SessionEnd, TestResults},
};
use hostguard_metadata::HostGuardExitCode;
use std::{collections::BTreeSet, fmt, str::FromStr};

/// Exit codes that are replaced with success, parsed from a `;`-separated list such as `"2;8"`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IgnoreExitCodes {
    codes: BTreeSet<i32>,
}

impl IgnoreExitCodes {
    /// Creates an ignore list from the given codes.
    pub fn new(codes: impl IntoIterator<Item = i32>) -> Self {
        Self {
            codes: codes.into_iter().collect(),
        }
    }

    /// Returns true if `code` is in the list.
    pub fn contains(&self, code: i32) -> bool {
        self.codes.contains(&code)
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

impl FromStr for IgnoreExitCodes {
    type Err = IgnoreExitCodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let codes = s
            .split(';')
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(|code| {
                code.parse::<i32>()
                    .map_err(|err| IgnoreExitCodeParseError::new(code, err))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { codes })
    }
}

impl fmt::Display for IgnoreExitCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codes: Vec<_> = self.codes.iter().map(|code| code.to_string()).collect();
        f.write_str(&codes.join(";"))
    }
}

/// The facts about a session that determine its exit code.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OutcomeFacts {
    /// The operator cancelled the session.
    pub aborted: bool,

    /// The last attempt crashed or hung.
    pub last_attempt_non_graceful: bool,

    /// The host was stopped because `--maximum-failed-tests` was reached.
    pub stopped_for_max_failures: bool,

    /// The number of tests that passed, across all attempts.
    pub passed: usize,

    /// The number of tests that failed, across all attempts.
    pub failed: usize,
}

impl OutcomeFacts {
    /// Extracts the facts from a session's attempts and merged results.
    pub fn from_session(attempts: &[Attempt], results: &TestResults, end: SessionEnd) -> Self {
        let counts = results.counts();
        Self {
            aborted: end == SessionEnd::Aborted,
            last_attempt_non_graceful: attempts.last().is_some_and(Attempt::is_non_graceful),
            stopped_for_max_failures: end == SessionEnd::StoppedForMaxFailures,
            passed: counts.passed,
            failed: counts.failed,
        }
    }

    /// Returns the number of tests that ran to completion.
    pub fn executed(&self) -> usize {
        self.passed + self.failed
    }
}

/// Maps the outcome of a session to a process exit code.
#[derive(Clone, Debug, Default)]
pub struct ExitCodeResolver {
    ignore: IgnoreExitCodes,
    minimum_expected_tests: Option<usize>,
}

impl ExitCodeResolver {
    /// Creates a new resolver.
    pub fn new(ignore: IgnoreExitCodes, minimum_expected_tests: Option<usize>) -> Self {
        Self {
            ignore,
            minimum_expected_tests,
        }
    }

    /// Resolves the exit code.
    ///
    /// The first matching row of the table wins. If the result is in the ignore list, success is
    /// returned instead.
    pub fn resolve(&self, facts: &OutcomeFacts) -> i32 {
        let code = self.resolve_table(facts);
        if self.ignore.contains(code) {
            HostGuardExitCode::SUCCESS
        } else {
            code
        }
    }

    fn resolve_table(&self, facts: &OutcomeFacts) -> i32 {
        if facts.aborted {
            HostGuardExitCode::TEST_SESSION_ABORTED
        } else if facts.last_attempt_non_graceful {
            HostGuardExitCode::TEST_HOST_PROCESS_EXITED_NON_GRACEFULLY
        } else if facts.stopped_for_max_failures {
            HostGuardExitCode::TEST_EXECUTION_STOPPED_FOR_MAX_FAILED_TESTS
        } else if facts.failed > 0 {
            HostGuardExitCode::AT_LEAST_ONE_TEST_FAILED
        } else if facts.executed() == 0 {
            HostGuardExitCode::ZERO_TESTS
        } else if self
            .minimum_expected_tests
            .is_some_and(|minimum| facts.executed() < minimum)
        {
            HostGuardExitCode::MINIMUM_EXPECTED_TESTS_POLICY_VIOLATION
        } else {
            HostGuardExitCode::SUCCESS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prop_assert_eq;
    use test_case::test_case;
    use test_strategy::{Arbitrary, proptest};

    #[test_case("", &[]; "empty")]
    #[test_case("2", &[2]; "single")]
    #[test_case("2;8", &[2, 8]; "two")]
    #[test_case(" 2 ; 8 ;", &[2, 8]; "whitespace and trailing separator")]
    fn parse_ignore_list(input: &str, expected: &[i32]) {
        let parsed: IgnoreExitCodes = input.parse().unwrap();
        assert_eq!(parsed, IgnoreExitCodes::new(expected.iter().copied()));
    }

    #[test]
    fn parse_ignore_list_error() {
        let err = "2;eight".parse::<IgnoreExitCodes>().unwrap_err();
        assert_eq!(err.to_string(), "invalid exit code `eight` in ignore list");
    }

    fn facts(passed: usize, failed: usize) -> OutcomeFacts {
        OutcomeFacts {
            passed,
            failed,
            ..Default::default()
        }
    }

    #[test_case(facts(3, 0), None, HostGuardExitCode::SUCCESS; "success")]
    #[test_case(facts(2, 1), None, HostGuardExitCode::AT_LEAST_ONE_TEST_FAILED; "failed")]
    #[test_case(facts(0, 0), None, HostGuardExitCode::ZERO_TESTS; "zero tests")]
    #[test_case(facts(0, 0), Some(5), HostGuardExitCode::ZERO_TESTS; "zero tests wins over minimum")]
    #[test_case(facts(3, 0), Some(5), HostGuardExitCode::MINIMUM_EXPECTED_TESTS_POLICY_VIOLATION; "below minimum")]
    #[test_case(facts(5, 0), Some(5), HostGuardExitCode::SUCCESS; "at minimum")]
    #[test_case(
        OutcomeFacts { stopped_for_max_failures: true, ..facts(1, 3) },
        None,
        HostGuardExitCode::TEST_EXECUTION_STOPPED_FOR_MAX_FAILED_TESTS;
        "stopped for max failures"
    )]
    #[test_case(
        OutcomeFacts { last_attempt_non_graceful: true, stopped_for_max_failures: true, ..facts(1, 3) },
        None,
        HostGuardExitCode::TEST_HOST_PROCESS_EXITED_NON_GRACEFULLY;
        "non-graceful wins over stop"
    )]
    #[test_case(
        OutcomeFacts { aborted: true, last_attempt_non_graceful: true, ..facts(1, 3) },
        None,
        HostGuardExitCode::TEST_SESSION_ABORTED;
        "aborted wins"
    )]
    fn resolution_table(facts: OutcomeFacts, minimum: Option<usize>, expected: i32) {
        let resolver = ExitCodeResolver::new(IgnoreExitCodes::default(), minimum);
        assert_eq!(resolver.resolve(&facts), expected);
    }

    #[derive(Arbitrary, Debug)]
    struct ArbFacts {
        aborted: bool,
        last_attempt_non_graceful: bool,
        stopped_for_max_failures: bool,
        #[strategy(0usize..5)]
        passed: usize,
        #[strategy(0usize..5)]
        failed: usize,
    }

    impl ArbFacts {
        fn facts(&self) -> OutcomeFacts {
            OutcomeFacts {
                aborted: self.aborted,
                last_attempt_non_graceful: self.last_attempt_non_graceful,
                stopped_for_max_failures: self.stopped_for_max_failures,
                passed: self.passed,
                failed: self.failed,
            }
        }
    }

    #[proptest]
    fn ignore_list_substitutes_success(
        arb: ArbFacts,
        #[strategy(proptest::collection::vec(0i32..15, 0..4))] ignored: Vec<i32>,
        #[strategy(proptest::option::of(0usize..8))] minimum: Option<usize>,
    ) {
        let facts = arb.facts();
        let plain = ExitCodeResolver::new(IgnoreExitCodes::default(), minimum).resolve(&facts);
        let resolver = ExitCodeResolver::new(IgnoreExitCodes::new(ignored.clone()), minimum);
        let resolved = resolver.resolve(&facts);

        if ignored.contains(&plain) {
            prop_assert_eq!(resolved, HostGuardExitCode::SUCCESS);
        } else {
            prop_assert_eq!(resolved, plain);
        }
        // Idempotent.
        prop_assert_eq!(resolver.resolve(&facts), resolved);
    }
}
