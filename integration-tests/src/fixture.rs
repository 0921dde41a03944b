// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The scripting interface of the `fixture-host` binary.
//!
//! `fixture-host` reads the tests it pretends to run from [`TESTS_ENV`], a `;`-separated list of
//! `uid=behavior` entries. Behaviors are `pass`, `fail`, `flaky:K` (fails until attempt K, then
//! passes), `hang` (starts and never finishes) and `crash` (starts, then the host dies).
//!
//! The display name of a test is its uid up to the first `#`, so `suite.same#1` and
//! `suite.same#2` share a display name.

use color_eyre::{Result, eyre::bail};

/// The tests to run.
pub const TESTS_ENV: &str = "FIXTURE_HOST_TESTS";

/// The number of sleeping child processes to spawn before running tests.
pub const CHILDREN_ENV: &str = "FIXTURE_HOST_CHILDREN";

/// How long each test takes, in milliseconds.
pub const TEST_DELAY_ENV: &str = "FIXTURE_HOST_TEST_DELAY_MS";

/// Written into the results directory when the host starts, containing the attempt index.
pub const STARTED_FILE: &str = "fixture-host-started";

/// Passed to the fixture host to make it a sleeping child process.
pub const SLEEP_CHILD_ARG: &str = "--sleep-child";

/// The exit code used when a test crashes the host.
pub const CRASH_EXIT_CODE: i32 = 134;

/// The exit code used when a test failed.
pub const FAILURE_EXIT_CODE: i32 = 1;

/// What a fixture test does when it runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Behavior {
    Pass,
    Fail,
    FlakyUntil(usize),
    Hang,
    Crash,
}

impl Behavior {
    /// Returns true if the test passes on the given 1-based attempt.
    pub fn passes_on(self, attempt: usize) -> bool {
        match self {
            Self::Pass => true,
            Self::FlakyUntil(k) => attempt >= k,
            Self::Fail | Self::Hang | Self::Crash => false,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FixtureTest {
    pub uid: String,
    pub behavior: Behavior,
}

impl FixtureTest {
    pub fn display_name(&self) -> &str {
        self.uid.split('#').next().unwrap_or(&self.uid)
    }
}

/// Parses the value of [`TESTS_ENV`].
pub fn parse_tests(input: &str) -> Result<Vec<FixtureTest>> {
    input
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| -> Result<FixtureTest> {
            let Some((uid, behavior)) = entry.split_once('=') else {
                bail!("test entry `{entry}` is not of the form `uid=behavior`");
            };
            let behavior = match behavior {
                "pass" => Behavior::Pass,
                "fail" => Behavior::Fail,
                "hang" => Behavior::Hang,
                "crash" => Behavior::Crash,
                other => match other.strip_prefix("flaky:") {
                    Some(k) => Behavior::FlakyUntil(k.parse()?),
                    None => bail!("unknown behavior `{other}` for test `{uid}`"),
                },
            };
            Ok(FixtureTest {
                uid: uid.to_owned(),
                behavior,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse() {
        let tests = parse_tests("a=pass; b#1=flaky:3;c=hang;").unwrap();
        assert_eq!(
            tests,
            vec![
                FixtureTest {
                    uid: "a".to_owned(),
                    behavior: Behavior::Pass
                },
                FixtureTest {
                    uid: "b#1".to_owned(),
                    behavior: Behavior::FlakyUntil(3)
                },
                FixtureTest {
                    uid: "c".to_owned(),
                    behavior: Behavior::Hang
                },
            ]
        );
        assert_eq!(tests[1].display_name(), "b");
        assert!(!Behavior::FlakyUntil(3).passes_on(2));
        assert!(Behavior::FlakyUntil(3).passes_on(3));

        parse_tests("a=sometimes").expect_err("unknown behavior");
        parse_tests("a").expect_err("missing behavior");
    }
}
