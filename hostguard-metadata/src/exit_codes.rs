// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `hostguard` sessions.
///
/// The numeric values are a stable external contract: CI systems match on them.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum HostGuardExitCode {}

impl HostGuardExitCode {
    /// All selected tests passed.
    pub const SUCCESS: i32 = 0;

    /// An unexpected error occurred.
    pub const GENERIC_FAILURE: i32 = 1;

    /// At least one test failed, after any retries.
    pub const AT_LEAST_ONE_TEST_FAILED: i32 = 2;

    /// The session was aborted by the operator (for example, with Ctrl-C).
    pub const TEST_SESSION_ABORTED: i32 = 3;

    /// The supervisor could not be set up on this platform.
    pub const INVALID_PLATFORM_SETUP: i32 = 4;

    /// The command line or the configuration was rejected before any attempt ran.
    pub const INVALID_COMMAND_LINE: i32 = 5;

    /// The test host crashed or hung.
    pub const TEST_HOST_PROCESS_EXITED_NON_GRACEFULLY: i32 = 7;

    /// No tests were run.
    pub const ZERO_TESTS: i32 = 8;

    /// Fewer tests ran than `--minimum-expected-tests` requires.
    pub const MINIMUM_EXPECTED_TESTS_POLICY_VIOLATION: i32 = 9;

    /// The host was asked to stop because `--maximum-failed-tests` was reached.
    pub const TEST_EXECUTION_STOPPED_FOR_MAX_FAILED_TESTS: i32 = 13;
}
