// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests.
//!
//! These run `hostguard-dup`, a copy of the hostguard binary built from this package, against
//! `fixture-host`, a test host whose tests are scripted through environment variables. Dumps are
//! written by `fixture-dump`, which stands in for a real dump tool.

use camino::Utf8PathBuf;
use hostguard_metadata::HostGuardExitCode;
use hostguard_runner::{
    retry::{RETRIES_DIR, SUMMARY_FILE_NAME},
    runner::HANG_REPORT_FILE_NAME,
};
use integration_tests::fixture::{CHILDREN_ENV, STARTED_FILE, TEST_DELAY_ENV};
use pretty_assertions::assert_eq;

mod fixtures;

use fixtures::*;

#[test]
fn all_tests_pass() {
    let session = TempSession::new();
    let output = with_host(&mut session.cli("a=pass;b=pass")).output();

    assert_eq!(output.exit_code(), Some(HostGuardExitCode::SUCCESS));
    assert!(
        output.stdout_as_str().contains("[fixture-host] running 2 tests"),
        "non-protocol host output is forwarded to stdout:\n{output}"
    );
    assert!(
        session.results_dir().join(SUMMARY_FILE_NAME).is_file(),
        "session summary is written"
    );
}

#[test]
fn persistent_failure_runs_retries_plus_one_attempts() {
    let session = TempSession::new();
    let output = with_host(
        session
            .cli("a=pass;b=fail")
            .args(["--retry-failed-tests", "3"])
            .unchecked(true),
    )
    .output();

    assert_eq!(
        output.exit_code(),
        Some(HostGuardExitCode::AT_LEAST_ONE_TEST_FAILED),
        "{output}"
    );
    let stderr = output.stderr_as_str();
    assert!(stderr.contains("START attempt 4/4"), "{output}");
    assert!(!stderr.contains("5/4"), "no attempt beyond the last:\n{output}");
    assert!(
        stderr.contains("Tests suite failed in all 4 attempts"),
        "{output}"
    );
    assert!(
        stderr.contains("re-running 1 failed test"),
        "only the failed uid is retried:\n{output}"
    );
}

#[test]
fn flaky_test_passes_on_retry() {
    let session = TempSession::new();
    let output =
        with_host(session.cli("a=pass;b=flaky:2").args(["--retry-failed-tests", "3"])).output();

    assert_eq!(output.exit_code(), Some(HostGuardExitCode::SUCCESS));
    assert!(
        output
            .stderr_as_str()
            .contains("Tests suite completed successfully in 2 attempts"),
        "{output}"
    );

    // Attempt 1 writes directly into the results directory, retries into Retries/<id>.
    let results_dir = session.results_dir();
    assert_eq!(fs_err::read_to_string(results_dir.join(STARTED_FILE)).unwrap(), "1");
    let retries = files_ending_with(&results_dir.join(RETRIES_DIR), STARTED_FILE);
    assert_eq!(retries.len(), 1, "one retry attempt: {retries:?}");
    let id = retries[0]
        .parent()
        .and_then(|dir| dir.file_name())
        .expect("retry dir has a name");
    assert_eq!(id.len(), 5, "retry id `{id}` is 5 characters");
    assert_eq!(fs_err::read_to_string(&retries[0]).unwrap(), "2");
}

#[test]
fn percentage_threshold_suppresses_retry() {
    let session = TempSession::new();
    let output = with_host(
        session
            .cli("a=pass;b=fail;c=fail")
            .args([
                "--retry-failed-tests",
                "3",
                "--retry-failed-tests-max-percentage",
                "50",
            ])
            .unchecked(true),
    )
    .output();

    assert_eq!(
        output.exit_code(),
        Some(HostGuardExitCode::AT_LEAST_ONE_TEST_FAILED)
    );
    let stderr = output.stderr_as_str();
    assert!(stderr.contains("66.67% tests failed (2/3)"), "{output}");
    assert!(!stderr.contains("START attempt 2/4"), "no retry:\n{output}");
}

#[test]
fn percentage_threshold_allows_retry_below_limit() {
    let session = TempSession::new();
    let output = with_host(
        session
            .cli("a=pass;b=pass;c=fail")
            .args([
                "--retry-failed-tests",
                "3",
                "--retry-failed-tests-max-percentage",
                "50",
            ])
            .unchecked(true),
    )
    .output();

    assert_eq!(
        output.exit_code(),
        Some(HostGuardExitCode::AT_LEAST_ONE_TEST_FAILED)
    );
    let stderr = output.stderr_as_str();
    assert!(stderr.contains("START attempt 4/4"), "{output}");
    assert!(
        !stderr.contains("Failure threshold policy is enabled"),
        "{output}"
    );
}

#[test]
fn absolute_threshold_suppresses_retry() {
    let session = TempSession::new();
    let output = with_host(
        session
            .cli("a=fail;b=fail;c=pass")
            .args([
                "--retry-failed-tests",
                "2",
                "--retry-failed-tests-max-tests",
                "1",
            ])
            .unchecked(true),
    )
    .output();

    assert_eq!(
        output.exit_code(),
        Some(HostGuardExitCode::AT_LEAST_ONE_TEST_FAILED)
    );
    assert!(
        output
            .stderr_as_str()
            .contains("Maximum failed tests threshold is 1 and 2 tests failed"),
        "{output}"
    );
}

#[test]
fn crash_is_not_retried() {
    let session = TempSession::new();
    let output = with_host(
        session
            .cli("a=pass;b=crash")
            .args(["--retry-failed-tests", "2", "--crashdump"])
            .unchecked(true),
    )
    .output();

    assert_eq!(
        output.exit_code(),
        Some(HostGuardExitCode::TEST_HOST_PROCESS_EXITED_NON_GRACEFULLY),
        "{output}"
    );
    assert!(
        !output.stderr_as_str().contains("START attempt 2/3"),
        "{output}"
    );
}

#[cfg(unix)]
#[test]
fn hang_dumps_every_process_in_the_tree() {
    let session = TempSession::new();
    let output = with_host(
        session
            .cli("a=pass;b=hang")
            .env(CHILDREN_ENV, "3")
            .args(["--crashdump", "--hangdump", "--hangdump-timeout", "2s"])
            .unchecked(true),
    )
    .output();

    assert_eq!(
        output.exit_code(),
        Some(HostGuardExitCode::TEST_HOST_PROCESS_EXITED_NON_GRACEFULLY),
        "{output}"
    );
    let results_dir = session.results_dir();
    let hang_dumps = files_ending_with(&results_dir, "_hang.dmp");
    assert_eq!(hang_dumps.len(), 4, "root and 3 children: {hang_dumps:?}");
    assert_eq!(
        files_ending_with(&results_dir, "_crash.dmp"),
        Vec::<Utf8PathBuf>::new(),
        "a hang never also produces crash dumps"
    );
}

#[test]
fn concurrent_hangs_with_the_same_display_name() {
    let session = TempSession::new();
    let output = with_host(
        session
            .cli("suite.same#1=hang;suite.same#2=hang")
            .args(["--hangdump", "--hangdump-timeout", "1s"])
            .unchecked(true),
    )
    .output();

    assert_eq!(
        output.exit_code(),
        Some(HostGuardExitCode::TEST_HOST_PROCESS_EXITED_NON_GRACEFULLY),
        "{output}"
    );
    let report = fs_err::read_to_string(session.results_dir().join(HANG_REPORT_FILE_NAME))
        .expect("hang report");
    let report: serde_json::Value = serde_json::from_str(&report).expect("hang report is JSON");
    let uids: Vec<_> = report["executing-tests"]
        .as_array()
        .expect("executing-tests is an array")
        .iter()
        .map(|test| test["uid"].as_str().expect("uid is a string"))
        .collect();
    assert_eq!(uids, vec!["suite.same#1", "suite.same#2"]);
}

#[test]
fn graceful_stop_after_maximum_failed_tests() {
    let session = TempSession::with_capabilities(&["graceful-stop"]);
    let output = with_host(
        session
            .cli("a=fail;b=fail;c=pass;d=pass;e=pass;f=pass")
            .env(TEST_DELAY_ENV, "200")
            .args(["--maximum-failed-tests", "2", "--retry-failed-tests", "2"])
            .unchecked(true),
    )
    .output();

    assert_eq!(
        output.exit_code(),
        Some(HostGuardExitCode::TEST_EXECUTION_STOPPED_FOR_MAX_FAILED_TESTS),
        "{output}"
    );
    let stderr = output.stderr_as_str();
    assert!(
        stderr.contains("Test execution stopped for maximum failed tests"),
        "{output}"
    );
    assert!(
        !stderr.contains("START attempt 2/3"),
        "a stopped attempt is not retried:\n{output}"
    );
}

#[test]
fn maximum_failed_tests_requires_capability() {
    let session = TempSession::new();
    let output = with_host(
        session
            .cli("a=fail")
            .args(["--maximum-failed-tests", "1"])
            .unchecked(true),
    )
    .output();

    assert_eq!(
        output.exit_code(),
        Some(HostGuardExitCode::INVALID_COMMAND_LINE),
        "{output}"
    );
    assert!(
        output.stderr_as_str().contains("graceful-stop"),
        "error names the missing capability:\n{output}"
    );
    assert!(
        !session.results_dir().join(STARTED_FILE).exists(),
        "the host never ran"
    );
}

#[test]
fn ignored_exit_code_becomes_success() {
    let session = TempSession::new();
    let output = with_host(session.cli("a=pass;b=fail").args(["--ignore-exit-code", "2"])).output();

    assert_eq!(output.exit_code(), Some(HostGuardExitCode::SUCCESS));
}

#[test]
fn zero_tests() {
    let session = TempSession::new();
    let output = with_host(session.cli("").unchecked(true)).output();

    assert_eq!(output.exit_code(), Some(HostGuardExitCode::ZERO_TESTS));
}

#[test]
fn minimum_expected_tests() {
    let session = TempSession::new();
    let output = with_host(
        session
            .cli("a=pass;b=pass")
            .args(["--minimum-expected-tests", "5"])
            .unchecked(true),
    )
    .output();

    assert_eq!(
        output.exit_code(),
        Some(HostGuardExitCode::MINIMUM_EXPECTED_TESTS_POLICY_VIOLATION)
    );
}

#[test]
fn usage_error_is_invalid_command_line() {
    let session = TempSession::new();
    let output = with_host(session.cli("a=pass").arg("--bogus").unchecked(true)).output();

    assert_eq!(
        output.exit_code(),
        Some(HostGuardExitCode::INVALID_COMMAND_LINE),
        "clap's exit code must not be used:\n{output}"
    );
}

#[test]
fn missing_prerequisite_is_invalid_command_line() {
    let session = TempSession::new();
    let output = with_host(
        session
            .cli("a=pass")
            .args(["--hangdump-type", "Mini"])
            .unchecked(true),
    )
    .output();

    assert_eq!(
        output.exit_code(),
        Some(HostGuardExitCode::INVALID_COMMAND_LINE)
    );
    assert!(
        output.stderr_as_str().contains("--hangdump"),
        "error names the prerequisite:\n{output}"
    );
}

#[cfg(unix)]
#[test]
fn sigterm_aborts_the_session() {
    use std::{
        process::Stdio,
        time::{Duration, Instant},
    };

    let session = TempSession::new();
    let mut child = with_host(session.cli("a=hang").args(["--retry-failed-tests", "2"]))
        .command()
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawned hostguard");

    let started = session.results_dir().join(STARTED_FILE);
    let deadline = Instant::now() + Duration::from_secs(30);
    while !started.exists() {
        assert!(Instant::now() < deadline, "fixture host never started");
        std::thread::sleep(Duration::from_millis(50));
    }

    // SAFETY: sending a signal to a child process we own.
    let ret = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    assert_eq!(ret, 0, "sent SIGTERM");

    let status = child.wait().expect("waited for hostguard");
    assert_eq!(status.code(), Some(HostGuardExitCode::TEST_SESSION_ABORTED));
}
