// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Displays session progress and the final outcome to the operator.
//!
//! The main structure in this module is [`SessionReporter`].

use crate::{
    dump::CapturedDump,
    helpers::{FormattedDuration, plural},
    results::{AttemptStatus, SessionEnd, SessionOutcome},
    retry::SessionEvent,
};
use owo_colors::{OwoColorize, Style};
use std::{
    fmt,
    io::{self, Write},
    time::Duration,
};

/// Writes human-readable lines for [`SessionEvent`]s and [`SessionOutcome`]s.
#[derive(Debug, Default)]
pub struct SessionReporter {
    styles: Box<Styles>,
}

impl SessionReporter {
    /// Creates a new reporter with colors disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Colorizes output.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }

    /// Reports a retry-related event.
    pub fn report_event(&self, event: &SessionEvent<'_>, mut writer: impl Write) -> io::Result<()> {
        let styles = &self.styles;
        match event {
            SessionEvent::AttemptStarted {
                index,
                max_attempts,
                filter,
            } => {
                write!(
                    writer,
                    "{:>12} attempt {}/{}: ",
                    "START".style(styles.start),
                    index.style(styles.count),
                    max_attempts.style(styles.count),
                )?;
                if filter.is_empty() {
                    writeln!(writer, "running all tests")?;
                } else {
                    writeln!(
                        writer,
                        "re-running {} failed {}",
                        filter.len().style(styles.count),
                        plural::tests_str(filter.len()),
                    )?;
                }
            }
            SessionEvent::AttemptFailed {
                index,
                max_attempts,
                failed,
                exit_code,
            } => {
                writeln!(
                    writer,
                    "{}, total failed tests: {}, exit code: {}, attempt: {}/{}",
                    "Tests suite failed".style(styles.retry),
                    failed.style(styles.count),
                    DisplayExitCode(*exit_code),
                    index,
                    max_attempts,
                )?;
            }
            SessionEvent::RetrySuppressed { reason } => {
                writeln!(
                    writer,
                    "{}",
                    "Failure threshold policy is enabled, failed tests will not be restarted."
                        .style(styles.fail),
                )?;
                writeln!(writer, "{reason}")?;
            }
            SessionEvent::ArtifactsRelocated { index, dir } => {
                writeln!(
                    writer,
                    "{:>12} artifacts of attempt {} to {dir}",
                    "MOVED".style(styles.skip),
                    index.style(styles.count),
                )?;
            }
            SessionEvent::SessionFinished {
                end,
                attempts,
                max_attempts,
            } => self.write_session_finished(*end, *attempts, *max_attempts, &mut writer)?,
        }
        Ok(())
    }

    fn write_session_finished(
        &self,
        end: SessionEnd,
        attempts: usize,
        max_attempts: usize,
        mut writer: impl Write,
    ) -> io::Result<()> {
        let styles = &self.styles;
        match end {
            SessionEnd::Succeeded => writeln!(
                writer,
                "{} in {attempts} {}",
                "Tests suite completed successfully".style(styles.pass),
                plural::attempts_str(attempts),
            ),
            SessionEnd::Exhausted => writeln!(
                writer,
                "{} in all {max_attempts} {}",
                "Tests suite failed".style(styles.fail),
                plural::attempts_str(max_attempts),
            ),
            SessionEnd::StoppedByThreshold => writeln!(
                writer,
                "{} after {attempts} {}, no more retries",
                "Tests suite failed".style(styles.fail),
                plural::attempts_str(attempts),
            ),
            SessionEnd::StoppedForMaxFailures => writeln!(
                writer,
                "{} for maximum failed tests, attempt: {attempts}/{max_attempts}",
                "Test execution stopped".style(styles.fail),
            ),
            SessionEnd::Aborted => writeln!(
                writer,
                "{}, attempt: {attempts}/{max_attempts}",
                "Test session aborted".style(styles.fail),
            ),
            SessionEnd::RetryFailed => writeln!(
                writer,
                "{} after {attempts} {}, retry attempt {}/{max_attempts} could not be run",
                "Tests suite failed".style(styles.fail),
                plural::attempts_str(attempts),
                attempts + 1,
            ),
        }
    }

    /// Reports the final outcome of a session.
    pub fn report_outcome(&self, outcome: &SessionOutcome, mut writer: impl Write) -> io::Result<()> {
        let styles = &self.styles;

        if let Some(attempt) = outcome.last_attempt() {
            match &attempt.status {
                AttemptStatus::Completed => {}
                AttemptStatus::Crashed { reason, dumps } => {
                    writeln!(writer, "{:>12} {reason}", "CRASH".style(styles.fail))?;
                    self.write_dumps(dumps, &mut writer)?;
                }
                AttemptStatus::Hung { report, dumps } => {
                    writeln!(
                        writer,
                        "{:>12} test host made no progress for {}",
                        "HANG".style(styles.fail),
                        FormattedDuration(report.timeout),
                    )?;
                    for test in &report.executing_tests {
                        writeln!(
                            writer,
                            "{:>12} {} ({})",
                            "",
                            test.display_name.style(styles.test_name),
                            test.uid,
                        )?;
                    }
                    self.write_dumps(dumps, &mut writer)?;
                }
                AttemptStatus::Aborted => {
                    writeln!(writer, "{:>12} session aborted", "ABORT".style(styles.fail))?;
                }
            }
        }

        let counts = outcome.results.counts();
        let duration: Duration = outcome.attempts.iter().map(|attempt| attempt.duration).sum();
        let summary_style = if outcome.final_exit_code == 0 {
            styles.pass
        } else {
            styles.fail
        };
        write!(
            writer,
            "{:>12} [{}] {} {} run: {} passed",
            "Summary".style(summary_style),
            FormattedDuration(duration),
            counts.executed().style(styles.count),
            plural::tests_str(counts.executed()),
            counts.passed.style(styles.pass),
        )?;
        if counts.failed > 0 {
            write!(writer, ", {} failed", counts.failed.style(styles.fail))?;
        }
        write!(writer, ", {} skipped", counts.skipped.style(styles.skip))?;
        if counts.in_progress > 0 {
            write!(
                writer,
                ", {} unfinished",
                counts.in_progress.style(styles.fail)
            )?;
        }
        let attempts = outcome.attempts.len();
        if attempts > 1 {
            write!(writer, " in {attempts} {}", plural::attempts_str(attempts))?;
        }
        writeln!(writer)?;

        for result in outcome.results.iter() {
            if result.outcome == hostguard_metadata::TestOutcome::Failed {
                writeln!(
                    writer,
                    "{:>12} {} ({})",
                    "FAIL".style(styles.fail),
                    result.display_name.style(styles.test_name),
                    result.uid,
                )?;
            }
        }
        Ok(())
    }

    fn write_dumps(&self, dumps: &[CapturedDump], mut writer: impl Write) -> io::Result<()> {
        if dumps.is_empty() {
            return Ok(());
        }
        writeln!(
            writer,
            "{:>12} {} {} written:",
            "",
            dumps.len().style(self.styles.count),
            plural::dumps_str(dumps.len()),
        )?;
        for dump in dumps {
            writeln!(
                writer,
                "{:>12} {} (pid {}): {}",
                "",
                dump.process_name,
                dump.pid,
                dump.path,
            )?;
        }
        Ok(())
    }
}

struct DisplayExitCode(Option<i32>);

impl fmt::Display for DisplayExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "{code}"),
            None => f.write_str("none"),
        }
    }
}

#[derive(Debug, Default)]
struct Styles {
    count: Style,
    start: Style,
    pass: Style,
    retry: Style,
    fail: Style,
    skip: Style,
    test_name: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.start = Style::new().green().bold();
        self.pass = Style::new().green().bold();
        self.retry = Style::new().magenta().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
        self.test_name = Style::new().blue().bold();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dump::DumpTrigger,
        monitor::{ExecutingTest, HangReport},
        results::{Attempt, TestResult, TestResults},
    };
    use chrono::{DateTime, Local};
    use hostguard_metadata::{TestOutcome, TestUid};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn event_str(event: SessionEvent<'_>) -> String {
        let mut buf = Vec::new();
        SessionReporter::new()
            .report_event(&event, &mut buf)
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn attempt_failed_line() {
        let line = event_str(SessionEvent::AttemptFailed {
            index: 3,
            max_attempts: 4,
            failed: 2,
            exit_code: Some(2),
        });
        assert_eq!(
            line,
            "Tests suite failed, total failed tests: 2, exit code: 2, attempt: 3/4\n"
        );
    }

    #[test]
    fn retry_suppressed_includes_reason() {
        let output = event_str(SessionEvent::RetrySuppressed {
            reason: "Percentage failed threshold is 50% and 66.67% tests failed (2/3)",
        });
        assert_eq!(
            output,
            "Failure threshold policy is enabled, failed tests will not be restarted.\n\
             Percentage failed threshold is 50% and 66.67% tests failed (2/3)\n"
        );
    }

    #[test_case(SessionEnd::Succeeded, 3, 4, "Tests suite completed successfully in 3 attempts\n"; "succeeded")]
    #[test_case(SessionEnd::Succeeded, 1, 4, "Tests suite completed successfully in 1 attempt\n"; "succeeded first time")]
    #[test_case(SessionEnd::Exhausted, 4, 4, "Tests suite failed in all 4 attempts\n"; "exhausted")]
    #[test_case(SessionEnd::Aborted, 2, 4, "Test session aborted, attempt: 2/4\n"; "aborted")]
    #[test_case(
        SessionEnd::RetryFailed, 1, 4,
        "Tests suite failed after 1 attempt, retry attempt 2/4 could not be run\n";
        "retry failed"
    )]
    fn session_finished_line(end: SessionEnd, attempts: usize, max_attempts: usize, expected: &str) {
        let line = event_str(SessionEvent::SessionFinished {
            end,
            attempts,
            max_attempts,
        });
        assert_eq!(line, expected);
    }

    #[test]
    fn attempt_started_with_filter() {
        let filter = [TestUid::new("a.one")];
        let line = event_str(SessionEvent::AttemptStarted {
            index: 2,
            max_attempts: 4,
            filter: &filter,
        });
        assert_eq!(line, "       START attempt 2/4: re-running 1 failed test\n");
    }

    fn outcome(status: AttemptStatus, results: TestResults, final_exit_code: i32) -> SessionOutcome {
        let attempt = Attempt {
            index: 1,
            max_attempts: 1,
            results: results.clone(),
            exit_code: None,
            artifacts_dir: "/results".into(),
            status,
            stopped_for_max_failures: false,
            start_time: DateTime::<Local>::default(),
            duration: Duration::from_millis(1500),
        };
        SessionOutcome {
            attempts: vec![attempt],
            results,
            end: SessionEnd::StoppedByThreshold,
            final_exit_code,
        }
    }

    fn result(uid: &str, display_name: &str, outcome: TestOutcome) -> TestResult {
        TestResult {
            uid: TestUid::new(uid),
            display_name: display_name.to_owned(),
            outcome,
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T10:00:00+00:00").unwrap(),
        }
    }

    #[test]
    fn hung_outcome_lists_tests_and_dumps() {
        let mut results = TestResults::new();
        results.record(result("a.one", "one", TestOutcome::Passed));
        results.record(result("a.slow", "slow", TestOutcome::InProgress));
        let status = AttemptStatus::Hung {
            report: HangReport {
                timeout: Duration::from_secs(90),
                executing_tests: vec![ExecutingTest {
                    uid: TestUid::new("a.slow"),
                    display_name: "slow".to_owned(),
                    started_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00+00:00")
                        .unwrap(),
                }],
            },
            dumps: vec![CapturedDump {
                trigger: DumpTrigger::Hang,
                pid: 42,
                process_name: "host".to_owned(),
                path: "/results/host_42_hang.dmp".into(),
            }],
        };

        let mut buf = Vec::new();
        SessionReporter::new()
            .report_outcome(&outcome(status, results, 7), &mut buf)
            .unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert_eq!(
            output,
            "        HANG test host made no progress for 1m 30.00s\n             \
             slow (a.slow)\n             \
             1 dump written:\n             \
             host (pid 42): /results/host_42_hang.dmp\n     \
             Summary [1.50s] 1 test run: 1 passed, 0 skipped, 1 unfinished\n"
        );
    }

    #[test]
    fn failed_tests_are_listed() {
        let mut results = TestResults::new();
        results.record(result("a.one", "same", TestOutcome::Failed));
        results.record(result("a.two", "same", TestOutcome::Passed));

        let mut buf = Vec::new();
        SessionReporter::new()
            .report_outcome(&outcome(AttemptStatus::Completed, results, 2), &mut buf)
            .unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert_eq!(
            output,
            "     Summary [1.50s] 2 tests run: 1 passed, 1 failed, 0 skipped\n        \
             FAIL same (a.one)\n"
        );
    }
}
