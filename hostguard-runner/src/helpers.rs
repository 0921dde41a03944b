// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for hostguard-runner.

use std::{fmt, process::ExitStatus, time::Duration};

/// Utilities for pluralizing various words based on count or plurality.
pub mod plural {
    /// Returns "attempt" if `count` is 1, otherwise "attempts".
    pub fn attempts_str(count: usize) -> &'static str {
        if count == 1 { "attempt" } else { "attempts" }
    }

    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }

    /// Returns "process" if `count` is 1, otherwise "processes".
    pub fn processes_str(count: usize) -> &'static str {
        if count == 1 { "process" } else { "processes" }
    }

    /// Returns "dump" if `count` is 1, otherwise "dumps".
    pub fn dumps_str(count: usize) -> &'static str {
        if count == 1 { "dump" } else { "dumps" }
    }
}

#[derive(Debug)]
pub(crate) struct FormattedDuration(pub(crate) Duration);

impl fmt::Display for FormattedDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let duration = self.0.as_secs_f64();
        if duration > 60.0 {
            write!(f, "{}m {:.2}s", duration as u32 / 60, duration % 60.0)
        } else {
            write!(f, "{duration:.2}s")
        }
    }
}

// "exited with"/"terminated by"
pub(crate) fn display_exited_with(exit_status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(sig) = exit_status.signal() {
            return match signal_str(sig) {
                Some(s) => format!("terminated by signal {sig} (SIG{s})"),
                None => format!("terminated by signal {sig}"),
            };
        }
    }

    match exit_status.code() {
        Some(code) => format!("exited with exit code {code}"),
        None => "exited with an unknown error".to_owned(),
    }
}

#[cfg(unix)]
pub(crate) fn signal_str(signal: i32) -> Option<&'static str> {
    // These signal numbers are the same on at least Linux, macOS, FreeBSD and illumos.
    match signal {
        1 => Some("HUP"),
        2 => Some("INT"),
        3 => Some("QUIT"),
        4 => Some("ILL"),
        5 => Some("TRAP"),
        6 => Some("ABRT"),
        8 => Some("FPE"),
        9 => Some("KILL"),
        11 => Some("SEGV"),
        13 => Some("PIPE"),
        14 => Some("ALRM"),
        15 => Some("TERM"),
        _ => None,
    }
}

/// Displays an error along with its chain of sources, separated by `: `.
pub struct DisplayErrorChain<E>(E);

impl<E: std::error::Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self(error)
    }
}

impl<E: std::error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Duration::from_millis(1500), "1.50s"; "seconds")]
    #[test_case(Duration::from_secs(125), "2m 5.00s"; "minutes")]
    fn formatted_duration(duration: Duration, expected: &str) {
        assert_eq!(FormattedDuration(duration).to_string(), expected);
    }

    #[test]
    fn error_chain_includes_sources() {
        let err = crate::errors::ArtifactRelocateError::new(
            "/a".into(),
            "/b".into(),
            std::io::Error::other("disk full"),
        );
        assert_eq!(
            DisplayErrorChain::new(&err).to_string(),
            "failed to move artifacts from `/a` to `/b`: disk full"
        );
    }

    #[cfg(unix)]
    #[test]
    fn exited_with_signal() {
        use std::os::unix::process::ExitStatusExt;

        // A raw wait status of 11 means "killed by SIGSEGV".
        let status = ExitStatus::from_raw(11);
        assert_eq!(
            display_exited_with(status),
            "terminated by signal 11 (SIGSEGV)"
        );

        // A raw wait status of 3 << 8 means "exited with code 3".
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(display_exited_with(status), "exited with exit code 3");
    }
}
