// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use integration_tests::{fixture::TESTS_ENV, hostguard_cli::HostGuardCli};

pub fn fixture_host() -> &'static str {
    env!("CARGO_BIN_EXE_fixture-host")
}

pub fn fixture_dump() -> &'static str {
    env!("CARGO_BIN_EXE_fixture-dump")
}

/// A temporary working directory with a config that points at the fake dump tool.
pub struct TempSession {
    dir: Utf8TempDir,
}

impl TempSession {
    pub fn new() -> Self {
        Self::with_capabilities(&[])
    }

    pub fn with_capabilities(capabilities: &[&str]) -> Self {
        let dir = camino_tempfile::Builder::new()
            .prefix("hostguard-test-")
            .tempdir()
            .expect("created temp dir");
        let capabilities = capabilities
            .iter()
            .map(|capability| format!("\"{capability}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let config = format!(
            "[host]\ncapabilities = [{capabilities}]\n\n[dump]\ntool = '{}'\n",
            fixture_dump()
        );
        fs_err::write(dir.path().join("hostguard.toml"), config).expect("wrote config");
        Self { dir }
    }

    pub fn results_dir(&self) -> Utf8PathBuf {
        self.dir.path().join("results")
    }

    /// Returns a CLI invocation that runs `tests` in the fixture host. Arguments added to the
    /// returned value must be followed by [`with_host`].
    pub fn cli(&self, tests: &str) -> HostGuardCli {
        let mut cli = HostGuardCli::new(env!("CARGO_BIN_EXE_hostguard-dup"));
        cli.env(TESTS_ENV, tests).args([
            "--config-file",
            self.dir.path().join("hostguard.toml").as_str(),
            "--results-directory",
            self.results_dir().as_str(),
        ]);
        cli
    }
}

/// Appends the fixture host command line.
pub fn with_host(cli: &mut HostGuardCli) -> &mut HostGuardCli {
    cli.args(["--", fixture_host()])
}

/// Returns all files under `dir` whose names end with `suffix`.
pub fn files_ending_with(dir: &Utf8Path, suffix: &str) -> Vec<Utf8PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_owned()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = dir.read_dir_utf8() else {
            continue;
        };
        for entry in entries {
            let entry = entry.expect("read directory entry");
            let path = entry.path().to_owned();
            if path.is_dir() {
                pending.push(path);
            } else if path.as_str().ends_with(suffix) {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}
