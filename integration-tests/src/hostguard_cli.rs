// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use std::{
    borrow::Cow,
    collections::HashMap,
    ffi::OsString,
    fmt,
    process::{Command, ExitStatus},
};

/// Environment variables that would make a test depend on the environment it runs in.
const CLEARED_ENV: &[&str] = &[
    "HOSTGUARD_LOG",
    "HOSTGUARD_CONFIG",
    "HOSTGUARD_DIAGNOSTIC_VERBOSITY",
];

#[derive(Clone, Debug)]
pub struct HostGuardCli {
    bin: Utf8PathBuf,
    args: Vec<String>,
    envs: HashMap<OsString, OsString>,
    unchecked: bool,
}

impl HostGuardCli {
    pub fn new(bin: impl Into<Utf8PathBuf>) -> Self {
        let mut envs = HashMap::new();
        envs.insert("HOSTGUARD_COLOR".into(), "never".into());
        Self {
            bin: bin.into(),
            args: Vec::new(),
            envs,
            unchecked: false,
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(&mut self, arg: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(arg.into_iter().map(Into::into));
        self
    }

    pub fn env(&mut self, k: impl Into<OsString>, v: impl Into<OsString>) -> &mut Self {
        self.envs.insert(k.into(), v.into());
        self
    }

    /// If set, a non-zero exit doesn't cause [`Self::output`] to panic.
    pub fn unchecked(&mut self, unchecked: bool) -> &mut Self {
        self.unchecked = unchecked;
        self
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.bin);
        for name in CLEARED_ENV {
            command.env_remove(name);
        }
        command.args(&self.args);
        command.envs(&self.envs);
        command
    }

    pub fn output(&self) -> HostGuardOutput {
        let mut command = self.command();
        let output = command.output().expect("failed to execute");

        let ret = HostGuardOutput {
            command,
            exit_status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        };

        if !self.unchecked && !output.status.success() {
            panic!("command failed:\n\n{ret}");
        }

        ret
    }
}

pub struct HostGuardOutput {
    pub command: Command,
    pub exit_status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl HostGuardOutput {
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.code()
    }

    pub fn stdout_as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

impl fmt::Display for HostGuardOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command: {:?}\nexit code: {:?}\n\
                   --- stdout ---\n{}\n\n--- stderr ---\n{}\n\n",
            self.command,
            self.exit_status.code(),
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr)
        )
    }
}

// Make Debug output the same as Display output, so `.unwrap()` and `.expect()` are nicer.
impl fmt::Debug for HostGuardOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
