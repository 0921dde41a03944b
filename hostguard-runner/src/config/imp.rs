// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::HangTimeout;
use crate::{dump::DumpKind, errors::ConfigParseError, stop::CapabilityKind};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Overall configuration for hostguard.
///
/// This is the root data structure for hostguard configuration. The embedded default config is
/// layered under the user's config file, if present.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HostGuardConfig {
    host: HostConfig,
    supervisor: SupervisorConfig,
    dump: DumpToolConfig,
    hang_dump: HangDumpConfig,
    crash_dump: CrashDumpConfig,
}

impl HostGuardConfig {
    /// The default location of the config within the working directory.
    pub const CONFIG_PATH: &'static str = ".config/hostguard.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// Reads the config from the given file, or from `.config/hostguard.toml` in `cwd` if no file
    /// is given.
    ///
    /// An explicitly specified file must exist. The default file is optional.
    pub fn from_sources(
        cwd: &Utf8Path,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let (config_file, source) = match config_file {
            Some(file) => {
                let file = cwd.join(file);
                let source = File::new(file.as_str(), FileFormat::Toml);
                (file, source)
            }
            None => {
                let file = cwd.join(Self::CONFIG_PATH);
                let source = File::new(file.as_str(), FileFormat::Toml).required(false);
                (file, source)
            }
        };
        debug!(%config_file, "reading config");

        Self::make_default_config()
            .add_source(source)
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| ConfigParseError::new(config_file, err))
    }

    /// Returns the default config, without any user overrides.
    pub fn default_config() -> Result<Self, ConfigParseError> {
        Self::make_default_config()
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| ConfigParseError::new("<default config>", err))
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// Returns the default host command line. Empty if not configured.
    pub fn host_command(&self) -> &[String] {
        &self.host.command
    }

    /// Returns the capabilities the host declares.
    pub fn capabilities(&self) -> &[CapabilityKind] {
        &self.host.capabilities
    }

    /// Returns the configured results directory. May be relative.
    pub fn results_directory(&self) -> &Utf8Path {
        &self.supervisor.results_directory
    }

    /// Returns how often the host's process tree is enumerated.
    pub fn tree_poll_interval(&self) -> Duration {
        self.supervisor.tree_poll_interval
    }

    /// Returns how long an aborted host has to exit before it is killed.
    pub fn abort_grace_period(&self) -> Duration {
        self.supervisor.abort_grace_period
    }

    /// Returns how long to wait for the host to acknowledge a stop request.
    pub fn stop_ack_timeout(&self) -> Duration {
        self.supervisor.stop_ack_timeout
    }

    /// Returns the default diagnostic verbosity, e.g. `"info"` or `"trace"`.
    pub fn diagnostic_verbosity(&self) -> &str {
        &self.supervisor.diagnostic_verbosity
    }

    /// Returns the dump tool configuration.
    pub fn dump_tool(&self) -> &DumpToolConfig {
        &self.dump
    }

    /// Returns the default hang timeout.
    pub fn hang_timeout(&self) -> HangTimeout {
        self.hang_dump.timeout
    }

    /// Returns the default hang dump type.
    pub fn hang_dump_kind(&self) -> DumpKind {
        self.hang_dump.kind
    }

    /// Returns the default crash dump type.
    pub fn crash_dump_kind(&self) -> DumpKind {
        self.crash_dump.kind
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct HostConfig {
    command: Vec<String>,
    capabilities: Vec<CapabilityKind>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct SupervisorConfig {
    results_directory: Utf8PathBuf,
    #[serde(with = "humantime_serde")]
    tree_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    abort_grace_period: Duration,
    #[serde(with = "humantime_serde")]
    stop_ack_timeout: Duration,
    diagnostic_verbosity: String,
}

/// The external tool used to write dumps.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DumpToolConfig {
    /// The program to run.
    pub tool: String,

    /// Arguments, with `{kind-flag}`, `{path}` and `{pid}` placeholders.
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct HangDumpConfig {
    timeout: HangTimeout,
    #[serde(rename = "type")]
    kind: DumpKind,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CrashDumpConfig {
    #[serde(rename = "type")]
    kind: DumpKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn write_config(dir: &Utf8TempDir, rel_path: &str, contents: &str) {
        let path = dir.path().join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn default_config_is_valid() {
        let config = HostGuardConfig::default_config().expect("default config is valid");
        assert!(config.host_command().is_empty());
        assert!(config.capabilities().is_empty());
        assert_eq!(config.results_directory(), "TestResults");
        assert_eq!(config.tree_poll_interval(), Duration::from_millis(250));
        assert_eq!(config.abort_grace_period(), Duration::from_secs(10));
        assert_eq!(config.stop_ack_timeout(), Duration::from_secs(30));
        assert_eq!(config.diagnostic_verbosity(), "info");
        assert_eq!(config.dump_tool().tool, "createdump");
        assert_eq!(config.hang_timeout().duration(), Duration::from_secs(30 * 60));
        assert_eq!(config.hang_dump_kind(), DumpKind::Full);
        assert_eq!(config.crash_dump_kind(), DumpKind::Full);
    }

    #[test]
    fn missing_default_file_uses_defaults() {
        let dir = Utf8TempDir::new().unwrap();
        let config = HostGuardConfig::from_sources(dir.path(), None).unwrap();
        assert_eq!(config.diagnostic_verbosity(), "info");
    }

    #[test]
    fn user_file_overrides_defaults() {
        let dir = Utf8TempDir::new().unwrap();
        write_config(
            &dir,
            HostGuardConfig::CONFIG_PATH,
            indoc! {r#"
                [host]
                command = ["./my-host", "--verbose"]
                capabilities = ["graceful-stop"]

                [supervisor]
                diagnostic-verbosity = "trace"
                tree-poll-interval = "100ms"

                [hang-dump]
                timeout = "1.5m"
                type = "mini"
            "#},
        );

        let config = HostGuardConfig::from_sources(dir.path(), None).unwrap();
        assert_eq!(config.host_command(), ["./my-host", "--verbose"]);
        assert_eq!(config.capabilities(), [CapabilityKind::GracefulStop]);
        assert_eq!(config.diagnostic_verbosity(), "trace");
        assert_eq!(config.tree_poll_interval(), Duration::from_millis(100));
        assert_eq!(config.hang_timeout().duration(), Duration::from_secs(90));
        assert_eq!(config.hang_dump_kind(), DumpKind::Mini);
        // Untouched keys keep their defaults.
        assert_eq!(config.abort_grace_period(), Duration::from_secs(10));
        assert_eq!(config.crash_dump_kind(), DumpKind::Full);
    }

    #[test]
    fn explicit_file_must_exist() {
        let dir = Utf8TempDir::new().unwrap();
        let err = HostGuardConfig::from_sources(dir.path(), Some("missing.toml".as_ref()))
            .unwrap_err();
        assert_eq!(err.config_file(), &dir.path().join("missing.toml"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = Utf8TempDir::new().unwrap();
        write_config(
            &dir,
            "custom.toml",
            indoc! {r#"
                [crash-dump]
                type = "Enormous"
            "#},
        );

        let err = HostGuardConfig::from_sources(dir.path(), Some("custom.toml".as_ref()))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "failed to parse hostguard config at `{}`",
                dir.path().join("custom.toml")
            )
        );
    }
}
