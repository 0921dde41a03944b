// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError,
    errors::Result,
    output::{OutputContext, OutputOpts, clap_styles},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser};
use hostguard_metadata::HostGuardExitCode;
use hostguard_runner::{
    config::{HangTimeout, HostGuardConfig, SessionOptions},
    dump::DumpKind,
    errors::SessionError,
    exit_code::IgnoreExitCodes,
    reporter::SessionReporter,
    retry::RetryCoordinator,
    runner::AttemptRunner,
    signal::{AbortTrigger, SignalHandlerKind},
};
use tracing::{debug, warn};

/// Parses the command line, runs the session and exits the process with the resolved exit code.
pub fn main_impl() -> color_eyre::Result<()> {
    let app = match HostGuardApp::try_parse() {
        Ok(app) => app,
        Err(err) => {
            // Clap's own usage exit code would read as "at least one test failed".
            let _ = err.print();
            let code = if err.use_stderr() {
                HostGuardExitCode::INVALID_COMMAND_LINE
            } else {
                HostGuardExitCode::SUCCESS
            };
            std::process::exit(code)
        }
    };

    let (output, config) = app.init_output();

    match app.exec(config, output) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error.display_to_stderr(&output.stderr_styles());
            std::process::exit(error.process_exit_code())
        }
    }
}

/// Runs a test host under supervision.
///
/// The test host is launched with the arguments after `--`. hostguard watches its process tree
/// for crashes and hangs, writes memory dumps when either happens, and can re-run failed tests.
#[derive(Debug, Parser)]
#[command(version, name = "hostguard", styles = clap_styles::style())]
pub struct HostGuardApp {
    /// Config file [default: .config/hostguard.toml in the current directory]
    #[arg(long, value_name = "PATH", env = "HOSTGUARD_CONFIG")]
    config_file: Option<Utf8PathBuf>,

    /// Directory for dumps, hang reports and retry artifacts [default: from config]
    #[arg(long, value_name = "DIR")]
    results_directory: Option<Utf8PathBuf>,

    #[command(flatten)]
    output: OutputOpts,

    #[command(flatten)]
    retry_opts: RetryOpts,

    #[command(flatten)]
    dump_opts: DumpOpts,

    #[command(flatten)]
    policy_opts: PolicyOpts,

    /// The test host command line [default: `host.command` from config]
    #[arg(last = true, value_name = "HOST_COMMAND")]
    host_command: Vec<String>,
}

#[derive(Debug, Default, Args)]
#[command(next_help_heading = "Retry options")]
struct RetryOpts {
    /// Re-run failed tests up to N times
    #[arg(long, value_name = "N")]
    retry_failed_tests: Option<usize>,

    /// Don't retry if more than this percentage of tests failed
    #[arg(long, value_name = "PERCENT", requires = "retry_failed_tests")]
    retry_failed_tests_max_percentage: Option<f64>,

    /// Don't retry if more than this many tests failed
    #[arg(long, value_name = "N", requires = "retry_failed_tests")]
    retry_failed_tests_max_tests: Option<usize>,
}

#[derive(Debug, Default, Args)]
#[command(next_help_heading = "Dump options")]
struct DumpOpts {
    /// Write dumps of the host's process tree if the host crashes
    #[arg(long)]
    crashdump: bool,

    /// Crash dump type: Mini, Heap, Triage or Full [default: from config]
    #[arg(long, value_name = "TYPE")]
    crashdump_type: Option<DumpKind>,

    /// Crash dump file name; `%p` is the process ID and `%e` the process name
    #[arg(long, value_name = "TEMPLATE")]
    crashdump_filename: Option<String>,

    /// Write dumps of the host's process tree and kill it if no test makes progress in time
    #[arg(long)]
    hangdump: bool,

    /// Hang timeout, e.g. `90s`, `1.5m` or `2h`; a bare number is seconds [default: from config]
    #[arg(long, value_name = "DURATION")]
    hangdump_timeout: Option<HangTimeout>,

    /// Hang dump type: Mini, Heap, Triage or Full [default: from config]
    #[arg(long, value_name = "TYPE")]
    hangdump_type: Option<DumpKind>,

    /// Hang dump file name; `%p` is the process ID and `%e` the process name
    #[arg(long, value_name = "TEMPLATE")]
    hangdump_filename: Option<String>,
}

#[derive(Debug, Default, Args)]
#[command(next_help_heading = "Policy options")]
struct PolicyOpts {
    /// Ask the host to stop starting tests after N failures
    ///
    /// The host must declare the `graceful-stop` capability.
    #[arg(long, value_name = "N")]
    maximum_failed_tests: Option<usize>,

    /// Fail if fewer than N tests were executed
    #[arg(long, value_name = "N")]
    minimum_expected_tests: Option<usize>,

    /// Exit codes to replace with success, separated by `;`, e.g. "2;8"
    #[arg(long, value_name = "CODES")]
    ignore_exit_code: Option<IgnoreExitCodes>,
}

/// The config along with the directory it was resolved against.
#[derive(Debug)]
#[doc(hidden)]
pub struct ConfigContext {
    cwd: Utf8PathBuf,
    config: HostGuardConfig,
}

impl ConfigContext {
    fn load(config_file: Option<&Utf8Path>) -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|err| ExpectedError::CurrentDirFailed { err })?;
        let cwd =
            Utf8PathBuf::try_from(cwd).map_err(|err| ExpectedError::CurrentDirInvalidUtf8 {
                path: err.into_path_buf(),
            })?;
        let config = HostGuardConfig::from_sources(&cwd, config_file)?;
        Ok(Self { cwd, config })
    }
}

impl HostGuardApp {
    /// Loads the config and installs the logger.
    ///
    /// The config is loaded first because it supplies the default diagnostic verbosity. A config
    /// error is returned rather than reported, so it can be displayed once logging is set up.
    pub fn init_output(&self) -> (OutputContext, Result<ConfigContext>) {
        let config = ConfigContext::load(self.config_file.as_deref());
        let output = self.output.init(
            config
                .as_ref()
                .ok()
                .map(|context| context.config.diagnostic_verbosity()),
        );
        (output, config)
    }

    /// Executes the app, returning the exit code for the process.
    pub fn exec(self, config: Result<ConfigContext>, output: OutputContext) -> Result<i32> {
        let ConfigContext { cwd, config } = config?;
        let settings = self
            .into_session_options()
            .resolve(&config, &cwd)
            .map_err(SessionError::from)?;
        debug!(
            results_directory = %settings.results_directory,
            "resolved session settings"
        );

        let mut reporter = SessionReporter::new();
        if output.color.should_colorize(supports_color::Stream::Stderr) {
            reporter.colorize();
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| ExpectedError::RuntimeCreateFailed { err })?;

        let abort = AbortTrigger::new();
        let outcome = runtime.block_on(async {
            let mut runner = AttemptRunner::new(&settings, SignalHandlerKind::Standard, &abort)?;
            let outcome = RetryCoordinator::from_settings(&settings)
                .run(&mut runner, |event| {
                    if let Err(err) = reporter.report_event(&event, std::io::stderr().lock()) {
                        debug!("failed to write session event: {err}");
                    }
                })
                .await?;
            Ok::<_, SessionError>(outcome)
        })?;

        if let Err(err) = reporter.report_outcome(&outcome, std::io::stderr().lock()) {
            warn!("failed to write session summary: {err}");
        }

        Ok(outcome.final_exit_code)
    }

    fn into_session_options(self) -> SessionOptions {
        let Self {
            results_directory,
            retry_opts,
            dump_opts,
            policy_opts,
            host_command,
            ..
        } = self;

        SessionOptions {
            host_command,
            results_directory,
            retry_failed_tests: retry_opts.retry_failed_tests,
            retry_failed_tests_max_percentage: retry_opts.retry_failed_tests_max_percentage,
            retry_failed_tests_max_tests: retry_opts.retry_failed_tests_max_tests,
            crashdump: dump_opts.crashdump,
            crashdump_type: dump_opts.crashdump_type,
            crashdump_filename: dump_opts.crashdump_filename,
            hangdump: dump_opts.hangdump,
            hangdump_timeout: dump_opts.hangdump_timeout,
            hangdump_type: dump_opts.hangdump_type,
            hangdump_filename: dump_opts.hangdump_filename,
            maximum_failed_tests: policy_opts.maximum_failed_tests,
            minimum_expected_tests: policy_opts.minimum_expected_tests,
            ignore_exit_codes: policy_opts.ignore_exit_code.unwrap_or_default(),
        }
    }
}
