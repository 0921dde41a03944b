// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::os;
use crate::{
    config::SessionSettings,
    dump::{
        CaptureOutcome, DumpCoordinator, DumpFileTemplate, DumpTrigger, DumpWriter,
        ExternalDumpWriter,
    },
    errors::{HostSpawnError, SessionError},
    helpers::{FormattedDuration, plural},
    monitor::{
        CrashDetector, ExitClassification, HangEvent, HangMonitor, HangMonitorHandle, HangReport,
    },
    process_tree::{ProcessNode, ProcessState, ProcessTreeTracker, TrackerHandle},
    results::{Attempt, AttemptStatus, TestResults},
    retry::{AttemptRequest, RunAttempt},
    signal::{AbortEvent, AbortTrigger, SignalHandler, SignalHandlerKind},
    stop::GracefulStopController,
    time::stopwatch,
};
use camino::Utf8Path;
use debug_ignore::DebugIgnore;
use hostguard_metadata::{HostMessage, host_env};
use std::{
    io::Write,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout},
    time::Instant,
};
use tracing::{debug, info, warn};

/// The name of the hang report written into an attempt's artifact directory.
pub const HANG_REPORT_FILE_NAME: &str = "hang-report.json";

/// How long to keep reading host output after the host exits. Descendants may hold the pipe open.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type HostLines = Lines<BufReader<ChildStdout>>;

/// Spawns the test host for each attempt and supervises it until it exits.
///
/// For every attempt, the runner wires up a [`ProcessTreeTracker`], a [`DumpCoordinator`], a
/// [`CrashDetector`], a [`HangMonitor`] if hang detection is enabled, and a
/// [`GracefulStopController`] if `--maximum-failed-tests` was given.
#[derive(Debug)]
pub struct AttemptRunner<'a> {
    settings: &'a SessionSettings,
    writer: DebugIgnore<Arc<dyn DumpWriter>>,
    signal_handler: SignalHandler,
}

impl<'a> AttemptRunner<'a> {
    /// Creates a new runner that writes dumps with the configured dump tool.
    pub fn new(
        settings: &'a SessionSettings,
        signal_handler: SignalHandlerKind,
        abort: &AbortTrigger,
    ) -> Result<Self, SessionError> {
        let writer = ExternalDumpWriter::new(
            settings.dump_tool.tool.clone(),
            settings.dump_tool.args.clone(),
        );
        Ok(Self {
            settings,
            writer: DebugIgnore(Arc::new(writer)),
            signal_handler: signal_handler.build(abort)?,
        })
    }

    /// Replaces the dump writer.
    pub fn with_dump_writer(mut self, writer: Arc<dyn DumpWriter>) -> Self {
        self.writer = DebugIgnore(writer);
        self
    }

    fn make_command(&self, request: &AttemptRequest) -> std::process::Command {
        let host = &self.settings.host;
        let mut cmd = std::process::Command::new(&host.program);
        cmd.args(&host.args)
            .arg(host_env::RESULTS_DIRECTORY_ARG)
            .arg(&request.artifacts_dir);
        for uid in &request.filter {
            cmd.arg(host_env::FILTER_UID_ARG).arg(uid.as_str());
        }

        cmd.env(host_env::ATTEMPT, request.index.to_string())
            .env(host_env::TOTAL_ATTEMPTS, request.max_attempts.to_string())
            .env(host_env::RESULTS_DIR, &request.artifacts_dir);
        if let Some(crash) = &self.settings.dumps.crash {
            let template = DumpFileTemplate::new(
                crash.file_template.as_deref(),
                DumpTrigger::Crash,
                self.settings.dumps.both_enabled(),
                false,
            );
            cmd.env(host_env::CRASHDUMP_TYPE, crash.kind.to_string())
                .env(
                    host_env::CRASHDUMP_FILE,
                    request.artifacts_dir.join(template.as_str()),
                );
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }

    async fn run_attempt(&mut self, request: AttemptRequest) -> Result<Attempt, SessionError> {
        let settings = self.settings;
        let stopwatch = stopwatch();

        fs_err::create_dir_all(&request.artifacts_dir).map_err(|err| {
            SessionError::CreateResultsDir {
                dir: request.artifacts_dir.clone(),
                err,
            }
        })?;

        let mut cmd = self.make_command(&request);
        os::set_process_group(&mut cmd);
        // If creating a job fails, we might be on an old system. Job objects are best-effort.
        let job = os::create_job().ok().map(Arc::new);

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);
        debug!(
            program = %settings.host.program,
            attempt = request.index,
            filter = request.filter.len(),
            "spawning test host"
        );
        let mut child = cmd
            .spawn()
            .map_err(|err| HostSpawnError::new(&settings.host.program, err))?;
        let root_pid = child
            .id()
            .expect("child has never been polled so must return a PID");

        // If assigning the child to the job fails, ignore this. This can happen if the process has
        // exited.
        let _ = os::assign_process_to_job(&child, job.as_deref());

        let tracker = ProcessTreeTracker::spawn(
            root_pid,
            host_process_name(&settings.host.program),
            os::enumerator(job.as_ref()),
            settings.tree_poll_interval,
        );
        let coordinator = DumpCoordinator::new(
            settings.dumps.clone(),
            self.writer.0.clone(),
            tracker.clone(),
            request.artifacts_dir.clone(),
        );
        let mut hang = settings
            .hang_timeout
            .map(|timeout| HangMonitor::start(timeout, coordinator.clone()));

        let mut state = HostState {
            stdin: child.stdin.take(),
            results: TestResults::new(),
            detector: CrashDetector::new(),
            controller: settings.graceful_stop.as_ref().map(|graceful_stop| {
                GracefulStopController::new(
                    graceful_stop.max_failed,
                    graceful_stop.capability.clone(),
                )
            }),
            stop_deadline: None,
            stop_ack_timeout: settings.stop_ack_timeout,
        };
        let mut lines = child
            .stdout
            .take()
            .map(|stdout| BufReader::new(stdout).lines());
        let mut signals_done = false;

        let end = loop {
            let event = tokio::select! {
                line = next_line(&mut lines) => HostEvent::Line(line),
                res = child.wait() => HostEvent::Exited(res),
                event = hang_fired(&mut hang) => HostEvent::Hang(event),
                event = self.signal_handler.recv(), if !signals_done => HostEvent::Abort(event),
                () = stop_ack_elapsed(state.stop_deadline) => HostEvent::StopAckTimeout,
            };

            match event {
                HostEvent::Line(Some(line)) => state.handle_line(&line, hang.as_ref()).await,
                HostEvent::Line(None) => {}
                HostEvent::Exited(Ok(status)) => {
                    drain_output(&mut lines, &mut state, hang.as_ref()).await;
                    break AttemptEnd::Exited(status);
                }
                HostEvent::Exited(Err(err)) => break AttemptEnd::WaitFailed(err),
                HostEvent::Hang(event) => break AttemptEnd::Hung(event),
                HostEvent::Abort(Some(event)) => break AttemptEnd::Aborted(event),
                HostEvent::Abort(None) => signals_done = true,
                HostEvent::StopAckTimeout => break AttemptEnd::StopAckTimedOut,
            }
        };

        let mut tree = HostTree {
            child: &mut child,
            root_pid,
            job: job.as_ref(),
            tracker: &tracker,
        };

        let status = match end {
            AttemptEnd::Exited(exit_status) => {
                let detector = std::mem::take(&mut state.detector);
                match detector.classify(exit_status) {
                    ExitClassification::Graceful => {
                        tracker.root_exited(exit_status.code(), true);
                        match coordinator.close() {
                            Some(DumpTrigger::Hang) => {
                                // The hang monitor fired just before the host exited, and owns
                                // the attempt.
                                let event = hang_fired(&mut hang).await;
                                tree.finish_hang(event, &request.artifacts_dir).await
                            }
                            Some(DumpTrigger::Crash) | None => AttemptStatus::Completed,
                        }
                    }
                    ExitClassification::NonGraceful { reason } => {
                        warn!("{reason}");
                        tracker.root_exited(exit_status.code(), false);
                        match coordinator.capture(DumpTrigger::Crash).await {
                            CaptureOutcome::Won(dumps) => {
                                cancel_hang(&mut hang);
                                tree.kill_remaining().await;
                                AttemptStatus::Crashed { reason, dumps }
                            }
                            CaptureOutcome::Suppressed {
                                winner: Some(DumpTrigger::Hang),
                            } => {
                                let event = hang_fired(&mut hang).await;
                                tree.finish_hang(event, &request.artifacts_dir).await
                            }
                            CaptureOutcome::Suppressed { .. } => AttemptStatus::Crashed {
                                reason,
                                dumps: Vec::new(),
                            },
                        }
                    }
                }
            }
            AttemptEnd::Hung(event) => tree.finish_hang(event, &request.artifacts_dir).await,
            AttemptEnd::Aborted(event) => {
                info!("received {event}, terminating the test host");
                coordinator.close();
                cancel_hang(&mut hang);
                tree.terminate(settings.abort_grace_period).await;
                AttemptStatus::Aborted
            }
            AttemptEnd::StopAckTimedOut => {
                let reason = format!(
                    "test host did not acknowledge the stop request within {}",
                    FormattedDuration(settings.stop_ack_timeout),
                );
                warn!("{reason}");
                coordinator.close();
                cancel_hang(&mut hang);
                tree.terminate(settings.abort_grace_period).await;
                AttemptStatus::Crashed {
                    reason,
                    dumps: Vec::new(),
                }
            }
            AttemptEnd::WaitFailed(err) => {
                let reason = format!("failed to wait for the test host: {err}");
                warn!("{reason}");
                coordinator.close();
                cancel_hang(&mut hang);
                tree.kill_remaining().await;
                AttemptStatus::Crashed {
                    reason,
                    dumps: Vec::new(),
                }
            }
        };
        // The timer must not outlive the attempt.
        cancel_hang(&mut hang);

        let exit_code = match child.try_wait() {
            Ok(Some(exit_status)) => exit_status.code(),
            _ => None,
        };
        let stop_requested = state
            .controller
            .as_ref()
            .is_some_and(GracefulStopController::stop_requested);
        let stopped_for_max_failures =
            stop_requested && matches!(status, AttemptStatus::Completed);

        let nodes = tracker.finish().await;
        let leaked = nodes
            .iter()
            .filter(|node| node.pid != root_pid && node.is_running())
            .count();
        if leaked > 0 && matches!(status, AttemptStatus::Completed) {
            info!(
                "{leaked} {} still running after the test host exited",
                plural::processes_str(leaked),
            );
        }

        let snapshot = stopwatch.snapshot();
        Ok(Attempt {
            index: request.index,
            max_attempts: request.max_attempts,
            results: state.results,
            exit_code,
            artifacts_dir: request.artifacts_dir,
            status,
            stopped_for_max_failures,
            start_time: snapshot.start_time,
            duration: snapshot.duration,
        })
    }
}

impl RunAttempt for AttemptRunner<'_> {
    async fn run(&mut self, request: AttemptRequest) -> Result<Attempt, SessionError> {
        self.run_attempt(request).await
    }
}

enum HostEvent {
    Line(Option<String>),
    Exited(std::io::Result<ExitStatus>),
    Hang(HangEvent),
    Abort(Option<AbortEvent>),
    StopAckTimeout,
}

enum AttemptEnd {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    Hung(HangEvent),
    Aborted(AbortEvent),
    StopAckTimedOut,
}

/// Per-attempt state fed by the host's output.
struct HostState {
    stdin: Option<ChildStdin>,
    results: TestResults,
    detector: CrashDetector,
    controller: Option<GracefulStopController>,
    stop_deadline: Option<Instant>,
    stop_ack_timeout: Duration,
}

impl HostState {
    async fn handle_line(&mut self, line: &str, hang: Option<&HangMonitorHandle>) {
        let Ok(message) = HostMessage::from_line(line) else {
            // Regular host output.
            let _ = writeln!(std::io::stdout().lock(), "{line}");
            return;
        };

        self.detector.observe(&message);
        match message {
            HostMessage::TestUpdate(update) => {
                if let Some(hang) = hang {
                    hang.heartbeat(update.clone());
                }
                if let Some(request) = self
                    .controller
                    .as_mut()
                    .and_then(|controller| controller.observe(&update))
                {
                    self.send_stop_request(&request.bytes).await;
                }
                self.results.record(update.into());
            }
            HostMessage::StopAcknowledged => {
                debug!("test host acknowledged the stop request");
                if let Some(controller) = self.controller.as_mut() {
                    controller.acknowledge();
                }
                self.stop_deadline = None;
            }
            HostMessage::SessionCompleted => {
                debug!("test host completed its session");
            }
        }
    }

    async fn send_stop_request(&mut self, bytes: &[u8]) {
        self.stop_deadline = Some(Instant::now() + self.stop_ack_timeout);
        let Some(stdin) = self.stdin.as_mut() else {
            warn!("test host stdin is closed, cannot send the stop request");
            return;
        };
        if let Err(err) = write_control(stdin, bytes).await {
            warn!("failed to send the stop request to the test host: {err}");
        }
    }
}

async fn write_control(stdin: &mut ChildStdin, bytes: &[u8]) -> std::io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

/// The host process and everything needed to tear down its tree.
struct HostTree<'a> {
    child: &'a mut Child,
    root_pid: u32,
    job: Option<&'a Arc<os::Job>>,
    tracker: &'a TrackerHandle,
}

impl HostTree<'_> {
    /// Kills the tree after a hang and writes the hang report.
    async fn finish_hang(&mut self, event: HangEvent, artifacts_dir: &Utf8Path) -> AttemptStatus {
        let dumps = match event.capture {
            CaptureOutcome::Won(dumps) => dumps,
            CaptureOutcome::Suppressed { .. } => Vec::new(),
        };

        // Hung nodes are no longer part of the live snapshot.
        let pids = unfinished_pids(&self.tracker.nodes().await);
        warn!(
            "killing {} hung {}",
            pids.len(),
            plural::processes_str(pids.len()),
        );
        os::kill_tree(self.root_pid, &pids, self.job);
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;

        write_hang_report(&event.report, artifacts_dir);
        AttemptStatus::Hung {
            report: event.report,
            dumps,
        }
    }

    /// Kills any descendants that are still running.
    async fn kill_remaining(&mut self) {
        let pids = live_pids(&self.tracker.snapshot().await);
        if !pids.is_empty() {
            os::kill_tree(self.root_pid, &pids, self.job);
        }
        if self.child.id().is_some() {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
    }

    /// Asks the tree to exit, then kills it after `grace_period`.
    async fn terminate(&mut self, grace_period: Duration) {
        let pids = live_pids(&self.tracker.snapshot().await);
        let exited =
            os::terminate_tree(self.child, self.root_pid, &pids, self.job, grace_period).await;
        if !exited {
            warn!(
                "test host did not exit within {}, killed it",
                FormattedDuration(grace_period),
            );
        }
    }
}

fn live_pids(nodes: &[ProcessNode]) -> Vec<u32> {
    nodes.iter().map(|node| node.pid).collect()
}

fn unfinished_pids(nodes: &[ProcessNode]) -> Vec<u32> {
    nodes
        .iter()
        .filter(|node| matches!(node.state, ProcessState::Running | ProcessState::Hung))
        .map(|node| node.pid)
        .collect()
}

fn write_hang_report(report: &HangReport, artifacts_dir: &Utf8Path) {
    let path = artifacts_dir.join(HANG_REPORT_FILE_NAME);
    let res = serde_json::to_vec_pretty(report)
        .map_err(std::io::Error::from)
        .and_then(|json| fs_err::write(&path, json));
    match res {
        Ok(()) => info!("wrote hang report to {path}"),
        Err(err) => warn!("failed to write hang report to {path}: {err}"),
    }
}

fn host_process_name(program: &str) -> &str {
    Utf8Path::new(program).file_name().unwrap_or(program)
}

async fn next_line(lines: &mut Option<HostLines>) -> Option<String> {
    let Some(reader) = lines.as_mut() else {
        return std::future::pending().await;
    };
    match reader.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) => {
            *lines = None;
            None
        }
        Err(err) => {
            warn!("error reading test host output: {err}");
            *lines = None;
            None
        }
    }
}

async fn drain_output(
    lines: &mut Option<HostLines>,
    state: &mut HostState,
    hang: Option<&HangMonitorHandle>,
) {
    if lines.is_none() {
        return;
    }
    let drain = async {
        while let Some(line) = next_line(lines).await {
            state.handle_line(&line, hang).await;
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        debug!("test host output still open after exit, likely held by a descendant");
    }
}

async fn hang_fired(hang: &mut Option<HangMonitorHandle>) -> HangEvent {
    match hang {
        Some(hang) => hang.fired().await,
        None => std::future::pending().await,
    }
}

fn cancel_hang(hang: &mut Option<HangMonitorHandle>) {
    if let Some(hang) = hang.take() {
        hang.cancel();
    }
}

async fn stop_ack_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
