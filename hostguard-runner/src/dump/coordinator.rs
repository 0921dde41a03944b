// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{CapturedDump, DumpFileTemplate, DumpRequest, DumpSettings, DumpTrigger, DumpWriter};
use crate::{errors::DumpWriteError, process_tree::TrackerHandle};
use camino::Utf8PathBuf;
use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};
use tracing::{debug, info, warn};

const ARMED: u8 = 0;
const CAPTURING_HANG: u8 = 1;
const CAPTURING_CRASH: u8 = 2;
const CLOSED: u8 = 3;

/// The result of asking the [`DumpCoordinator`] to capture dumps.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CaptureOutcome {
    /// This trigger won. Contains the dumps that were written, which may be empty if the
    /// generator for this trigger is disabled or every write failed.
    Won(Vec<CapturedDump>),

    /// Another trigger already won, or the attempt already completed.
    Suppressed {
        /// The trigger that won, or `None` if the attempt completed first.
        winner: Option<DumpTrigger>,
    },
}

/// Arbitrates between crash and hang triggers for a single attempt.
///
/// Exactly one of the triggers (or the attempt completing normally) wins, via a compare-and-swap
/// on a single flag. The winner snapshots the process tree at that moment and requests a dump of
/// every live node.
#[derive(Clone)]
pub struct DumpCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    state: AtomicU8,
    settings: DumpSettings,
    writer: Arc<dyn DumpWriter>,
    tracker: TrackerHandle,
    output_directory: Utf8PathBuf,
}

impl std::fmt::Debug for DumpCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumpCoordinator")
            .field("state", &self.inner.state.load(Ordering::Relaxed))
            .field("settings", &self.inner.settings)
            .field("output_directory", &self.inner.output_directory)
            .finish_non_exhaustive()
    }
}

impl DumpCoordinator {
    /// Creates a coordinator for one attempt.
    pub fn new(
        settings: DumpSettings,
        writer: Arc<dyn DumpWriter>,
        tracker: TrackerHandle,
        output_directory: Utf8PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(ARMED),
                settings,
                writer,
                tracker,
                output_directory,
            }),
        }
    }

    /// Claims the capture flag for `trigger`.
    ///
    /// Returns `Err` with the previous state if the flag was already claimed.
    fn claim(&self, trigger: DumpTrigger) -> Result<(), u8> {
        let new = match trigger {
            DumpTrigger::Hang => CAPTURING_HANG,
            DumpTrigger::Crash => CAPTURING_CRASH,
        };
        self.inner
            .state
            .compare_exchange(ARMED, new, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    /// Disarms the coordinator after the attempt completed normally.
    ///
    /// Returns the trigger that already won, if any.
    pub fn close(&self) -> Option<DumpTrigger> {
        match self.inner.state.compare_exchange(
            ARMED,
            CLOSED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => None,
            Err(prev) => state_to_trigger(prev),
        }
    }

    /// Attempts to capture dumps for `trigger`.
    ///
    /// Capture is best-effort: failures to write individual dumps are logged and skipped.
    pub async fn capture(&self, trigger: DumpTrigger) -> CaptureOutcome {
        if let Err(prev) = self.claim(trigger) {
            let winner = state_to_trigger(prev);
            debug!(%trigger, ?winner, "dump capture suppressed");
            return CaptureOutcome::Suppressed { winner };
        }

        // The flag is claimed even if this generator is disabled, so that a crash after a hang
        // (or the other way around) never produces a second set of dumps.
        let Some(generator) = self.inner.settings.generator(trigger) else {
            return CaptureOutcome::Won(Vec::new());
        };

        let target_nodes = self.inner.tracker.snapshot().await;
        if target_nodes.is_empty() {
            info!("{trigger} detected, but no live processes are left to dump");
            return CaptureOutcome::Won(Vec::new());
        }

        let request = DumpRequest {
            trigger,
            kind: generator.kind,
            output_template: DumpFileTemplate::new(
                generator.file_template.as_deref(),
                trigger,
                self.inner.settings.both_enabled(),
                target_nodes.len() > 1,
            ),
            target_nodes,
            output_directory: self.inner.output_directory.clone(),
        };

        let dumps = self.write_all(&request).await;
        if trigger == DumpTrigger::Hang {
            self.inner
                .tracker
                .mark_hung(request.target_nodes.iter().map(|node| node.pid).collect());
        }
        CaptureOutcome::Won(dumps)
    }

    async fn write_all(&self, request: &DumpRequest) -> Vec<CapturedDump> {
        info!(
            "capturing {} {} dump(s) for {} process(es) in {}",
            request.trigger,
            request.kind,
            request.target_nodes.len(),
            request.output_directory,
        );

        // Write all dumps concurrently so that every process is captured as close to the trigger
        // as possible.
        let tasks: Vec<_> = request
            .target_nodes
            .iter()
            .map(|node| {
                let writer = self.inner.writer.clone();
                let path = request.output_path(node);
                let (pid, kind) = (node.pid, request.kind);
                let task = tokio::task::spawn_blocking(move || {
                    writer.write_dump(pid, kind, &path).map(|()| path)
                });
                (node, task)
            })
            .collect();

        let mut dumps = Vec::with_capacity(tasks.len());
        for (node, task) in tasks {
            let res = task
                .await
                .unwrap_or_else(|_| Err(DumpWriteError::TaskFailed { pid: node.pid }));
            match res {
                Ok(path) => {
                    info!(
                        "wrote {} dump for {} (pid {}) to {path}",
                        request.trigger, node.name, node.pid,
                    );
                    dumps.push(CapturedDump {
                        trigger: request.trigger,
                        pid: node.pid,
                        process_name: node.name.clone(),
                        path,
                    });
                }
                Err(err) => {
                    warn!(
                        "failed to write {} dump for pid {}: {err}",
                        request.trigger, node.pid,
                    );
                }
            }
        }
        dumps
    }
}

fn state_to_trigger(state: u8) -> Option<DumpTrigger> {
    match state {
        CAPTURING_HANG => Some(DumpTrigger::Hang),
        CAPTURING_CRASH => Some(DumpTrigger::Crash),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::{fake::FakeDumpWriter, *};
    use crate::{
        dump::{DumpGeneratorSettings, DumpKind},
        process_tree::{ProcessTreeTracker, fake::FakeEnumerator},
    };
    use std::{collections::HashSet, time::Duration};

    fn both_enabled() -> DumpSettings {
        DumpSettings {
            crash: Some(DumpGeneratorSettings {
                kind: DumpKind::Mini,
                file_template: None,
            }),
            hang: Some(DumpGeneratorSettings {
                kind: DumpKind::Full,
                file_template: None,
            }),
        }
    }

    fn coordinator(
        settings: DumpSettings,
        writer: Arc<FakeDumpWriter>,
        tree: impl IntoIterator<Item = (u32, u32)>,
    ) -> DumpCoordinator {
        let enumerator = FakeEnumerator::new(tree);
        let tracker = ProcessTreeTracker::spawn(100, "host", enumerator, Duration::from_secs(60));
        DumpCoordinator::new(settings, writer, tracker, "/results/attempt".into())
    }

    #[tokio::test]
    async fn hang_dumps_every_live_node() {
        let writer = Arc::new(FakeDumpWriter::default());
        let coordinator = coordinator(
            both_enabled(),
            writer.clone(),
            [(1, 0), (100, 1), (101, 100), (102, 101), (103, 100), (500, 1)],
        );

        let CaptureOutcome::Won(dumps) = coordinator.capture(DumpTrigger::Hang).await else {
            panic!("first trigger should win");
        };
        assert_eq!(dumps.len(), 4);
        let mut pids: Vec<_> = dumps.iter().map(|dump| dump.pid).collect();
        pids.sort_unstable();
        assert_eq!(pids, vec![100, 101, 102, 103]);
        assert!(
            dumps
                .iter()
                .all(|dump| dump.path.as_str().ends_with("_hang.dmp"))
        );
        let written = writer.written.lock().unwrap();
        assert!(written.iter().all(|(_, kind, _)| *kind == DumpKind::Full));
    }

    #[tokio::test]
    async fn loser_is_suppressed() {
        let writer = Arc::new(FakeDumpWriter::default());
        let coordinator = coordinator(both_enabled(), writer.clone(), [(100, 1), (101, 100)]);

        assert!(matches!(
            coordinator.capture(DumpTrigger::Crash).await,
            CaptureOutcome::Won(_)
        ));
        assert_eq!(
            coordinator.capture(DumpTrigger::Hang).await,
            CaptureOutcome::Suppressed {
                winner: Some(DumpTrigger::Crash)
            }
        );
        assert_eq!(coordinator.close(), Some(DumpTrigger::Crash));

        let written = writer.written.lock().unwrap();
        assert_eq!(written.len(), 2, "only the crash dumps were written");
    }

    #[tokio::test]
    async fn closed_coordinator_never_captures() {
        let writer = Arc::new(FakeDumpWriter::default());
        let coordinator = coordinator(both_enabled(), writer.clone(), [(100, 1)]);

        assert_eq!(coordinator.close(), None);
        assert_eq!(
            coordinator.capture(DumpTrigger::Hang).await,
            CaptureOutcome::Suppressed { winner: None }
        );
        assert!(writer.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_generator_still_claims() {
        let writer = Arc::new(FakeDumpWriter::default());
        let settings = DumpSettings {
            crash: None,
            ..both_enabled()
        };
        let coordinator = coordinator(settings, writer.clone(), [(100, 1)]);

        assert_eq!(
            coordinator.capture(DumpTrigger::Crash).await,
            CaptureOutcome::Won(Vec::new())
        );
        assert!(matches!(
            coordinator.capture(DumpTrigger::Hang).await,
            CaptureOutcome::Suppressed { .. }
        ));
        assert!(writer.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_writes_do_not_stop_capture() {
        let writer = Arc::new(FakeDumpWriter {
            fail_pids: [101].into_iter().collect(),
            ..Default::default()
        });
        let coordinator =
            coordinator(both_enabled(), writer.clone(), [(100, 1), (101, 100), (102, 100)]);

        let CaptureOutcome::Won(dumps) = coordinator.capture(DumpTrigger::Hang).await else {
            panic!("trigger should win");
        };
        let pids: Vec<_> = dumps.iter().map(|dump| dump.pid).collect();
        assert_eq!(pids, vec![100, 102]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_produce_one_set_of_dumps() {
        for _ in 0..32 {
            let writer = Arc::new(FakeDumpWriter::default());
            let coordinator = coordinator(both_enabled(), writer.clone(), [(100, 1), (101, 100)]);

            let hang = tokio::spawn({
                let coordinator = coordinator.clone();
                async move { coordinator.capture(DumpTrigger::Hang).await }
            });
            let crash = tokio::spawn({
                let coordinator = coordinator.clone();
                async move { coordinator.capture(DumpTrigger::Crash).await }
            });
            let outcomes = [hang.await.unwrap(), crash.await.unwrap()];

            let winners = outcomes
                .iter()
                .filter(|outcome| matches!(outcome, CaptureOutcome::Won(_)))
                .count();
            assert_eq!(winners, 1);

            let written = writer.written.lock().unwrap();
            let suffixes: HashSet<_> = written
                .iter()
                .map(|(_, _, path)| path.as_str().ends_with("_hang.dmp"))
                .collect();
            assert_eq!(written.len(), 2);
            assert_eq!(suffixes.len(), 1, "dumps all come from a single trigger");
        }
    }
}
