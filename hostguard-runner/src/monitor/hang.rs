// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    dump::{CaptureOutcome, DumpCoordinator, DumpTrigger},
    helpers::FormattedDuration,
    time::deadline,
};
use chrono::{DateTime, FixedOffset};
use hostguard_metadata::{TestOutcome, TestUid, TestUpdate};
use indexmap::IndexMap;
use serde::Serialize;
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::warn;

/// A test that was executing when a hang was detected.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecutingTest {
    /// The unique identifier of the test.
    pub uid: TestUid,

    /// The display name of the test.
    pub display_name: String,

    /// When the test started, according to the host.
    pub started_at: DateTime<FixedOffset>,
}

/// What was going on when a hang was detected.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HangReport {
    /// The configured hang timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Tests that had started but not finished, in the order they started.
    pub executing_tests: Vec<ExecutingTest>,
}

/// Sent by the [`HangMonitor`] when it fires.
#[derive(Clone, Debug)]
pub struct HangEvent {
    /// The tests that were executing.
    pub report: HangReport,

    /// Whether this hang won the capture arbitration.
    pub capture: CaptureOutcome,
}

/// A per-attempt deadline timer, reset by every test transition observed from the host.
///
/// Fires at most once, then stops.
pub struct HangMonitor {
    timeout: Duration,
    executing: IndexMap<TestUid, ExecutingTest>,
}

impl HangMonitor {
    /// Starts monitoring. Must be called from within a Tokio runtime.
    pub fn start(timeout: Duration, coordinator: DumpCoordinator) -> HangMonitorHandle {
        let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = oneshot::channel();
        let monitor = Self {
            timeout,
            executing: IndexMap::new(),
        };
        let task = tokio::spawn(monitor.run(heartbeat_rx, event_tx, coordinator));

        HangMonitorHandle {
            heartbeat_tx,
            event_rx: Some(event_rx),
            task,
        }
    }

    fn track(&mut self, update: TestUpdate) {
        // Keyed by uid: two tests may share a display name.
        match update.outcome {
            TestOutcome::InProgress => {
                self.executing.insert(
                    update.uid.clone(),
                    ExecutingTest {
                        uid: update.uid,
                        display_name: update.display_name,
                        started_at: update.timestamp,
                    },
                );
            }
            TestOutcome::Passed | TestOutcome::Failed | TestOutcome::Skipped => {
                self.executing.shift_remove(&update.uid);
            }
        }
    }

    async fn run(
        mut self,
        mut heartbeat_rx: mpsc::UnboundedReceiver<TestUpdate>,
        event_tx: oneshot::Sender<HangEvent>,
        coordinator: DumpCoordinator,
    ) {
        let mut deadline = std::pin::pin!(deadline(self.timeout));

        loop {
            tokio::select! {
                update = heartbeat_rx.recv() => {
                    let Some(update) = update else {
                        // The attempt is over.
                        return;
                    };
                    self.track(update);
                    deadline.as_mut().heartbeat();
                }
                () = &mut deadline => break,
            }
        }

        let report = HangReport {
            timeout: self.timeout,
            executing_tests: self.executing.into_values().collect(),
        };
        warn!(
            "test host made no progress for {}",
            FormattedDuration(deadline.timeout())
        );
        for test in &report.executing_tests {
            warn!("  still executing: {} ({})", test.display_name, test.uid);
        }

        let capture = coordinator.capture(DumpTrigger::Hang).await;
        _ = event_tx.send(HangEvent { report, capture });
    }
}

/// A handle to a running [`HangMonitor`].
#[derive(Debug)]
pub struct HangMonitorHandle {
    heartbeat_tx: mpsc::UnboundedSender<TestUpdate>,
    event_rx: Option<oneshot::Receiver<HangEvent>>,
    task: JoinHandle<()>,
}

impl HangMonitorHandle {
    /// Reports a test transition, resetting the deadline.
    pub fn heartbeat(&self, update: TestUpdate) {
        _ = self.heartbeat_tx.send(update);
    }

    /// Waits for the monitor to fire.
    ///
    /// Never completes if the monitor was cancelled or has already fired.
    pub async fn fired(&mut self) -> HangEvent {
        let Some(event_rx) = self.event_rx.as_mut() else {
            return std::future::pending().await;
        };
        match event_rx.await {
            Ok(event) => {
                self.event_rx = None;
                event
            }
            Err(_) => {
                self.event_rx = None;
                std::future::pending().await
            }
        }
    }

    /// Stops the monitor immediately.
    ///
    /// After this returns, the monitor will not request any more dumps.
    pub fn cancel(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dump::{DumpGeneratorSettings, DumpKind, DumpSettings, fake::FakeDumpWriter},
        process_tree::{ProcessTreeTracker, fake::FakeEnumerator},
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn update(uid: &str, display_name: &str, outcome: TestOutcome) -> TestUpdate {
        TestUpdate {
            uid: TestUid::new(uid),
            display_name: display_name.to_owned(),
            outcome,
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T10:00:00+00:00").unwrap(),
        }
    }

    fn coordinator(writer: Arc<FakeDumpWriter>) -> DumpCoordinator {
        let tracker = ProcessTreeTracker::spawn(
            100,
            "host",
            FakeEnumerator::new([(100, 1), (101, 100)]),
            Duration::from_secs(3600),
        );
        let settings = DumpSettings {
            crash: None,
            hang: Some(DumpGeneratorSettings {
                kind: DumpKind::Full,
                file_template: None,
            }),
        };
        DumpCoordinator::new(settings, writer, tracker, "/results".into())
    }

    #[tokio::test(start_paused = true)]
    async fn tests_sharing_display_names_both_reported() {
        let writer = Arc::new(FakeDumpWriter::default());
        let mut monitor = HangMonitor::start(Duration::from_secs(5), coordinator(writer.clone()));

        monitor.heartbeat(update("ns1.A.Test", "Test", TestOutcome::InProgress));
        monitor.heartbeat(update("ns2.B.Test", "Test", TestOutcome::InProgress));
        monitor.heartbeat(update("ns3.C.Other", "Other", TestOutcome::InProgress));
        // Completing one "Test" must not evict the other.
        monitor.heartbeat(update("ns3.C.Other", "Other", TestOutcome::Passed));

        let event = monitor.fired().await;
        let uids: Vec<_> = event
            .report
            .executing_tests
            .iter()
            .map(|test| test.uid.as_str())
            .collect();
        assert_eq!(uids, vec!["ns1.A.Test", "ns2.B.Test"]);

        let CaptureOutcome::Won(dumps) = event.capture else {
            panic!("hang should win");
        };
        assert_eq!(dumps.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_monitor_quiet() {
        let writer = Arc::new(FakeDumpWriter::default());
        let mut monitor = HangMonitor::start(Duration::from_secs(5), coordinator(writer.clone()));

        for i in 0..10 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            monitor.heartbeat(update(&format!("t{i}"), "t", TestOutcome::Passed));
        }

        // 30 seconds passed, but never 5 without a heartbeat.
        let fired = tokio::time::timeout(Duration::from_secs(1), monitor.fired()).await;
        assert!(fired.is_err(), "monitor did not fire");
        monitor.cancel();
        assert!(writer.written.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_monitor_never_dumps() {
        let writer = Arc::new(FakeDumpWriter::default());
        let monitor = HangMonitor::start(Duration::from_secs(5), coordinator(writer.clone()));
        monitor.cancel();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(writer.written.lock().unwrap().is_empty());
    }
}
