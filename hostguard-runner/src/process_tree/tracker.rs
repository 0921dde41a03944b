// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ProcessEntry, ProcessEnumerator, ProcessNode, ProcessState, live_tree};
use indexmap::IndexMap;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};
use tracing::{debug, warn};

/// Periodically enumerates the test host and its descendants.
///
/// The tracker runs as its own task for the lifetime of an attempt. It is driven through a
/// [`TrackerHandle`].
pub struct ProcessTreeTracker {
    root_pid: u32,
    nodes: IndexMap<u32, ProcessNode>,
    enumerator: Arc<dyn ProcessEnumerator>,
    enum_failed: bool,
}

impl ProcessTreeTracker {
    /// Starts tracking the tree rooted at `root_pid`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        root_pid: u32,
        root_name: impl Into<String>,
        enumerator: Arc<dyn ProcessEnumerator>,
        poll_interval: Duration,
    ) -> TrackerHandle {
        let mut nodes = IndexMap::new();
        nodes.insert(root_pid, ProcessNode::new(root_pid, None, root_name.into()));
        let tracker = Self {
            root_pid,
            nodes,
            enumerator,
            enum_failed: false,
        };

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        tokio::spawn(tracker.run(req_rx, poll_interval));
        TrackerHandle { req_tx }
    }

    async fn run(mut self, mut req_rx: mpsc::UnboundedReceiver<TrackerRequest>, poll: Duration) {
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.refresh().await;
                }
                req = req_rx.recv() => {
                    let Some(req) = req else { break };
                    match req {
                        TrackerRequest::Snapshot(reply) => {
                            self.refresh().await;
                            _ = reply.send(self.live_nodes());
                        }
                        TrackerRequest::MarkHung(pids) => {
                            for pid in pids {
                                if let Some(node) = self.nodes.get_mut(&pid) {
                                    node.finish(ProcessState::Hung, None);
                                }
                            }
                        }
                        TrackerRequest::RootExited { exit_code, graceful } => {
                            let state = if graceful {
                                ProcessState::ExitedGracefully
                            } else {
                                ProcessState::ExitedNonGracefully
                            };
                            if let Some(root) = self.nodes.get_mut(&self.root_pid) {
                                root.finish(state, exit_code);
                            }
                        }
                        TrackerRequest::Nodes(reply) => {
                            _ = reply.send(self.nodes.values().cloned().collect());
                        }
                        TrackerRequest::Finish(reply) => {
                            _ = reply.send(self.nodes.values().cloned().collect());
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn refresh(&mut self) {
        let enumerator = self.enumerator.clone();
        match tokio::task::spawn_blocking(move || enumerator.enumerate()).await {
            Ok(Ok(entries)) => self.apply(&entries),
            Ok(Err(err)) => {
                // Only warn once per attempt: the same failure is likely on every poll.
                if !self.enum_failed {
                    warn!("process tree enumeration failed, descendants will not be tracked: {err}");
                    self.enum_failed = true;
                }
            }
            Err(err) => {
                warn!("process tree enumeration task failed: {err}");
            }
        }
    }

    fn apply(&mut self, entries: &[ProcessEntry]) {
        let known: Vec<u32> = self
            .nodes
            .values()
            .filter(|node| node.pid != self.root_pid && node.is_running())
            .map(|node| node.pid)
            .collect();
        let live = live_tree(self.root_pid, known, entries);
        let live_pids: HashSet<u32> = live.iter().map(|entry| entry.pid).collect();

        for entry in live {
            if entry.pid == self.root_pid || self.nodes.contains_key(&entry.pid) {
                continue;
            }
            debug!(pid = entry.pid, ppid = ?entry.ppid, "discovered descendant process");
            let name = entry.name.unwrap_or_else(|| "process".to_owned());
            self.nodes
                .insert(entry.pid, ProcessNode::new(entry.pid, entry.ppid, name));
        }

        // The root's exit is reported by the runner, which owns the child handle.
        for node in self.nodes.values_mut() {
            if node.pid != self.root_pid && node.is_running() && !live_pids.contains(&node.pid) {
                node.finish(ProcessState::ExitedGracefully, None);
            }
        }
    }

    fn live_nodes(&self) -> Vec<ProcessNode> {
        self.nodes
            .values()
            .filter(|node| node.is_running())
            .cloned()
            .collect()
    }
}

enum TrackerRequest {
    Snapshot(oneshot::Sender<Vec<ProcessNode>>),
    MarkHung(Vec<u32>),
    RootExited {
        exit_code: Option<i32>,
        graceful: bool,
    },
    Nodes(oneshot::Sender<Vec<ProcessNode>>),
    Finish(oneshot::Sender<Vec<ProcessNode>>),
}

/// A handle to a running [`ProcessTreeTracker`].
#[derive(Clone, Debug)]
pub struct TrackerHandle {
    req_tx: mpsc::UnboundedSender<TrackerRequest>,
}

impl std::fmt::Debug for TrackerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Snapshot(_) => f.write_str("Snapshot"),
            Self::MarkHung(pids) => f.debug_tuple("MarkHung").field(pids).finish(),
            Self::RootExited {
                exit_code,
                graceful,
            } => f
                .debug_struct("RootExited")
                .field("exit_code", exit_code)
                .field("graceful", graceful)
                .finish(),
            Self::Nodes(_) => f.write_str("Nodes"),
            Self::Finish(_) => f.write_str("Finish"),
        }
    }
}

impl TrackerHandle {
    /// Re-enumerates the tree and returns the nodes that are currently alive.
    ///
    /// Returns an empty list if the tracker has already finished.
    pub async fn snapshot(&self) -> Vec<ProcessNode> {
        let (tx, rx) = oneshot::channel();
        if self.req_tx.send(TrackerRequest::Snapshot(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Marks the given processes as hung.
    pub fn mark_hung(&self, pids: Vec<u32>) {
        _ = self.req_tx.send(TrackerRequest::MarkHung(pids));
    }

    /// Records how the root process exited.
    pub fn root_exited(&self, exit_code: Option<i32>, graceful: bool) {
        _ = self
            .req_tx
            .send(TrackerRequest::RootExited { exit_code, graceful });
    }

    /// Returns every node observed so far, whatever its state, without re-enumerating.
    pub async fn nodes(&self) -> Vec<ProcessNode> {
        let (tx, rx) = oneshot::channel();
        if self.req_tx.send(TrackerRequest::Nodes(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stops tracking and returns every node that was ever observed.
    pub async fn finish(self) -> Vec<ProcessNode> {
        let (tx, rx) = oneshot::channel();
        if self.req_tx.send(TrackerRequest::Finish(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}


#[cfg(test)]
mod tests {
    use super::{fake::FakeEnumerator, *};
    use pretty_assertions::assert_eq;

    fn pids(nodes: &[ProcessNode]) -> Vec<u32> {
        nodes.iter().map(|node| node.pid).collect()
    }

    #[tokio::test]
    async fn snapshot_reflects_current_tree() {
        let enumerator = FakeEnumerator::new([(1, 0), (10, 1), (11, 10), (12, 11), (13, 10)]);
        let handle =
            ProcessTreeTracker::spawn(10, "host", enumerator.clone(), Duration::from_secs(60));

        assert_eq!(pids(&handle.snapshot().await), vec![10, 11, 12, 13]);

        // 12 exits, 14 starts.
        enumerator.set([(1, 0), (10, 1), (11, 10), (13, 10), (14, 13)]);
        assert_eq!(pids(&handle.snapshot().await), vec![10, 11, 13, 14]);

        let all = handle.finish().await;
        let exited: Vec<_> = all
            .iter()
            .filter(|node| node.state == ProcessState::ExitedGracefully)
            .map(|node| node.pid)
            .collect();
        assert_eq!(exited, vec![12]);
    }

    #[tokio::test]
    async fn hung_and_exited_nodes_leave_snapshot() {
        let enumerator = FakeEnumerator::new([(10, 1), (11, 10)]);
        let handle =
            ProcessTreeTracker::spawn(10, "host", enumerator.clone(), Duration::from_secs(60));
        assert_eq!(pids(&handle.snapshot().await), vec![10, 11]);

        handle.mark_hung(vec![11]);
        handle.root_exited(Some(3), false);
        assert_eq!(handle.snapshot().await, Vec::new());

        let all = handle.finish().await;
        assert_eq!(all[0].state, ProcessState::ExitedNonGracefully);
        assert_eq!(all[0].exit_code, Some(3));
        assert_eq!(all[1].state, ProcessState::Hung);
    }

    #[tokio::test]
    async fn reparented_descendants_survive_root_exit() {
        let enumerator = FakeEnumerator::new([(10, 1), (11, 10)]);
        let handle =
            ProcessTreeTracker::spawn(10, "host", enumerator.clone(), Duration::from_secs(60));
        assert_eq!(pids(&handle.snapshot().await), vec![10, 11]);

        enumerator.set([(11, 1)]);
        handle.root_exited(None, false);
        assert_eq!(pids(&handle.snapshot().await), vec![11]);
    }
}
