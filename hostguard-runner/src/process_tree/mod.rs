// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tracking the test host and every process it spawns.
//!
//! The main structure in this module is [`ProcessTreeTracker`], which periodically enumerates
//! processes through a [`ProcessEnumerator`] and keeps a [`ProcessNode`] for the host and each of
//! its live descendants.

mod tracker;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(all(unix, not(target_os = "linux")))]
mod ps;
#[cfg(windows)]
mod windows;

use crate::errors::ProcessEnumError;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};
pub use tracker::*;

#[cfg(target_os = "linux")]
pub use linux::ProcFsEnumerator;
#[cfg(all(unix, not(target_os = "linux")))]
pub use ps::PsEnumerator;
#[cfg(windows)]
pub use windows::JobObjectEnumerator;

/// A single row in a process table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessEntry {
    /// The process ID.
    pub pid: u32,

    /// The parent process ID.
    ///
    /// `None` means the enumerator is already scoped to the tree being tracked (for example a
    /// Windows job object), so the entry belongs to the tree regardless of parentage.
    pub ppid: Option<u32>,

    /// The short process name, if known.
    pub name: Option<String>,
}

/// Lists processes on the system.
///
/// Implementations are called from a blocking thread, never from the async runtime directly.
pub trait ProcessEnumerator: Send + Sync + 'static {
    /// Returns a snapshot of the process table.
    fn enumerate(&self) -> Result<Vec<ProcessEntry>, ProcessEnumError>;
}

/// Returns the process enumerator for the current platform.
#[cfg(unix)]
pub fn default_enumerator() -> Arc<dyn ProcessEnumerator> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            Arc::new(ProcFsEnumerator::new())
        } else {
            Arc::new(PsEnumerator)
        }
    }
}

/// The lifecycle state of a tracked process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessState {
    /// The process was alive at the last poll.
    Running,

    /// The process exited and the exit was considered normal.
    ExitedGracefully,

    /// The process exited abnormally.
    ExitedNonGracefully,

    /// A hang dump was captured for the process.
    Hung,
}

/// A process in the tree rooted at the test host.
///
/// A node stops changing once it leaves [`ProcessState::Running`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProcessNode {
    /// The process ID.
    pub pid: u32,

    /// The parent process ID, or `None` for the root and for scoped enumerators.
    pub parent_pid: Option<u32>,

    /// A short name for the process, used in dump file names.
    pub name: String,

    /// When the process was first observed.
    pub start_time: DateTime<Local>,

    /// The exit code, if it was observed.
    pub exit_code: Option<i32>,

    /// The current state.
    pub state: ProcessState,
}

impl ProcessNode {
    pub(crate) fn new(pid: u32, parent_pid: Option<u32>, name: String) -> Self {
        Self {
            pid,
            parent_pid,
            name,
            start_time: Local::now(),
            exit_code: None,
            state: ProcessState::Running,
        }
    }

    /// Returns true if the process was alive at the last poll.
    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }

    /// Moves the node out of `Running`. Has no effect on nodes that already left it.
    pub(crate) fn finish(&mut self, state: ProcessState, exit_code: Option<i32>) {
        if self.is_running() {
            self.state = state;
            self.exit_code = exit_code;
        }
    }
}

/// Computes the set of live processes that belong to the tree rooted at `root`.
///
/// `known` lists pids already tracked: they stay in the tree while they are alive even if they
/// were reparented (for example to init after the host exited).
pub(crate) fn live_tree(
    root: u32,
    known: impl IntoIterator<Item = u32>,
    entries: &[ProcessEntry],
) -> Vec<ProcessEntry> {
    let alive: HashMap<u32, &ProcessEntry> = entries.iter().map(|e| (e.pid, e)).collect();
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries {
        if let Some(ppid) = entry.ppid {
            children.entry(ppid).or_default().push(entry.pid);
        }
    }

    let mut seen = HashSet::new();
    let mut queue: VecDeque<u32> = std::iter::once(root).chain(known).collect();
    // Scoped entries belong to the tree by construction.
    queue.extend(entries.iter().filter(|e| e.ppid.is_none()).map(|e| e.pid));

    let mut tree = Vec::new();
    while let Some(pid) = queue.pop_front() {
        if !seen.insert(pid) {
            continue;
        }
        if let Some(entry) = alive.get(&pid) {
            tree.push((*entry).clone());
        }
        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().copied());
        }
    }

    tree
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(pid: u32, ppid: u32) -> ProcessEntry {
        ProcessEntry {
            pid,
            ppid: Some(ppid),
            name: Some(format!("proc{pid}")),
        }
    }

    fn pids(tree: &[ProcessEntry]) -> Vec<u32> {
        let mut pids: Vec<_> = tree.iter().map(|e| e.pid).collect();
        pids.sort_unstable();
        pids
    }

    #[test]
    fn walks_nested_descendants() {
        let entries = vec![
            entry(1, 0),
            entry(100, 1),
            entry(101, 100),
            entry(102, 100),
            entry(103, 102),
            entry(200, 1),
        ];
        let tree = live_tree(100, [], &entries);
        assert_eq!(pids(&tree), vec![100, 101, 102, 103]);
    }

    #[test]
    fn keeps_reparented_known_processes() {
        // The host (100) exited; 101 was reparented to init.
        let entries = vec![entry(1, 0), entry(101, 1), entry(102, 101), entry(200, 1)];
        let tree = live_tree(100, [101], &entries);
        assert_eq!(pids(&tree), vec![101, 102]);
    }

    #[test]
    fn scoped_entries_belong_to_tree() {
        let entries = vec![
            ProcessEntry {
                pid: 10,
                ppid: None,
                name: None,
            },
            ProcessEntry {
                pid: 11,
                ppid: None,
                name: None,
            },
        ];
        let tree = live_tree(10, [], &entries);
        assert_eq!(pids(&tree), vec![10, 11]);
    }

    #[test]
    fn finished_nodes_are_immutable() {
        let mut node = ProcessNode::new(5, None, "host".to_owned());
        node.finish(ProcessState::Hung, None);
        node.finish(ProcessState::ExitedGracefully, Some(0));
        assert_eq!(node.state, ProcessState::Hung);
        assert_eq!(node.exit_code, None);
    }
}
