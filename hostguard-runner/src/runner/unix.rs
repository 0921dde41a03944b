// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::process_tree::{ProcessEnumerator, default_enumerator};
use libc::{SIGKILL, SIGTERM};
use std::{convert::Infallible, os::unix::process::CommandExt, sync::Arc, time::Duration};
use tokio::process::Child;
use tracing::debug;

/// Pre-execution configuration on Unix.
///
/// The host becomes the leader of a new process group, so that it and its descendants can be
/// signalled together.
pub(super) fn set_process_group(cmd: &mut std::process::Command) {
    cmd.process_group(0);
}

#[derive(Debug)]
pub(super) struct Job(());

pub(super) fn create_job() -> Result<Job, Infallible> {
    Ok(Job(()))
}

pub(super) fn assign_process_to_job(_child: &Child, _job: Option<&Job>) -> Result<(), Infallible> {
    Ok(())
}

pub(super) fn enumerator(_job: Option<&Arc<Job>>) -> Arc<dyn ProcessEnumerator> {
    default_enumerator()
}

/// Kills the host's process group along with every listed descendant.
///
/// Descendants that called `setsid` or changed their process group are only reached through
/// `pids`.
pub(super) fn kill_tree(root_pid: u32, pids: &[u32], _job: Option<&Arc<Job>>) {
    debug!(root_pid, ?pids, "killing process tree");
    unsafe {
        libc::kill(-(root_pid as libc::pid_t), SIGKILL);
    }
    for &pid in pids {
        if pid != root_pid {
            unsafe {
                libc::kill(pid as libc::pid_t, SIGKILL);
            }
        }
    }
}

/// Asks the host's process group to exit with SIGTERM, then kills it if it is still around after
/// `grace_period`.
///
/// Returns true if the host exited within the grace period.
pub(super) async fn terminate_tree(
    child: &mut Child,
    root_pid: u32,
    pids: &[u32],
    job: Option<&Arc<Job>>,
    grace_period: Duration,
) -> bool {
    if child.id().is_none() {
        // Already exited: clean up any stragglers.
        kill_tree(root_pid, pids, job);
        return true;
    }

    unsafe {
        libc::kill(-(root_pid as libc::pid_t), SIGTERM);
    }

    let exited = tokio::select! {
        _ = child.wait() => true,
        () = tokio::time::sleep(grace_period) => false,
    };

    // SIGKILL in either case: descendants may outlive the host.
    kill_tree(root_pid, pids, job);
    if !exited {
        _ = child.wait().await;
    }
    exited
}
