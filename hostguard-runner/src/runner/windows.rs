// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::ProcessEnumError,
    process_tree::{JobObjectEnumerator, ProcessEntry, ProcessEnumerator},
};
use std::{sync::Arc, time::Duration};
use tokio::process::Child;
use tracing::debug;
pub(super) use win32job::Job;
use win32job::JobError;
use windows_sys::Win32::System::JobObjects::TerminateJobObject;

pub(super) fn create_job() -> Result<Job, JobError> {
    Job::create_with_limit_info(win32job::ExtendedLimitInfo::new().limit_kill_on_job_close())
}

pub(super) fn set_process_group(_cmd: &mut std::process::Command) {}

pub(super) fn assign_process_to_job(child: &Child, job: Option<&Job>) -> Result<(), JobError> {
    if let Some(job) = job {
        let Some(handle) = child.raw_handle() else {
            // The child has exited already.
            return Ok(());
        };
        job.assign_process(handle as isize)?;
    }

    Ok(())
}

pub(super) fn enumerator(job: Option<&Arc<Job>>) -> Arc<dyn ProcessEnumerator> {
    match job {
        Some(job) => Arc::new(JobObjectEnumerator::new(job.clone())),
        None => Arc::new(RootOnly),
    }
}

/// Used if the job object couldn't be created: only the host itself is tracked.
struct RootOnly;

impl ProcessEnumerator for RootOnly {
    fn enumerate(&self) -> Result<Vec<ProcessEntry>, ProcessEnumError> {
        Ok(Vec::new())
    }
}

pub(super) fn kill_tree(root_pid: u32, _pids: &[u32], job: Option<&Arc<Job>>) {
    debug!(root_pid, "terminating job object");
    if let Some(job) = job {
        let handle = job.handle();
        unsafe {
            // Ignore the error here: it's likely due to every process having exited.
            // Note: 1 is the exit code returned by Windows.
            _ = TerminateJobObject(handle as _, 1);
        }
    }
}

/// Waits for the host to exit on its own (it receives the same Ctrl-C as we do), then terminates
/// the job object.
///
/// Returns true if the host exited within the grace period.
pub(super) async fn terminate_tree(
    child: &mut Child,
    root_pid: u32,
    pids: &[u32],
    job: Option<&Arc<Job>>,
    grace_period: Duration,
) -> bool {
    let exited = tokio::select! {
        _ = child.wait() => true,
        () = tokio::time::sleep(grace_period) => false,
    };

    kill_tree(root_pid, pids, job);
    if !exited {
        _ = child.start_kill();
        _ = child.wait().await;
    }
    exited
}
