// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ProcessEntry, ProcessEnumerator};
use crate::errors::ProcessEnumError;
use std::sync::Arc;
use win32job::Job;

/// Enumerates the processes assigned to a job object.
///
/// Every process the host spawns inherits its job, so the listing is already scoped to the tree.
#[derive(Clone)]
pub struct JobObjectEnumerator {
    job: Arc<Job>,
}

impl JobObjectEnumerator {
    /// Creates an enumerator for the given job.
    pub fn new(job: Arc<Job>) -> Self {
        Self { job }
    }
}

impl std::fmt::Debug for JobObjectEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobObjectEnumerator").finish_non_exhaustive()
    }
}

impl ProcessEnumerator for JobObjectEnumerator {
    fn enumerate(&self) -> Result<Vec<ProcessEntry>, ProcessEnumError> {
        let pids = self
            .job
            .query_process_id_list()
            .map_err(|err| ProcessEnumError::JobObject {
                message: err.to_string(),
            })?;
        Ok(pids
            .into_iter()
            .map(|pid| ProcessEntry {
                pid: pid as u32,
                ppid: None,
                name: None,
            })
            .collect())
    }
}
