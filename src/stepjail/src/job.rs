// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The job-step view handed in by the workload manager.

use std::fmt;

use nix::unistd::{Gid, Pid, Uid};

/// Step identifier within a job. `batch` and `extern` are sentinels for
/// the batch script step and the external process step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StepId {
    Step(u32),
    Batch,
    Extern,
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepId::Step(id) => write!(f, "{}", id),
            StepId::Batch => write!(f, "batch"),
            StepId::Extern => write!(f, "extern"),
        }
    }
}

/// One local task (process rank) of a step on this node.
#[derive(Clone, Copy, Debug)]
pub struct TaskSpec {
    pub pid: Pid,
    pub local_id: u32,
}

/// Everything the containment layer needs to know about a step.
#[derive(Clone, Debug)]
pub struct JobSpec {
    pub job_id: u32,
    /// For pack jobs all components share one job cgroup, keyed by the
    /// pack leader's id.
    pub pack_job_id: Option<u32>,
    pub step_id: StepId,
    pub uid: Uid,
    pub gid: Gid,

    /// Requested memory per node in bytes; 0 means the whole node.
    pub job_mem_bytes: u64,
    /// Total node memory in bytes; 0 lets the plugin read it from the
    /// system.
    pub node_mem_bytes: u64,

    /// Allocated CPU list, e.g. `"0-3,8"`.
    pub cpus: Option<String>,
    /// Allocated NUMA memory node list.
    pub mems: Option<String>,

    pub tasks: Vec<TaskSpec>,
}

impl JobSpec {
    /// The id used in cgroup paths.
    pub fn effective_job_id(&self) -> u32 {
        self.pack_job_id.unwrap_or(self.job_id)
    }
}
