// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Read-only accounting attachment.
//!
//! Mirrors the containment subtree under `cpuacct` and `memory` without
//! writing any limits, so per-task usage can be sampled while the step
//! runs. Accounting must never abort a step: every failure here downgrades
//! to a warning.

use std::sync::Arc;

use anyhow::{Context, Result};
use xcgroup::{CgroupHandle, CgroupNamespace};

use crate::config::CgroupConfig;
use crate::hierarchy::{self, StepPaths};
use crate::job::JobSpec;

const CPUACCT_USAGE: &str = "cpuacct.usage";
const MEMORY_USAGE: &str = "memory.usage_in_bytes";
const MEMORY_MAX_USAGE: &str = "memory.max_usage_in_bytes";

/// Identifies a task's accounting records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobAcctId {
    pub job_id: u32,
    pub local_id: u32,
}

/// One usage sample for a task leaf.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskUsage {
    pub cpu_ns: u64,
    pub mem_bytes: u64,
    pub mem_max_bytes: u64,
}

/// The accounting attachment over `cpuacct` and a read-only view of
/// `memory`.
pub struct AcctGather {
    cpuacct: CgroupNamespace,
    memory: CgroupNamespace,
    cfg: Arc<CgroupConfig>,
    attached: Vec<JobAcctId>,
}

impl AcctGather {
    pub fn init(cfg: Arc<CgroupConfig>) -> Result<Self> {
        let mut cpuacct = CgroupNamespace::new(&cfg.mountpoint, "cpuacct")?;
        cpuacct
            .ensure(cfg.automount)
            .context("cpuacct controller unusable")?;

        let mut memory = CgroupNamespace::new(&cfg.mountpoint, "memory")?;
        memory
            .ensure(cfg.automount)
            .context("memory controller unusable for accounting")?;

        Ok(AcctGather {
            cpuacct,
            memory,
            cfg,
            attached: Vec::new(),
        })
    }

    /// Build both accounting subtrees down to the step level.
    pub fn pre_setuid(&self, job: &JobSpec) -> Result<()> {
        let paths = StepPaths::new(&self.cfg, job);
        for ns in [&self.cpuacct, &self.memory] {
            let root = ns.root_handle()?;
            let _lock = root.lock().context("lock accounting controller root")?;
            hierarchy::build(ns, &paths, job.uid, job.gid)
                .with_context(|| format!("build {} accounting hierarchy", ns.subsystems()))?;
        }
        Ok(())
    }

    /// Create the task leaves and attach every task PID to its own leaf.
    /// The leaves are what sampling reads.
    pub fn pre_launch(&mut self, job: &JobSpec) -> Result<()> {
        let paths = StepPaths::new(&self.cfg, job);
        for task in &job.tasks {
            for ns in [&self.cpuacct, &self.memory] {
                let leaf = hierarchy::task_leaf(
                    ns,
                    &paths,
                    task.local_id,
                    job.uid,
                    job.gid,
                    |_, _| Ok(()),
                )
                .with_context(|| {
                    format!(
                        "create {} accounting leaf for task {}",
                        ns.subsystems(),
                        task.local_id
                    )
                })?;
                leaf.add_pids(&[task.pid])?;
            }
            self.attached.push(JobAcctId {
                job_id: job.effective_job_id(),
                local_id: task.local_id,
            });
        }
        Ok(())
    }

    /// Tasks with live accounting leaves.
    pub fn attached(&self) -> &[JobAcctId] {
        &self.attached
    }

    /// Read one task's current usage.
    pub fn sample(&self, job: &JobSpec, local_id: u32) -> Result<TaskUsage> {
        let paths = StepPaths::new(&self.cfg, job);
        let task_rel = paths.task(local_id);

        let cpu = CgroupHandle::load(&self.cpuacct, &task_rel)?;
        let mem = CgroupHandle::load(&self.memory, &task_rel)?;

        Ok(TaskUsage {
            cpu_ns: cpu.get_u64(CPUACCT_USAGE).unwrap_or(0),
            mem_bytes: mem.get_u64(MEMORY_USAGE).unwrap_or(0),
            mem_max_bytes: mem.get_u64(MEMORY_MAX_USAGE).unwrap_or(0),
        })
    }

    /// Remove both accounting subtrees. Warn-only.
    pub fn post_step(&mut self, job: &JobSpec) {
        let paths = StepPaths::new(&self.cfg, job);
        for ns in [&self.cpuacct, &self.memory] {
            match ns.root_handle().and_then(|root| root.lock()) {
                Ok(_lock) => {
                    let report = hierarchy::teardown(ns, &paths);
                    if !report.step_removed {
                        warn!(
                            sl!(),
                            "{} accounting cgroup {} not removed",
                            ns.subsystems(),
                            paths.step
                        );
                    }
                }
                Err(e) => warn!(
                    sl!(),
                    "cannot lock {} for accounting teardown: {}",
                    ns.subsystems(),
                    e
                ),
            }
        }
        self.attached
            .retain(|id| id.job_id != job.effective_job_id());
    }

    pub fn fini(&mut self) {
        for ns in [&mut self.cpuacct, &mut self.memory] {
            if ns.mounted_here() {
                if let Err(e) = ns.umount() {
                    warn!(sl!(), "failed to unmount {}: {}", ns.subsystems(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{StepId, TaskSpec};
    use nix::unistd::{Gid, Pid, Uid};
    use std::fs;
    use xcgroup::fileio;

    fn scratch_setup() -> (tempfile::TempDir, Arc<CgroupConfig>) {
        let tmpdir = tempfile::tempdir().unwrap();
        let mut cfg = CgroupConfig::default();
        cfg.mountpoint = tmpdir.path().to_path_buf();
        for subsystem in ["cpuacct", "memory"] {
            let mnt = tmpdir.path().join(subsystem);
            fs::create_dir_all(&mnt).unwrap();
            fileio::write_string(mnt.join("release_agent"), "").unwrap();
        }
        (tmpdir, Arc::new(cfg))
    }

    fn test_job() -> JobSpec {
        JobSpec {
            job_id: 7,
            pack_job_id: None,
            step_id: StepId::Step(0),
            uid: Uid::current(),
            gid: Gid::current(),
            job_mem_bytes: 0,
            node_mem_bytes: 0,
            cpus: None,
            mems: None,
            tasks: vec![TaskSpec {
                pid: Pid::from_raw(4242),
                local_id: 0,
            }],
        }
    }

    #[test]
    fn test_attach_and_sample() {
        let (tmpdir, cfg) = scratch_setup();
        let mut acct = AcctGather::init(cfg).unwrap();
        let job = test_job();

        acct.pre_setuid(&job).unwrap();
        acct.pre_launch(&job).unwrap();
        assert_eq!(
            acct.attached(),
            &[JobAcctId {
                job_id: 7,
                local_id: 0
            }]
        );

        let task_dir = tmpdir
            .path()
            .join("cpuacct/slurm/uid_".to_string() + &Uid::current().to_string())
            .join("job_7/step_0/task_0");
        assert!(task_dir.is_dir());

        // seed usage files the way a kernel would
        fileio::write_string(task_dir.join(CPUACCT_USAGE), "123456789").unwrap();
        let mem_task = tmpdir
            .path()
            .join("memory/slurm/uid_".to_string() + &Uid::current().to_string())
            .join("job_7/step_0/task_0");
        fileio::write_string(mem_task.join(MEMORY_USAGE), "1048576").unwrap();
        fileio::write_string(mem_task.join(MEMORY_MAX_USAGE), "2097152").unwrap();

        let usage = acct.sample(&job, 0).unwrap();
        assert_eq!(
            usage,
            TaskUsage {
                cpu_ns: 123456789,
                mem_bytes: 1048576,
                mem_max_bytes: 2097152,
            }
        );

        acct.post_step(&job);
        assert!(acct.attached().is_empty());
    }
}
