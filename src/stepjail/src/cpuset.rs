// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! cpuset containment.
//!
//! v1 cpuset children start with empty `cpuset.cpus`/`cpuset.mems`, so the
//! parent masks are copied down at every level as the chain is built. Job
//! allocations are intersected with what the parent actually offers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use nix::unistd;
use xcgroup::{CgroupHandle, CgroupNamespace, XCgroupError};

use crate::config::CgroupConfig;
use crate::hierarchy::{self, StepPaths};
use crate::job::JobSpec;

pub const SUBSYSTEM: &str = "cpuset";

const CPUS: &str = "cpuset.cpus";
const MEMS: &str = "cpuset.mems";

/// A set of CPU (or NUMA node) ids, kept sorted and deduplicated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuMask(Vec<u32>);

impl FromStr for CpuMask {
    type Err = XCgroupError;

    /// Parse a kernel cpu list: comma-separated ids and inclusive ranges,
    /// e.g. `"0-3,8"`. An empty string is the empty mask.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ids = Vec::new();
        for token in s.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match token.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = parse_id(lo)?;
                    let hi: u32 = parse_id(hi)?;
                    if lo > hi {
                        return Err(XCgroupError::Parse {
                            path: Default::default(),
                            what: "cpu list range",
                        });
                    }
                    ids.extend(lo..=hi);
                }
                None => ids.push(parse_id(token)?),
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(CpuMask(ids))
    }
}

fn parse_id(token: &str) -> Result<u32, XCgroupError> {
    token.trim().parse().map_err(|_| XCgroupError::Parse {
        path: Default::default(),
        what: "cpu list id",
    })
}

impl CpuMask {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn intersect(&self, other: &CpuMask) -> CpuMask {
        CpuMask(
            self.0
                .iter()
                .copied()
                .filter(|id| other.0.binary_search(id).is_ok())
                .collect(),
        )
    }
}

impl fmt::Display for CpuMask {
    /// Render back to the canonical range list form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut i = 0;
        while i < self.0.len() {
            let start = self.0[i];
            let mut end = start;
            while i + 1 < self.0.len() && self.0[i + 1] == end + 1 {
                i += 1;
                end = self.0[i];
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
            i += 1;
        }
        Ok(())
    }
}

// Copy the parent's masks into a freshly created child when the child has
// none yet. Controllers without cpuset files (scratch trees, foreign
// subsystems) have nothing to propagate.
fn propagate(parent: &CgroupHandle<'_>, child: &CgroupHandle<'_>) -> xcgroup::Result<()> {
    for file in [CPUS, MEMS] {
        let current = match child.get_string(file) {
            Ok(v) => v,
            Err(XCgroupError::Fs { op: "open", .. }) => continue,
            Err(e) => return Err(e),
        };
        if current.is_empty() {
            let inherited = parent.get_string(file)?;
            if !inherited.is_empty() {
                child.set_param(file, &inherited)?;
            }
        }
    }
    Ok(())
}

/// The cpuset constraint controller.
pub struct CpusetCgroup {
    ns: CgroupNamespace,
    cfg: Arc<CgroupConfig>,
}

impl CpusetCgroup {
    pub fn init(cfg: Arc<CgroupConfig>) -> Result<Self> {
        let mut ns = CgroupNamespace::new(&cfg.mountpoint, SUBSYSTEM)?;
        ns.ensure(cfg.automount)
            .context("cpuset controller unusable")?;
        Ok(CpusetCgroup { ns, cfg })
    }

    pub fn ns(&self) -> &CgroupNamespace {
        &self.ns
    }

    /// Build the subtree with masks propagated down, then narrow the job
    /// and step levels to the job's allocation.
    pub fn pre_setuid(&self, job: &JobSpec) -> Result<()> {
        let root = self.ns.root_handle()?;
        let _lock = root.lock().context("lock cpuset controller root")?;

        let paths = StepPaths::new(&self.cfg, job);
        let cgs = hierarchy::build_with(&self.ns, &paths, job.uid, job.gid, propagate)
            .context("build cpuset hierarchy")?;

        self.apply_allocation(&cgs.user, &cgs.job, &cgs.step, CPUS, job.cpus.as_deref())?;
        self.apply_allocation(&cgs.user, &cgs.job, &cgs.step, MEMS, job.mems.as_deref())?;

        Ok(())
    }

    fn apply_allocation(
        &self,
        user: &CgroupHandle<'_>,
        job: &CgroupHandle<'_>,
        step: &CgroupHandle<'_>,
        file: &str,
        allocation: Option<&str>,
    ) -> Result<()> {
        let wanted = match allocation {
            Some(list) => list.parse::<CpuMask>()?,
            None => return Ok(()),
        };

        let available = match user.get_string(file) {
            Ok(list) => list.parse::<CpuMask>()?,
            // no cpuset files on this tree, nothing to narrow
            Err(XCgroupError::Fs { op: "open", .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let effective = wanted.intersect(&available);
        if effective.is_empty() {
            return Err(anyhow!(XCgroupError::Limit(format!(
                "{} allocation {} does not intersect available {}",
                file, wanted, available
            ))));
        }
        if effective.len() < wanted.len() {
            warn!(
                sl!(),
                "{} allocation {} narrowed to {}", file, wanted, effective
            );
        }

        let rendered = effective.to_string();
        job.set_param(file, &rendered)?;
        step.set_param(file, &rendered)?;
        Ok(())
    }

    /// Attach the step helper; with task affinity enabled, also create the
    /// per-task leaves and pin each task PID into its own leaf.
    pub fn pre_launch(&self, job: &JobSpec) -> Result<()> {
        let paths = StepPaths::new(&self.cfg, job);
        let step = CgroupHandle::load(&self.ns, &paths.step)?;
        step.move_process(unistd::getpid())
            .context("attach helper to cpuset step cgroup")?;

        if !self.cfg.task_affinity {
            return Ok(());
        }

        for task in &job.tasks {
            let leaf =
                hierarchy::task_leaf(&self.ns, &paths, task.local_id, job.uid, job.gid, propagate)
                    .with_context(|| format!("create cpuset task leaf {}", task.local_id))?;
            leaf.add_pids(&[task.pid])?;
        }
        Ok(())
    }

    pub fn add_pid(&self, job: &JobSpec, pid: unistd::Pid) -> Result<()> {
        let paths = StepPaths::new(&self.cfg, job);
        let step = CgroupHandle::load(&self.ns, &paths.step)?;
        step.add_pids(&[pid]).map_err(Into::into)
    }

    pub fn post_step(&self, job: &JobSpec) -> Result<()> {
        let root = self.ns.root_handle()?;
        let _lock = root.lock().context("lock cpuset controller root")?;

        let paths = StepPaths::new(&self.cfg, job);
        let report = hierarchy::teardown(&self.ns, &paths);
        if !report.step_removed {
            warn!(sl!(), "cpuset step cgroup {} not removed", paths.step);
        }
        Ok(())
    }

    pub fn fini(&mut self) {
        if self.ns.mounted_here() {
            if let Err(e) = self.ns.umount() {
                warn!(sl!(), "failed to unmount cpuset controller: {}", e);
            }
        }
    }
}
