// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Construction and teardown of the per-step cgroup subtree.
//!
//! Every controller uses the same four levels below its root:
//! `<prepend>/uid_<UID>/job_<JOBID>/step_<STEPID>`, with `task_<LOCALID>`
//! leaves below the step. The scratch root (`<prepend>`) is created on
//! demand and never removed. Callers hold the controller-root lock across
//! both build and teardown; shared ancestors (`uid_*`, `job_*`) are racy
//! against other step helpers otherwise.

use std::fs;
use std::path::PathBuf;

use nix::unistd::{Gid, Uid};
use xcgroup::{CgroupHandle, CgroupNamespace, Result, XCgroupError};

use crate::config::CgroupConfig;
use crate::job::JobSpec;

const DELETE_RETRIES: u32 = 20;

/// The precomputed namespace-relative names of one step's chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepPaths {
    pub root: String,
    pub user: String,
    pub job: String,
    pub step: String,
}

impl StepPaths {
    pub fn new(cfg: &CgroupConfig, job: &JobSpec) -> Self {
        let root = cfg.prepend.clone();
        let user = format!("{}/uid_{}", root, job.uid);
        let jobp = format!("{}/job_{}", user, job.effective_job_id());
        let step = format!("{}/step_{}", jobp, job.step_id);
        StepPaths {
            root,
            user,
            job: jobp,
            step,
        }
    }

    pub fn task(&self, local_id: u32) -> String {
        format!("{}/task_{}", self.step, local_id)
    }
}

/// Handles on the levels a controller writes limits to.
pub struct StepCgroups<'ns> {
    pub user: CgroupHandle<'ns>,
    pub job: CgroupHandle<'ns>,
    pub step: CgroupHandle<'ns>,
}

/// What teardown managed to remove. `busy` lists levels still pinned by
/// concurrent steps; that is expected, not an error.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub step_removed: bool,
    pub job_removed: bool,
    pub user_removed: bool,
    pub busy: Vec<PathBuf>,
}

/// Materialize the chain down to the step level.
///
/// The scratch root keeps the invoking (root) ownership; everything from
/// the uid level down is chowned to the job's owner so the unprivileged
/// step helper can manage its own leaves.
pub fn build<'ns>(
    ns: &'ns CgroupNamespace,
    paths: &StepPaths,
    uid: Uid,
    gid: Gid,
) -> Result<StepCgroups<'ns>> {
    build_with(ns, paths, uid, gid, |_, _| Ok(()))
}

/// Like [`build`], invoking `on_create(parent, child)` after each level is
/// instantiated. Controllers that need explicit downward propagation
/// (cpuset) hook in here.
pub fn build_with<'ns, F>(
    ns: &'ns CgroupNamespace,
    paths: &StepPaths,
    uid: Uid,
    gid: Gid,
    mut on_create: F,
) -> Result<StepCgroups<'ns>>
where
    F: FnMut(&CgroupHandle<'_>, &CgroupHandle<'_>) -> Result<()>,
{
    let ctl_root = ns.root_handle()?;

    let root = CgroupHandle::new(ns, &paths.root, Uid::current(), Gid::current())?;
    root.instantiate()?;
    on_create(&ctl_root, &root)?;

    let user = CgroupHandle::new(ns, &paths.user, uid, gid)?;
    user.instantiate()?;
    on_create(&root, &user)?;

    let job = CgroupHandle::new(ns, &paths.job, uid, gid)?;
    job.instantiate()?;
    on_create(&user, &job)?;

    let step = CgroupHandle::new(ns, &paths.step, uid, gid)?;
    step.instantiate()?;
    on_create(&job, &step)?;

    Ok(StepCgroups { user, job, step })
}

/// Create one `task_<LOCALID>` leaf under the step.
pub fn task_leaf<'ns, F>(
    ns: &'ns CgroupNamespace,
    paths: &StepPaths,
    local_id: u32,
    uid: Uid,
    gid: Gid,
    mut on_create: F,
) -> Result<CgroupHandle<'ns>>
where
    F: FnMut(&CgroupHandle<'_>, &CgroupHandle<'_>) -> Result<()>,
{
    let step = CgroupHandle::load(ns, &paths.step)?;
    let task = CgroupHandle::new(ns, &paths.task(local_id), uid, gid)?;
    task.instantiate()?;
    on_create(&step, &task)?;
    Ok(task)
}

/// Remove the step's subtree, innermost first: task leaves, step, job,
/// uid. Busy shared ancestors are left for the last step out; a vanished
/// level means a concurrent teardown won, which is equally fine. Always
/// walks the whole chain even when an inner level resists.
pub fn teardown(ns: &CgroupNamespace, paths: &StepPaths) -> TeardownReport {
    let mut report = TeardownReport::default();

    delete_task_leaves(ns, paths);

    report.step_removed = delete_level(ns, &paths.step, DELETE_RETRIES, &mut report.busy);
    // siblings of this step may still be live; one attempt only
    report.job_removed = delete_level(ns, &paths.job, 1, &mut report.busy);
    report.user_removed = delete_level(ns, &paths.user, 1, &mut report.busy);

    report
}

fn delete_task_leaves(ns: &CgroupNamespace, paths: &StepPaths) {
    let step_abs = PathBuf::from(format!("{}{}", ns.mnt_point().display(), paths.step));
    let entries = match fs::read_dir(&step_abs) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("task_") {
            continue;
        }
        let rel = format!("{}/{}", paths.step, name);
        match CgroupHandle::load(ns, &rel) {
            Ok(leaf) => {
                if let Err(e) = leaf.delete_with_retry(DELETE_RETRIES) {
                    warn!(sl!(), "could not remove task leaf {}: {}", rel, e);
                }
            }
            Err(e) => debug!(sl!(), "task leaf {} vanished during teardown: {}", rel, e),
        }
    }
}

fn delete_level(ns: &CgroupNamespace, rel: &str, retries: u32, busy: &mut Vec<PathBuf>) -> bool {
    let handle = match CgroupHandle::new(ns, rel, Uid::current(), Gid::current()) {
        Ok(h) => h,
        Err(e) => {
            warn!(sl!(), "bad cgroup name {} during teardown: {}", rel, e);
            return false;
        }
    };

    match handle.delete_with_retry(retries) {
        Ok(()) => true,
        Err(XCgroupError::Busy(path)) => {
            info!(sl!(), "cgroup {} still in use, leaving it", path.display());
            busy.push(path);
            false
        }
        Err(e) => {
            warn!(sl!(), "failed to remove cgroup {}: {}", rel, e);
            false
        }
    }
}
