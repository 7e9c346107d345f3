// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Device containment: revoke the default allow-all on the job cgroup and
//! replay the administrator's whitelist.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::unistd;
use xcgroup::{CgroupHandle, CgroupNamespace, XCgroupError};

use crate::config::CgroupConfig;
use crate::hierarchy::{self, StepPaths};
use crate::job::JobSpec;

pub const SUBSYSTEM: &str = "devices";

const DEVICES_ALLOW: &str = "devices.allow";
const DEVICES_DENY: &str = "devices.deny";

/// One validated `devices.allow` entry, e.g. `c 1:3 rwm`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceEntry(String);

impl DeviceEntry {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Parse an allowed-devices file: one entry per line, `#` comments and
/// blank lines skipped. Malformed entries are configuration errors.
pub fn parse_allowed_devices(content: &str) -> Result<Vec<DeviceEntry>> {
    let mut entries = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        validate_entry(line).map_err(|what| {
            XCgroupError::Config(format!(
                "allowed devices line {}: {} in '{}'",
                index + 1,
                what,
                line
            ))
        })?;
        entries.push(DeviceEntry(line.to_string()));
    }
    Ok(entries)
}

// Entry grammar: "<a|b|c> <major|*>:<minor|*> <access>", access a subset
// of rwm.
fn validate_entry(line: &str) -> Result<(), &'static str> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 3 {
        return Err("expected three fields");
    }
    if !matches!(fields[0], "a" | "b" | "c") {
        return Err("device type must be a, b or c");
    }

    let (major, minor) = fields[1].split_once(':').ok_or("expected major:minor")?;
    for number in [major, minor] {
        if number != "*" && number.parse::<u64>().is_err() {
            return Err("major/minor must be a number or *");
        }
    }

    if fields[2].is_empty() || !fields[2].chars().all(|c| matches!(c, 'r' | 'w' | 'm')) {
        return Err("access must be a subset of rwm");
    }
    Ok(())
}

/// The devices constraint controller.
pub struct DevicesCgroup {
    ns: CgroupNamespace,
    cfg: Arc<CgroupConfig>,
    allowed: Vec<DeviceEntry>,
}

impl DevicesCgroup {
    pub fn init(cfg: Arc<CgroupConfig>) -> Result<Self> {
        let allowed = load_allowed_file(&cfg.allowed_devices_file)?;
        let mut ns = CgroupNamespace::new(&cfg.mountpoint, SUBSYSTEM)?;
        ns.ensure(cfg.automount)
            .context("devices controller unusable")?;
        Ok(DevicesCgroup { ns, cfg, allowed })
    }

    pub fn ns(&self) -> &CgroupNamespace {
        &self.ns
    }

    pub fn allowed(&self) -> &[DeviceEntry] {
        &self.allowed
    }

    /// Build the subtree, then on the job cgroup deny everything and
    /// replay the whitelist. The step and task levels inherit.
    pub fn pre_setuid(&self, job: &JobSpec) -> Result<()> {
        let root = self.ns.root_handle()?;
        let _lock = root.lock().context("lock devices controller root")?;

        let paths = StepPaths::new(&self.cfg, job);
        let cgs = hierarchy::build(&self.ns, &paths, job.uid, job.gid)
            .context("build devices hierarchy")?;

        cgs.job
            .set_param(DEVICES_DENY, "a")
            .context("revoke default device access")?;
        for entry in &self.allowed {
            cgs.job
                .set_param(DEVICES_ALLOW, entry.as_str())
                .with_context(|| format!("allow device '{}'", entry.as_str()))?;
        }

        info!(
            sl!(),
            "job {} confined to {} allowed devices",
            job.effective_job_id(),
            self.allowed.len()
        );
        Ok(())
    }

    pub fn pre_launch(&self, job: &JobSpec) -> Result<()> {
        let paths = StepPaths::new(&self.cfg, job);
        let step = CgroupHandle::load(&self.ns, &paths.step)?;
        step.move_process(unistd::getpid())
            .context("attach helper to devices step cgroup")
    }

    pub fn add_pid(&self, job: &JobSpec, pid: unistd::Pid) -> Result<()> {
        let paths = StepPaths::new(&self.cfg, job);
        let step = CgroupHandle::load(&self.ns, &paths.step)?;
        step.add_pids(&[pid]).map_err(Into::into)
    }

    pub fn post_step(&self, job: &JobSpec) -> Result<()> {
        let root = self.ns.root_handle()?;
        let _lock = root.lock().context("lock devices controller root")?;

        let paths = StepPaths::new(&self.cfg, job);
        let report = hierarchy::teardown(&self.ns, &paths);
        if !report.step_removed {
            warn!(sl!(), "devices step cgroup {} not removed", paths.step);
        }
        Ok(())
    }

    pub fn fini(&mut self) {
        if self.ns.mounted_here() {
            if let Err(e) = self.ns.umount() {
                warn!(sl!(), "failed to unmount devices controller: {}", e);
            }
        }
    }
}

fn load_allowed_file(path: &Path) -> Result<Vec<DeviceEntry>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("read allowed devices file {}", path.display()))?;
    parse_allowed_devices(&content)
}
