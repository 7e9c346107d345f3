// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Memory containment: limit derivation, publication, and OOM inspection.

use std::fs;

use anyhow::{anyhow, Context, Result};
use nix::unistd;
use scan_fmt::scan_fmt;
use std::sync::Arc;
use xcgroup::{CgroupHandle, CgroupNamespace, XCgroupError};

use crate::config::CgroupConfig;
use crate::hierarchy::{self, StepPaths};
use crate::job::JobSpec;

pub const SUBSYSTEM: &str = "memory";

const LIMIT_IN_BYTES: &str = "memory.limit_in_bytes";
const MEMSW_LIMIT_IN_BYTES: &str = "memory.memsw.limit_in_bytes";
const KMEM_LIMIT_IN_BYTES: &str = "memory.kmem.limit_in_bytes";
const SWAPPINESS: &str = "memory.swappiness";
const FORCE_EMPTY: &str = "memory.force_empty";
const FAILCNT: &str = "memory.failcnt";
const OOM_CONTROL: &str = "memory.oom_control";

/// Limits derived from the configuration and the job's request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemLimits {
    pub ram: u64,
    pub memsw: Option<u64>,
    pub kmem: Option<u64>,
    pub swappiness: Option<u64>,
}

impl MemLimits {
    /// `request` is the job's per-node memory request in bytes (0 means
    /// the whole node), `node` the node total.
    ///
    /// The RAM limit is `request * allowed_ram`, floored at `min_ram` and
    /// capped at `node * max_ram_percent`. An `allowed_*` ratio of 0 means
    /// unlimited, leaving only the percent cap. The swap allowance is
    /// derived the same way and granted on top of RAM.
    pub fn derive(cfg: &CgroupConfig, request: u64, node: u64) -> Result<MemLimits> {
        if node == 0 {
            return Err(anyhow!(XCgroupError::Limit(
                "node memory size is unknown".to_string()
            )));
        }
        let request = if request == 0 { node } else { request };

        let ram_cap = scale(node, cfg.max_ram_percent);
        let ram = if cfg.allowed_ram == 0.0 {
            ram_cap
        } else {
            allowance(request, cfg.allowed_ram)
                .max(cfg.min_ram_bytes)
                .min(ram_cap)
        };
        if ram == 0 {
            return Err(anyhow!(XCgroupError::Limit(format!(
                "derived memory limit is zero (request {} node {})",
                request, node
            ))));
        }

        let memsw = if cfg.constrain_swap {
            let swap_cap = scale(node, cfg.max_swap_percent);
            let extra = if cfg.allowed_swap == 0.0 {
                swap_cap
            } else {
                allowance(request, cfg.allowed_swap).min(swap_cap)
            };
            Some(ram.saturating_add(extra))
        } else {
            None
        };

        let kmem = if cfg.constrain_kmem {
            let kmem_cap = scale(node, cfg.max_kmem_percent);
            Some(if cfg.allowed_kmem == 0.0 {
                kmem_cap
            } else {
                allowance(request, cfg.allowed_kmem)
                    .max(cfg.min_kmem_bytes)
                    .min(kmem_cap)
            })
        } else {
            None
        };

        Ok(MemLimits {
            ram,
            memsw,
            kmem,
            swappiness: cfg.swappiness,
        })
    }
}

fn scale(bytes: u64, percent: f64) -> u64 {
    (bytes as f64 * percent / 100.0) as u64
}

fn allowance(bytes: u64, ratio: f64) -> u64 {
    (bytes as f64 * ratio) as u64
}

/// Node memory total from `/proc/meminfo`.
pub fn node_total_memory() -> Result<u64> {
    let content = fs::read_to_string("/proc/meminfo").context("read /proc/meminfo")?;
    for line in content.lines() {
        if let Ok(kb) = scan_fmt!(line, "MemTotal: {d} kB", u64) {
            return Ok(kb * 1024);
        }
    }
    Err(anyhow!("MemTotal missing from /proc/meminfo"))
}

/// Which level of the hierarchy an OOM indicator fired on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OomLevel {
    Task(u32),
    Step,
    Job,
}

#[derive(Clone, Debug)]
pub struct OomEvent {
    pub level: OomLevel,
    pub fail_cnt: u64,
    pub kills: u64,
}

/// OOM indicators per level, innermost first. Counters are read after
/// termination, so a kill charged to the job cannot be attributed to one
/// particular step; every level that fired is reported.
#[derive(Clone, Debug, Default)]
pub struct OomReport {
    pub events: Vec<OomEvent>,
}

impl OomReport {
    pub fn oom_detected(&self) -> bool {
        !self.events.is_empty()
    }
}

// memory.oom_control is "key value" lines; oom_kill only exists on newer
// kernels.
fn parse_oom_control(text: &str) -> u64 {
    for line in text.lines() {
        if let Ok((key, value)) = scan_fmt!(line, "{} {d}", String, u64) {
            if key == "oom_kill" {
                return value;
            }
        }
    }
    0
}

/// The memory constraint controller.
pub struct MemoryCgroup {
    ns: CgroupNamespace,
    cfg: Arc<CgroupConfig>,
}

impl MemoryCgroup {
    pub fn init(cfg: Arc<CgroupConfig>) -> Result<Self> {
        let mut ns = CgroupNamespace::new(&cfg.mountpoint, SUBSYSTEM)?;
        ns.ensure(cfg.automount)
            .context("memory controller unusable")?;
        Ok(MemoryCgroup { ns, cfg })
    }

    pub fn ns(&self) -> &CgroupNamespace {
        &self.ns
    }

    /// Build the subtree and publish limits at job and step level, under
    /// the controller-root lock. Runs as root, before the setuid.
    pub fn pre_setuid(&self, job: &JobSpec) -> Result<()> {
        let node = if job.node_mem_bytes != 0 {
            job.node_mem_bytes
        } else {
            node_total_memory()?
        };
        let limits = MemLimits::derive(&self.cfg, job.job_mem_bytes, node)?;

        let root = self.ns.root_handle()?;
        let _lock = root.lock().context("lock memory controller root")?;

        let paths = StepPaths::new(&self.cfg, job);
        let cgs = hierarchy::build(&self.ns, &paths, job.uid, job.gid)
            .context("build memory hierarchy")?;

        // concurrent steps share the job-level cap
        for handle in [&cgs.job, &cgs.step] {
            handle.set_u64(LIMIT_IN_BYTES, limits.ram)?;
            if let Some(memsw) = limits.memsw {
                handle.set_u64(MEMSW_LIMIT_IN_BYTES, memsw)?;
            }
            if let Some(swappiness) = limits.swappiness {
                handle.set_u64(SWAPPINESS, swappiness)?;
            }
            if let Some(kmem) = limits.kmem {
                handle.set_u64(KMEM_LIMIT_IN_BYTES, kmem)?;
            }
        }

        info!(
            sl!(),
            "memory limits for job {} step {}: ram {} memsw {:?} kmem {:?}",
            job.effective_job_id(),
            job.step_id,
            limits.ram,
            limits.memsw,
            limits.kmem
        );
        Ok(())
    }

    /// Attach the step helper itself to the step cgroup. Runs after the
    /// setuid, so everything it forks is contained from the start.
    pub fn pre_launch(&self, job: &JobSpec) -> Result<()> {
        let paths = StepPaths::new(&self.cfg, job);
        let step = CgroupHandle::load(&self.ns, &paths.step)?;
        step.move_process(unistd::getpid())
            .context("attach helper to memory step cgroup")
    }

    pub fn add_pid(&self, job: &JobSpec, pid: unistd::Pid) -> Result<()> {
        let paths = StepPaths::new(&self.cfg, job);
        let step = CgroupHandle::load(&self.ns, &paths.step)?;
        step.add_pids(&[pid]).map_err(Into::into)
    }

    /// Tear the subtree down. Pages are pushed to the parent first so the
    /// rmdir does not depend on the release agent's asynchronous reclaim.
    pub fn post_step(&self, job: &JobSpec) -> Result<()> {
        let root = self.ns.root_handle()?;
        let _lock = root.lock().context("lock memory controller root")?;

        let paths = StepPaths::new(&self.cfg, job);
        match CgroupHandle::load(&self.ns, &paths.step) {
            Ok(step) => {
                if let Err(e) = step.set_param(FORCE_EMPTY, "1") {
                    warn!(sl!(), "force_empty on {} failed: {}", paths.step, e);
                }
            }
            Err(e) => debug!(sl!(), "memory step cgroup already gone: {}", e),
        }

        let report = hierarchy::teardown(&self.ns, &paths);
        if !report.step_removed {
            warn!(sl!(), "memory step cgroup {} not removed", paths.step);
        }
        Ok(())
    }

    /// Inspect OOM indicators at every level of the finished step.
    pub fn check_oom(&self, job: &JobSpec) -> Result<OomReport> {
        let paths = StepPaths::new(&self.cfg, job);
        let mut report = OomReport::default();

        for task in &job.tasks {
            self.level_oom(&paths.task(task.local_id), OomLevel::Task(task.local_id), &mut report);
        }
        self.level_oom(&paths.step, OomLevel::Step, &mut report);
        self.level_oom(&paths.job, OomLevel::Job, &mut report);

        if report.oom_detected() {
            warn!(
                sl!(),
                "job {} step {} hit memory limits: {:?}",
                job.effective_job_id(),
                job.step_id,
                report.events
            );
        }
        Ok(report)
    }

    fn level_oom(&self, rel: &str, level: OomLevel, report: &mut OomReport) {
        let handle = match CgroupHandle::load(&self.ns, rel) {
            Ok(h) => h,
            // already reaped, nothing left to read
            Err(_) => return,
        };

        let fail_cnt = handle.get_u64(FAILCNT).unwrap_or(0);
        let kills = handle
            .get_string(OOM_CONTROL)
            .map(|text| parse_oom_control(&text))
            .unwrap_or(0);

        if fail_cnt > 0 || kills > 0 {
            report.events.push(OomEvent {
                level,
                fail_cnt,
                kills,
            });
        }
    }

    pub fn fini(&mut self) {
        if self.ns.mounted_here() {
            if let Err(e) = self.ns.umount() {
                warn!(sl!(), "failed to unmount memory controller: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * MB;

    fn cfg_with(f: impl FnOnce(&mut CgroupConfig)) -> CgroupConfig {
        let mut cfg = CgroupConfig::default();
        cfg.constrain_ram = true;
        f(&mut cfg);
        cfg
    }

    #[test]
    fn test_derive_plain_request() {
        let cfg = cfg_with(|_| {});
        let limits = MemLimits::derive(&cfg, 128 * MB, 16 * GB).unwrap();
        assert_eq!(limits.ram, 128 * MB);
        assert_eq!(limits.memsw, None);
        assert_eq!(limits.kmem, None);
        assert_eq!(limits.swappiness, None);
    }

    #[test]
    fn test_derive_clamps_oversubscription() {
        let cfg = cfg_with(|_| {});
        let limits = MemLimits::derive(&cfg, 1_000_000_000_000_000_000, 16 * GB).unwrap();
        assert_eq!(limits.ram, 16 * GB);
    }

    #[test]
    fn test_derive_min_floor() {
        let cfg = cfg_with(|_| {});
        let limits = MemLimits::derive(&cfg, 1 * MB, 16 * GB).unwrap();
        assert_eq!(limits.ram, cfg.min_ram_bytes);
    }

    #[test]
    fn test_derive_percent_cap() {
        let cfg = cfg_with(|c| c.max_ram_percent = 50.0);
        let limits = MemLimits::derive(&cfg, 12 * GB, 16 * GB).unwrap();
        assert_eq!(limits.ram, 8 * GB);
    }

    #[test]
    fn test_derive_zero_request_means_node() {
        let cfg = cfg_with(|c| c.max_ram_percent = 75.0);
        let limits = MemLimits::derive(&cfg, 0, 16 * GB).unwrap();
        assert_eq!(limits.ram, 12 * GB);
    }

    #[test]
    fn test_derive_ratio_zero_is_unlimited() {
        let cfg = cfg_with(|c| {
            c.allowed_ram = 0.0;
            c.max_ram_percent = 90.0;
        });
        let limits = MemLimits::derive(&cfg, 64 * MB, 10 * GB).unwrap();
        assert_eq!(limits.ram, 9 * GB);
    }

    #[test]
    fn test_derive_ratio_scales_request() {
        let cfg = cfg_with(|c| c.allowed_ram = 0.5);
        let limits = MemLimits::derive(&cfg, 4 * GB, 16 * GB).unwrap();
        assert_eq!(limits.ram, 2 * GB);
    }

    #[test]
    fn test_derive_swap() {
        let cfg = cfg_with(|c| {
            c.constrain_swap = true;
            c.allowed_swap = 0.5;
        });
        let limits = MemLimits::derive(&cfg, 1 * GB, 16 * GB).unwrap();
        assert_eq!(limits.ram, 1 * GB);
        assert_eq!(limits.memsw, Some(1 * GB + 512 * MB));

        // unlimited swap allowance falls back to the percent cap
        let cfg = cfg_with(|c| {
            c.constrain_swap = true;
            c.max_swap_percent = 25.0;
        });
        let limits = MemLimits::derive(&cfg, 1 * GB, 16 * GB).unwrap();
        assert_eq!(limits.memsw, Some(1 * GB + 4 * GB));
    }

    #[test]
    fn test_derive_kmem() {
        let cfg = cfg_with(|c| {
            c.constrain_kmem = true;
            c.allowed_kmem = 0.25;
        });
        let limits = MemLimits::derive(&cfg, 8 * GB, 16 * GB).unwrap();
        assert_eq!(limits.kmem, Some(2 * GB));
    }

    #[test]
    fn test_derive_unknown_node_fails() {
        let cfg = cfg_with(|_| {});
        assert!(MemLimits::derive(&cfg, 128 * MB, 0).is_err());
    }

    #[test]
    fn test_parse_oom_control() {
        let text = "oom_kill_disable 0\nunder_oom 0\noom_kill 3";
        assert_eq!(parse_oom_control(text), 3);

        // pre-4.13 kernels have no oom_kill field
        let text = "oom_kill_disable 0\nunder_oom 1";
        assert_eq!(parse_oom_control(text), 0);

        assert_eq!(parse_oom_control(""), 0);
    }
}
