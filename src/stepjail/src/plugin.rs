// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The lifecycle facade the workload manager drives.
//!
//! One plugin instance lives in each step-helper process. Hooks run in
//! order: `pre_setuid` as root, `pre_launch` after the setuid, `post_term`
//! when the tasks finished, `post_step` when the whole step is done. A
//! failing `pre_setuid` aborts the step before it starts; `post_step`
//! downgrades everything recoverable and keeps cleaning.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use nix::unistd::Pid;

use crate::accounting::AcctGather;
use crate::config::CgroupConfig;
use crate::cpuset::CpusetCgroup;
use crate::devices::DevicesCgroup;
use crate::job::{JobSpec, StepId};
use crate::memory::{MemoryCgroup, OomReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct StepKey {
    job_id: u32,
    step_id: StepId,
}

impl StepKey {
    fn of(job: &JobSpec) -> Self {
        StepKey {
            job_id: job.effective_job_id(),
            step_id: job.step_id,
        }
    }
}

/// Lifecycle position of one (job, step). Absence means the step was
/// never seen. `Gone` is terminal: a torn-down step cannot come back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StepState {
    Ready,
    Live,
    Gone,
}

pub struct CgroupTaskPlugin {
    cfg: Arc<CgroupConfig>,
    cpuset: Option<CpusetCgroup>,
    memory: Option<MemoryCgroup>,
    devices: Option<DevicesCgroup>,
    acct: Option<AcctGather>,
    states: HashMap<StepKey, StepState>,
}

impl CgroupTaskPlugin {
    /// Bring up every controller an enabled constraint needs. Any failure
    /// here must make the caller abort the step.
    pub fn init(cfg: Arc<CgroupConfig>) -> Result<Self> {
        let cpuset = if cfg.constrain_cores {
            Some(CpusetCgroup::init(cfg.clone()).context("init cpuset controller")?)
        } else {
            None
        };

        let memory = if cfg.constrain_ram || cfg.constrain_swap || cfg.constrain_kmem {
            Some(MemoryCgroup::init(cfg.clone()).context("init memory controller")?)
        } else {
            None
        };

        let devices = if cfg.constrain_devices {
            Some(DevicesCgroup::init(cfg.clone()).context("init devices controller")?)
        } else {
            None
        };

        Ok(CgroupTaskPlugin {
            cfg,
            cpuset,
            memory,
            devices,
            acct: None,
            states: HashMap::new(),
        })
    }

    /// Additionally attach the accounting controllers.
    pub fn with_accounting(mut self) -> Result<Self> {
        self.acct = Some(AcctGather::init(self.cfg.clone()).context("init accounting")?);
        Ok(self)
    }

    pub fn config(&self) -> &CgroupConfig {
        &self.cfg
    }

    /// Build the step's subtrees and publish limits. Root only. cpuset
    /// goes first so allocation errors surface before any memory writes.
    pub fn pre_setuid(&mut self, job: &JobSpec) -> Result<()> {
        let key = StepKey::of(job);
        match self.states.get(&key) {
            Some(StepState::Gone) => bail!(
                "step {} of job {} was already torn down",
                key.step_id,
                key.job_id
            ),
            // retried hook, the work is already done
            Some(_) => return Ok(()),
            None => {}
        }

        if let Some(cpuset) = &self.cpuset {
            cpuset.pre_setuid(job).context("cpuset pre_setuid")?;
        }
        if let Some(memory) = &self.memory {
            memory.pre_setuid(job).context("memory pre_setuid")?;
        }
        if let Some(devices) = &self.devices {
            devices.pre_setuid(job).context("devices pre_setuid")?;
        }
        if let Some(acct) = &self.acct {
            acct.pre_setuid(job).context("accounting pre_setuid")?;
        }

        self.states.insert(key, StepState::Ready);
        Ok(())
    }

    /// Attach the helper (and with task affinity, each task) to the step
    /// cgroups. Runs after the setuid.
    pub fn pre_launch(&mut self, job: &JobSpec) -> Result<()> {
        let key = StepKey::of(job);
        match self.states.get(&key) {
            Some(StepState::Ready) => {}
            Some(StepState::Live) => return Ok(()),
            Some(StepState::Gone) => bail!(
                "step {} of job {} was already torn down",
                key.step_id,
                key.job_id
            ),
            None => bail!(
                "pre_launch for unknown step {} of job {}",
                key.step_id,
                key.job_id
            ),
        }

        if let Some(cpuset) = &self.cpuset {
            cpuset.pre_launch(job).context("cpuset pre_launch")?;
        }
        if let Some(memory) = &self.memory {
            memory.pre_launch(job).context("memory pre_launch")?;
        }
        if let Some(devices) = &self.devices {
            devices.pre_launch(job).context("devices pre_launch")?;
        }
        if let Some(acct) = &mut self.acct {
            acct.pre_launch(job).context("accounting pre_launch")?;
        }

        self.states.insert(key, StepState::Live);
        Ok(())
    }

    /// Task-granularity hook. Containment itself has nothing to do here;
    /// it is where OOM state is inspected while the cgroups still exist.
    pub fn post_term(&mut self, job: &JobSpec) -> Result<Option<OomReport>> {
        match &self.memory {
            Some(memory) => memory.check_oom(job).map(Some),
            None => Ok(None),
        }
    }

    /// Tear down the step's subtrees. Cleanup always runs to completion;
    /// only a lifecycle violation is an error.
    pub fn post_step(&mut self, job: &JobSpec) -> Result<()> {
        let key = StepKey::of(job);
        match self.states.get(&key) {
            Some(StepState::Ready) | Some(StepState::Live) => {}
            Some(StepState::Gone) => bail!(
                "step {} of job {} was already torn down",
                key.step_id,
                key.job_id
            ),
            None => bail!(
                "post_step for unknown step {} of job {}",
                key.step_id,
                key.job_id
            ),
        }

        if let Some(devices) = &self.devices {
            if let Err(e) = devices.post_step(job) {
                warn!(sl!(), "devices teardown incomplete: {:#}", e);
            }
        }
        if let Some(memory) = &self.memory {
            if let Err(e) = memory.post_step(job) {
                warn!(sl!(), "memory teardown incomplete: {:#}", e);
            }
        }
        if let Some(cpuset) = &self.cpuset {
            if let Err(e) = cpuset.post_step(job) {
                warn!(sl!(), "cpuset teardown incomplete: {:#}", e);
            }
        }
        if let Some(acct) = &mut self.acct {
            acct.post_step(job);
        }

        self.states.insert(key, StepState::Gone);
        Ok(())
    }

    /// Adopt an extra PID into the live step's cgroups.
    pub fn add_pid(&self, job: &JobSpec, pid: Pid) -> Result<()> {
        let key = StepKey::of(job);
        if self.states.get(&key).copied() != Some(StepState::Live) {
            bail!(
                "cannot adopt pid {} into step {} of job {}: step is not live",
                pid,
                key.step_id,
                key.job_id
            );
        }

        if let Some(cpuset) = &self.cpuset {
            cpuset.add_pid(job, pid).context("cpuset add_pid")?;
        }
        if let Some(memory) = &self.memory {
            memory.add_pid(job, pid).context("memory add_pid")?;
        }
        if let Some(devices) = &self.devices {
            devices.add_pid(job, pid).context("devices add_pid")?;
        }
        Ok(())
    }

    /// Sample a task's accounting leaf, when accounting is attached.
    pub fn sample_task(&self, job: &JobSpec, local_id: u32) -> Result<Option<crate::accounting::TaskUsage>> {
        match &self.acct {
            Some(acct) => acct.sample(job, local_id).map(Some),
            None => Ok(None),
        }
    }

    /// Release the controllers, unmounting only what this process mounted.
    pub fn fini(mut self) -> Result<()> {
        if let Some(mut cpuset) = self.cpuset.take() {
            cpuset.fini();
        }
        if let Some(mut memory) = self.memory.take() {
            memory.fini();
        }
        if let Some(mut devices) = self.devices.take() {
            devices.fini();
        }
        if let Some(mut acct) = self.acct.take() {
            acct.fini();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{StepId, TaskSpec};
    use nix::unistd::{Gid, Uid};

    fn bare_plugin() -> CgroupTaskPlugin {
        // no constraints enabled: the lifecycle machine alone
        CgroupTaskPlugin::init(Arc::new(CgroupConfig::default())).unwrap()
    }

    fn test_job(step_id: StepId) -> JobSpec {
        JobSpec {
            job_id: 42,
            pack_job_id: None,
            step_id,
            uid: Uid::current(),
            gid: Gid::current(),
            job_mem_bytes: 0,
            node_mem_bytes: 0,
            cpus: None,
            mems: None,
            tasks: vec![TaskSpec {
                pid: Pid::from_raw(9999),
                local_id: 0,
            }],
        }
    }

    #[test]
    fn test_lifecycle_order() {
        let mut plugin = bare_plugin();
        let job = test_job(StepId::Step(0));

        plugin.pre_setuid(&job).unwrap();
        plugin.pre_launch(&job).unwrap();
        assert!(plugin.post_term(&job).unwrap().is_none());
        plugin.post_step(&job).unwrap();
    }

    #[test]
    fn test_retries_are_idempotent() {
        let mut plugin = bare_plugin();
        let job = test_job(StepId::Step(0));

        plugin.pre_setuid(&job).unwrap();
        plugin.pre_setuid(&job).unwrap();
        plugin.pre_launch(&job).unwrap();
        plugin.pre_launch(&job).unwrap();
        plugin.post_step(&job).unwrap();
    }

    #[test]
    fn test_gone_is_terminal() {
        let mut plugin = bare_plugin();
        let job = test_job(StepId::Step(0));

        plugin.pre_setuid(&job).unwrap();
        plugin.post_step(&job).unwrap();

        assert!(plugin.pre_setuid(&job).is_err());
        assert!(plugin.pre_launch(&job).is_err());
        assert!(plugin.post_step(&job).is_err());
    }

    #[test]
    fn test_launch_requires_setup() {
        let mut plugin = bare_plugin();
        let job = test_job(StepId::Step(0));

        assert!(plugin.pre_launch(&job).is_err());
        assert!(plugin.post_step(&job).is_err());
    }

    #[test]
    fn test_skip_launch_straight_to_teardown() {
        let mut plugin = bare_plugin();
        let job = test_job(StepId::Batch);

        plugin.pre_setuid(&job).unwrap();
        // the step never launched
        plugin.post_step(&job).unwrap();
    }

    #[test]
    fn test_steps_are_independent() {
        let mut plugin = bare_plugin();
        let step0 = test_job(StepId::Step(0));
        let step1 = test_job(StepId::Step(1));

        plugin.pre_setuid(&step0).unwrap();
        plugin.pre_setuid(&step1).unwrap();
        plugin.post_step(&step0).unwrap();

        // step 1 is untouched by step 0's teardown
        plugin.pre_launch(&step1).unwrap();
        plugin.post_step(&step1).unwrap();
    }

    #[test]
    fn test_add_pid_needs_live_step() {
        let mut plugin = bare_plugin();
        let job = test_job(StepId::Step(0));

        assert!(plugin.add_pid(&job, Pid::from_raw(1234)).is_err());
        plugin.pre_setuid(&job).unwrap();
        assert!(plugin.add_pid(&job, Pid::from_raw(1234)).is_err());
        plugin.pre_launch(&job).unwrap();
        plugin.add_pid(&job, Pid::from_raw(1234)).unwrap();
    }

    #[test]
    fn test_fini_with_nothing_enabled() {
        bare_plugin().fini().unwrap();
    }
}
