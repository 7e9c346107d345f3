// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Task containment for batch job steps, built on cgroup-v1 controllers.
//!
//! Each job step launched on a node is confined to a four-level subtree
//! per controller:
//!
//! ```text
//! <controller-root>/slurm/uid_<UID>/job_<JOBID>/step_<STEPID>/task_<LOCALID>
//! ```
//!
//! [`plugin::CgroupTaskPlugin`] drives the lifecycle: `pre_setuid` builds
//! the subtree and publishes limits as root, `pre_launch` attaches the
//! step processes after the setuid, `post_term` inspects OOM state, and
//! `post_step` tears the subtree down. Controllers are enabled through
//! [`config::CgroupConfig`]; `cpuset`, `memory` and `devices` constrain,
//! while [`accounting`] attaches `cpuacct`/`memory` read-only for per-task
//! usage sampling.

#[macro_use]
extern crate slog;

macro_rules! sl {
    () => {
        slog_scope::logger().new(o!("subsystem" => "stepjail"))
    };
}

pub mod accounting;
pub mod config;
pub mod cpuset;
pub mod devices;
pub mod hierarchy;
pub mod job;
pub mod memory;
pub mod plugin;

pub use config::CgroupConfig;
pub use job::{JobSpec, StepId, TaskSpec};
pub use memory::{OomEvent, OomLevel, OomReport};
pub use plugin::CgroupTaskPlugin;
