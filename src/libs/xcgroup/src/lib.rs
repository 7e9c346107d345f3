// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Management of cgroup-v1 controller hierarchies.
//!
//! A [`CgroupNamespace`] represents one mounted controller filesystem
//! (`cpuset`, `memory`, `cpuacct,memory`, ...): it can probe availability,
//! mount and unmount the controller, and resolve the cgroup a PID currently
//! lives in. A [`CgroupHandle`] is one directory inside such a namespace and
//! carries the create/delete/chown, parameter read/write and PID attachment
//! operations. The [`fileio`] module holds the typed pseudo-file primitives
//! everything else is built on.
//!
//! This crate is mechanism only. Which cgroups exist, what limits they get
//! and when they are torn down is decided by the layer above.

#[macro_use]
extern crate slog;

macro_rules! sl {
    () => {
        slog_scope::logger().new(o!("subsystem" => "xcgroup"))
    };
}

pub mod cgroup;
pub mod error;
pub mod fileio;
pub mod namespace;

pub use cgroup::{AttachFile, CgroupHandle, CgroupLock, DEFAULT_WAIT_BUDGET};
pub use error::{Result, XCgroupError};
pub use fileio::PidWrite;
pub use namespace::CgroupNamespace;
