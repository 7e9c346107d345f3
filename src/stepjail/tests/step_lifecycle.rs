// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Step lifecycle tests.
//!
//! The scratch-tree tests run anywhere: the containment layer only needs a
//! directory tree that behaves like a controller mount, so a tempdir with a
//! `release_agent` file stands in for one. The real-cgroupfs test needs
//! root and a v1 memory controller and skips itself otherwise.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use nix::unistd::{getpid, Gid, Uid};
use serial_test::serial;

use stepjail::config::CgroupConfig;
use stepjail::job::{JobSpec, StepId, TaskSpec};
use stepjail::plugin::CgroupTaskPlugin;
use xcgroup::{fileio, CgroupNamespace};

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

fn scratch_config(tmpdir: &Path, subsystems: &[&str]) -> Arc<CgroupConfig> {
    for subsystem in subsystems {
        let mnt = tmpdir.join(subsystem);
        fs::create_dir_all(&mnt).unwrap();
        fileio::write_string(mnt.join("release_agent"), "").unwrap();
    }

    let mut cfg = CgroupConfig::default();
    cfg.mountpoint = tmpdir.to_path_buf();
    Arc::new(cfg)
}

fn test_job(step_id: StepId) -> JobSpec {
    JobSpec {
        job_id: 42,
        pack_job_id: None,
        step_id,
        uid: Uid::current(),
        gid: Gid::current(),
        job_mem_bytes: 128 * MB,
        node_mem_bytes: 16 * GB,
        cpus: None,
        mems: None,
        tasks: vec![TaskSpec {
            pid: getpid(),
            local_id: 0,
        }],
    }
}

#[test]
fn test_step_life_on_scratch_tree() {
    let tmpdir = tempfile::tempdir().unwrap();
    let mut cfg = (*scratch_config(tmpdir.path(), &["cpuset", "memory"])).clone();
    cfg.constrain_cores = true;
    cfg.constrain_ram = true;

    let mut plugin = CgroupTaskPlugin::init(Arc::new(cfg)).unwrap();
    let job = test_job(StepId::Step(0));

    plugin.pre_setuid(&job).unwrap();

    let uid = Uid::current();
    let step_dir = tmpdir
        .path()
        .join(format!("memory/slurm/uid_{}/job_42/step_0", uid));
    assert!(step_dir.is_dir());
    assert!(tmpdir
        .path()
        .join(format!("cpuset/slurm/uid_{}/job_42/step_0", uid))
        .is_dir());

    // the derived limit lands at job and step level
    assert_eq!(
        fileio::read_string(step_dir.join("memory.limit_in_bytes")).unwrap(),
        (128 * MB).to_string()
    );
    assert_eq!(
        fileio::read_string(
            tmpdir
                .path()
                .join(format!("memory/slurm/uid_{}/job_42", uid))
                .join("memory.limit_in_bytes")
        )
        .unwrap(),
        (128 * MB).to_string()
    );

    plugin.pre_launch(&job).unwrap();
    // no writable cgroup.procs on a scratch tree, so the helper's threads
    // land in the tasks file
    let members = fileio::read_u64_list(step_dir.join("tasks")).unwrap();
    assert!(members.contains(&(getpid().as_raw() as u64)));

    let report = plugin.post_term(&job).unwrap().unwrap();
    assert!(!report.oom_detected());

    plugin.post_step(&job).unwrap();
    assert_eq!(
        fileio::read_string(step_dir.join("memory.force_empty")).unwrap(),
        "1"
    );

    // the step is gone for good
    assert!(plugin.post_step(&job).is_err());
    assert!(plugin.pre_setuid(&job).is_err());

    plugin.fini().unwrap();
}

#[test]
fn test_init_fails_when_controller_absent() {
    let tmpdir = tempfile::tempdir().unwrap();

    // mountpoint exists, controller does not, automount is off
    let mut cfg = CgroupConfig::default();
    cfg.mountpoint = tmpdir.path().to_path_buf();
    cfg.constrain_cores = true;

    assert!(CgroupTaskPlugin::init(Arc::new(cfg)).is_err());

    // no directories may have been created
    assert!(fs::read_dir(tmpdir.path()).unwrap().next().is_none());
}

#[test]
fn test_oom_report_reads_counters() {
    let tmpdir = tempfile::tempdir().unwrap();
    let mut cfg = (*scratch_config(tmpdir.path(), &["memory"])).clone();
    cfg.constrain_ram = true;

    let mut plugin = CgroupTaskPlugin::init(Arc::new(cfg)).unwrap();
    let job = test_job(StepId::Step(3));
    plugin.pre_setuid(&job).unwrap();

    let step_dir = tmpdir
        .path()
        .join(format!("memory/slurm/uid_{}/job_42/step_3", Uid::current()));
    fileio::write_string(step_dir.join("memory.failcnt"), "7").unwrap();
    fileio::write_string(
        step_dir.join("memory.oom_control"),
        "oom_kill_disable 0\nunder_oom 0\noom_kill 1\n",
    )
    .unwrap();

    let report = plugin.post_term(&job).unwrap().unwrap();
    assert!(report.oom_detected());
    assert_eq!(report.events.len(), 1);
    assert_eq!(report.events[0].fail_cnt, 7);
    assert_eq!(report.events[0].kills, 1);
}

#[test]
#[serial]
fn test_single_step_life_on_real_cgroupfs() {
    // test need root permission and a mounted v1 memory controller
    if !Uid::current().is_root() {
        println!("test need root permission");
        return;
    }
    let memory_root = Path::new("/sys/fs/cgroup/memory");
    if !memory_root.join("release_agent").exists() {
        println!("cgroup-v1 memory controller not mounted");
        return;
    }

    let mut cfg = CgroupConfig::default();
    cfg.constrain_ram = true;
    // keep clear of any production containment tree
    cfg.prepend = format!("/stepjail_test_{}", getpid());
    let cfg = Arc::new(cfg);

    let mut job = test_job(StepId::Step(0));
    job.node_mem_bytes = 0; // let the plugin read the node total

    let mut plugin = CgroupTaskPlugin::init(cfg.clone()).unwrap();
    plugin.pre_setuid(&job).unwrap();

    let step_dir = memory_root.join(format!(
        "{}/uid_{}/job_42/step_0",
        cfg.prepend.trim_start_matches('/'),
        Uid::current()
    ));
    assert!(step_dir.is_dir());
    assert_eq!(
        fileio::read_string(step_dir.join("memory.limit_in_bytes")).unwrap(),
        (128 * MB).to_string()
    );

    plugin.pre_launch(&job).unwrap();
    let ns = CgroupNamespace::new("/sys/fs/cgroup", "memory").unwrap();
    let step = ns
        .find_by_pid(getpid())
        .expect("helper must be inside the step cgroup");
    assert!(step.get_pids().unwrap().contains(&getpid()));

    // a second step pins the shared job level
    let mut sibling = test_job(StepId::Step(1));
    sibling.node_mem_bytes = 0;
    plugin.pre_setuid(&sibling).unwrap();

    // leave the step cgroup so teardown can remove it
    let root = ns.root_handle().unwrap();
    root.move_process(getpid()).unwrap();
    root.wait_pid_moved(getpid(), xcgroup::DEFAULT_WAIT_BUDGET);

    plugin.post_step(&job).unwrap();
    assert!(!step_dir.exists());
    let job_dir = step_dir.parent().unwrap();
    assert!(job_dir.exists(), "sibling step must keep the job level");

    plugin.post_step(&sibling).unwrap();
    assert!(!job_dir.exists());

    // the uid level went with the last step; the scratch root stays
    assert!(!job_dir.parent().unwrap().exists());
    assert!(memory_root
        .join(cfg.prepend.trim_start_matches('/'))
        .is_dir());

    plugin.fini().unwrap();
    let _ = fs::remove_dir(memory_root.join(cfg.prepend.trim_start_matches('/')));
}
