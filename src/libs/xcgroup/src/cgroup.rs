// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! A handle on one cgroup directory inside a controller namespace.

use std::fs;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{self, FlockArg, OFlag};
use nix::sys::stat::{self, Mode};
use nix::unistd::{self, AccessFlags, Gid, Pid, Uid};
use once_cell::sync::OnceCell;

use crate::error::{Result, XCgroupError};
use crate::fileio::{self, PidWrite};
use crate::namespace::CgroupNamespace;

const CGROUP_PROCS: &str = "cgroup.procs";
const CGROUP_TASKS: &str = "tasks";
const NOTIFY_ON_RELEASE: &str = "notify_on_release";

/// Poll budget for [`CgroupHandle::wait_pid_moved`].
pub const DEFAULT_WAIT_BUDGET: u32 = 5000;

const DELETE_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Which membership file this cgroup accepts PID writes through.
///
/// `cgroup.procs` moves a whole thread group atomically and is preferred;
/// older kernels leave it read-only, in which case attachment falls back to
/// per-thread writes into `tasks`. The probe runs once per handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachFile {
    Procs,
    Tasks,
}

/// One cgroup directory.
///
/// `name` is namespace-relative and always begins with `/`; `path` is the
/// byte-exact concatenation of the namespace mount point and `name`.
#[derive(Debug)]
pub struct CgroupHandle<'ns> {
    ns: &'ns CgroupNamespace,
    name: String,
    path: PathBuf,
    uid: Uid,
    gid: Gid,
    attach_file: OnceCell<AttachFile>,
}

/// Exclusive advisory lock on a cgroup directory, released on drop.
///
/// Taken on the controller root to serialize subtree creation and deletion
/// against concurrent step helpers and release-agent activity.
#[derive(Debug)]
pub struct CgroupLock {
    fd: RawFd,
    path: PathBuf,
}

impl Drop for CgroupLock {
    fn drop(&mut self) {
        if let Err(e) = fcntl::flock(self.fd, FlockArg::Unlock) {
            warn!(sl!(), "failed to unlock {}: {}", self.path.display(), e);
        }
        let _ = unistd::close(self.fd);
    }
}

impl<'ns> CgroupHandle<'ns> {
    /// Build a handle without touching the filesystem.
    pub fn new(ns: &'ns CgroupNamespace, rel_path: &str, uid: Uid, gid: Gid) -> Result<Self> {
        if !rel_path.starts_with('/') {
            return Err(XCgroupError::Config(format!(
                "cgroup name {} must start with '/'",
                rel_path
            )));
        }

        let path = format!("{}{}", ns.mnt_point().display(), rel_path);
        if path.len() >= libc::PATH_MAX as usize {
            return Err(XCgroupError::PathTooLong(path));
        }

        Ok(CgroupHandle {
            ns,
            name: rel_path.to_string(),
            path: PathBuf::from(path),
            uid,
            gid,
            attach_file: OnceCell::new(),
        })
    }

    /// Build a handle for an existing directory, taking ownership from disk.
    pub fn load(ns: &'ns CgroupNamespace, rel_path: &str) -> Result<Self> {
        let mut handle = Self::new(ns, rel_path, Uid::current(), Gid::current())?;
        let st = stat::stat(handle.path.as_path())
            .map_err(|e| XCgroupError::fs("stat", &handle.path, e))?;
        handle.uid = Uid::from_raw(st.st_uid);
        handle.gid = Gid::from_raw(st.st_gid);
        Ok(handle)
    }

    pub fn ns(&self) -> &CgroupNamespace {
        self.ns
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Materialize the directory: mkdir (existing is fine), chown to the
    /// handle's owner, and disable the kernel release agent for it. The
    /// caller owns teardown; an async release agent must never reap leaves
    /// underneath it.
    pub fn instantiate(&self) -> Result<()> {
        match unistd::mkdir(self.path.as_path(), Mode::from_bits_truncate(0o755)) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(e) => return Err(XCgroupError::fs("mkdir", &self.path, e)),
        }

        unistd::chown(self.path.as_path(), Some(self.uid), Some(self.gid))
            .map_err(|e| XCgroupError::fs("chown", &self.path, e))?;

        fileio::write_string(self.path.join(NOTIFY_ON_RELEASE), "0")
    }

    /// Remove the directory. A vanished directory is success; a populated
    /// one reports [`XCgroupError::Busy`] for the caller to decide on.
    pub fn delete(&self) -> Result<()> {
        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                Err(XCgroupError::Busy(self.path.clone()))
            }
            Err(e) => Err(XCgroupError::fs_io("rmdir", &self.path, e)),
        }
    }

    /// Remove with bounded retries, for the window right after processes
    /// were migrated out or pages pushed to the parent.
    pub fn delete_with_retry(&self, retries: u32) -> Result<()> {
        for attempt in 0..retries {
            match self.delete() {
                Err(ref e) if e.is_recoverable() => thread::sleep(DELETE_RETRY_SLEEP),
                other => {
                    if attempt > 0 {
                        info!(
                            sl!(),
                            "removed {} after {} retries",
                            self.path.display(),
                            attempt
                        );
                    }
                    return other;
                }
            }
        }
        self.delete()
    }

    /// Take the exclusive advisory lock on this cgroup directory.
    pub fn lock(&self) -> Result<CgroupLock> {
        let fd = fcntl::open(
            self.path.as_path(),
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| XCgroupError::fs("open", &self.path, e))?;

        if let Err(e) = fcntl::flock(fd, FlockArg::LockExclusive) {
            let _ = unistd::close(fd);
            return Err(XCgroupError::fs("flock", &self.path, e));
        }

        Ok(CgroupLock {
            fd,
            path: self.path.clone(),
        })
    }

    pub fn set_param(&self, name: &str, value: &str) -> Result<()> {
        fileio::write_string(self.path.join(name), value)
    }

    pub fn get_param(&self, name: &str) -> Result<Vec<u8>> {
        fileio::read_blob(self.path.join(name))
    }

    pub fn get_string(&self, name: &str) -> Result<String> {
        fileio::read_string(self.path.join(name))
    }

    pub fn set_u32(&self, name: &str, value: u32) -> Result<()> {
        self.set_param(name, &value.to_string())
    }

    pub fn set_u64(&self, name: &str, value: u64) -> Result<()> {
        self.set_param(name, &value.to_string())
    }

    pub fn get_u32(&self, name: &str) -> Result<u32> {
        let path = self.path.join(name);
        let text = fileio::read_string(&path)?;
        first_token(&text).parse().map_err(|_| XCgroupError::Parse {
            path,
            what: "u32 parameter",
        })
    }

    pub fn get_u64(&self, name: &str) -> Result<u64> {
        let path = self.path.join(name);
        let text = fileio::read_string(&path)?;
        first_token(&text).parse().map_err(|_| XCgroupError::Parse {
            path,
            what: "u64 parameter",
        })
    }

    fn attach_file(&self) -> AttachFile {
        *self.attach_file.get_or_init(|| {
            let procs = self.path.join(CGROUP_PROCS);
            match unistd::access(procs.as_path(), AccessFlags::W_OK) {
                Ok(()) => AttachFile::Procs,
                Err(_) => AttachFile::Tasks,
            }
        })
    }

    /// Attach PIDs to this cgroup, one write per PID. PIDs that exited in
    /// the meantime are skipped.
    pub fn add_pids(&self, pids: &[Pid]) -> Result<()> {
        let file = match self.attach_file() {
            AttachFile::Procs => CGROUP_PROCS,
            AttachFile::Tasks => CGROUP_TASKS,
        };
        let path = self.path.join(file);
        for pid in pids {
            fileio::write_pid(&path, *pid)?;
        }
        Ok(())
    }

    /// Current member PIDs, from `cgroup.procs` when readable.
    pub fn get_pids(&self) -> Result<Vec<Pid>> {
        let values = match fileio::read_u64_list(self.path.join(CGROUP_PROCS)) {
            Ok(v) => v,
            Err(XCgroupError::Fs { op: "open", .. }) => {
                fileio::read_u64_list(self.path.join(CGROUP_TASKS))?
            }
            Err(e) => return Err(e),
        };
        Ok(values
            .into_iter()
            .map(|v| Pid::from_raw(v as libc::pid_t))
            .collect())
    }

    /// Move a whole process into this cgroup.
    ///
    /// With a writable `cgroup.procs` the kernel migrates every thread in
    /// one write. Otherwise threads are enumerated from `/proc/<pid>/task`
    /// and moved one by one; that walk is best-effort, threads spawned
    /// while it runs may be missed.
    pub fn move_process(&self, pid: Pid) -> Result<()> {
        if self.attach_file() == AttachFile::Procs {
            fileio::write_pid(self.path.join(CGROUP_PROCS), pid)?;
            return Ok(());
        }

        let task_dir = PathBuf::from(format!("/proc/{}/task", pid));
        let entries =
            fs::read_dir(&task_dir).map_err(|e| XCgroupError::fs_io("read_dir", &task_dir, e))?;
        let tasks_path = self.path.join(CGROUP_TASKS);
        for entry in entries.flatten() {
            let tid = match entry.file_name().to_string_lossy().parse::<libc::pid_t>() {
                Ok(tid) => tid,
                Err(_) => continue,
            };
            if let Err(e) = fileio::write_pid(&tasks_path, Pid::from_raw(tid)) {
                debug!(sl!(), "could not move tid {} of pid {}: {}", tid, pid, e);
            }
        }
        Ok(())
    }

    /// Poll until `pid` is no longer a member, giving up after `budget`
    /// polls. Returns whether the PID left. Never hangs the step.
    pub fn wait_pid_moved(&self, pid: Pid, budget: u32) -> bool {
        for attempt in 0..budget {
            match self.get_pids() {
                Ok(pids) if !pids.contains(&pid) => return true,
                Ok(_) => {}
                // the cgroup itself went away, nothing left to wait on
                Err(_) => return true,
            }
            if attempt % 100 == 99 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        warn!(
            sl!(),
            "pid {} still in {} after {} polls, giving up",
            pid,
            self.path.display(),
            budget
        );
        false
    }
}

fn first_token(text: &str) -> &str {
    text.split_whitespace().next().unwrap_or("")
}
