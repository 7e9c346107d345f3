// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! A mounted cgroup-v1 controller and its bookkeeping.

use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::{self, MntFlags, MsFlags};
use nix::sys::stat::{self, Mode};
use nix::unistd::Pid;
use scopeguard::defer;

use crate::cgroup::CgroupHandle;
use crate::error::{Result, XCgroupError};

// nix filesystem_type for different libc and architectures
#[cfg(all(target_os = "linux", target_env = "musl"))]
type FsType = libc::c_ulong;
#[cfg(all(
    target_os = "linux",
    not(any(target_env = "musl", target_arch = "s390x"))
))]
type FsType = libc::__fsword_t;
#[cfg(all(target_os = "linux", not(target_env = "musl"), target_arch = "s390x"))]
type FsType = libc::c_uint;

// from linux.git/include/uapi/linux/magic.h
const CGROUP_SUPER_MAGIC: FsType = 0x0027e0eb;

/// The control file probed to decide whether a controller is usable.
const RELEASE_AGENT: &str = "release_agent";

/// One mounted cgroup-v1 controller filesystem.
///
/// `subsystems` is the comma list handed to the kernel at mount time, e.g.
/// `"cpuset"` or `"cpuacct,memory"`. The mount point is always
/// `<root>/<subsystems>`.
#[derive(Debug)]
pub struct CgroupNamespace {
    mnt_point: PathBuf,
    mnt_args: Option<String>,
    subsystems: String,
    /// Program registered as the kernel release agent after a mount.
    /// Individual cgroups still disable notification; the registration
    /// only matters for pre-existing subtrees.
    release_agent: Option<PathBuf>,
    mounted_here: bool,
}

impl CgroupNamespace {
    pub fn new<P: AsRef<Path>>(mnt_root: P, subsystems: &str) -> Result<Self> {
        let mnt_root = mnt_root.as_ref();
        if !mnt_root.is_absolute() {
            return Err(XCgroupError::Config(format!(
                "cgroup mount root {} is not an absolute path",
                mnt_root.display()
            )));
        }
        if subsystems.is_empty() {
            return Err(XCgroupError::Config(
                "empty cgroup subsystem list".to_string(),
            ));
        }

        Ok(CgroupNamespace {
            mnt_point: mnt_root.join(subsystems),
            mnt_args: None,
            subsystems: subsystems.to_string(),
            release_agent: None,
            mounted_here: false,
        })
    }

    /// Extra mount options appended after the subsystem list.
    pub fn with_mount_args(mut self, args: &str) -> Self {
        self.mnt_args = Some(args.to_string());
        self
    }

    pub fn with_release_agent<P: AsRef<Path>>(mut self, program: P) -> Self {
        self.release_agent = Some(program.as_ref().to_path_buf());
        self
    }

    pub fn mnt_point(&self) -> &Path {
        &self.mnt_point
    }

    pub fn subsystems(&self) -> &str {
        &self.subsystems
    }

    /// True iff this process performed the mount. Shutdown only unmounts
    /// what it mounted itself.
    pub fn mounted_here(&self) -> bool {
        self.mounted_here
    }

    /// A handle on the controller root. This is where the advisory lock
    /// serializing subtree creation and deletion lives.
    pub fn root_handle(&self) -> Result<CgroupHandle> {
        CgroupHandle::load(self, "/")
    }

    /// A controller counts as available once its root can serve the
    /// `release_agent` control file.
    pub fn available(&self) -> bool {
        self.root_handle()
            .and_then(|root| root.get_param(RELEASE_AGENT))
            .is_ok()
    }

    /// Make the controller usable: nothing to do if it is already mounted,
    /// mount it when allowed, fail otherwise.
    pub fn ensure(&mut self, automount: bool) -> Result<()> {
        if self.available() {
            return Ok(());
        }
        if !automount {
            return Err(XCgroupError::Unavailable(self.subsystems.clone()));
        }
        self.mount()
    }

    /// Mount the controller at `mnt_point`, creating missing directories
    /// with mode 0755.
    pub fn mount(&mut self) -> Result<()> {
        // group/other must not gain write on anything created here
        let old_umask = stat::umask(Mode::from_bits_truncate(0o022));
        defer!({
            stat::umask(old_umask);
        });

        fs::create_dir_all(&self.mnt_point)
            .map_err(|e| XCgroupError::fs_io("mkdir", &self.mnt_point, e))?;

        let mut options = self.subsystems.clone();
        if let Some(args) = &self.mnt_args {
            options.push(',');
            options.push_str(args);
        }

        info!(
            sl!(),
            "mounting cgroup namespace {} at {}",
            self.subsystems,
            self.mnt_point.display()
        );
        mount::mount(
            Some("cgroup"),
            self.mnt_point.as_path(),
            Some("cgroup"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            Some(options.as_str()),
        )
        .map_err(|e| XCgroupError::Mount {
            path: self.mnt_point.clone(),
            source: e,
        })?;
        self.mounted_here = true;

        if let Some(agent) = &self.release_agent {
            crate::fileio::write_string(
                self.mnt_point.join(RELEASE_AGENT),
                &agent.display().to_string(),
            )?;
        }
        Ok(())
    }

    pub fn umount(&mut self) -> Result<()> {
        mount::umount2(self.mnt_point.as_path(), MntFlags::empty()).map_err(|e| {
            XCgroupError::fs(
                "umount",
                &self.mnt_point,
                e,
            )
        })?;
        self.mounted_here = false;
        Ok(())
    }

    /// Cheap probe: is `mnt_point` really a cgroup-type mount?
    pub fn is_cgroup_mount(&self) -> bool {
        match nix::sys::statfs::statfs(self.mnt_point.as_path()) {
            Ok(st) => st.filesystem_type().0 == CGROUP_SUPER_MAGIC,
            Err(_) => false,
        }
    }

    /// Locate the cgroup `pid` currently belongs to within this namespace.
    pub fn find_by_pid(&self, pid: Pid) -> Result<CgroupHandle> {
        let proc_path = PathBuf::from(format!("/proc/{}/cgroup", pid));
        let listing =
            fs::read_to_string(&proc_path).map_err(|e| XCgroupError::fs_io("read", &proc_path, e))?;

        let rel_path = self.match_cgroup_line(&listing).ok_or_else(|| {
            XCgroupError::NotFound(format!(
                "pid {} has no cgroup in namespace {}",
                pid, self.subsystems
            ))
        })?;
        CgroupHandle::load(self, &rel_path)
    }

    // Each /proc/<pid>/cgroup line is "<id>:<subsystems>:<path>". The
    // subsystem field must match this namespace exactly, as a set.
    fn match_cgroup_line(&self, listing: &str) -> Option<String> {
        for line in listing.lines() {
            let mut fields = line.splitn(3, ':');
            let _id = fields.next()?;
            let subsys = fields.next()?;
            let path = fields.next()?;
            if self.subsystems_match(subsys) {
                return Some(path.to_string());
            }
        }
        None
    }

    fn subsystems_match(&self, field: &str) -> bool {
        let mut ours: Vec<&str> = self.subsystems.split(',').collect();
        let mut theirs: Vec<&str> = field.split(',').collect();
        ours.sort_unstable();
        theirs.sort_unstable();
        ours == theirs
    }
}
