// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum XCgroupError {
    #[error("invalid cgroup configuration: {0}")]
    Config(String),

    #[error("failed to mount cgroup namespace at {path}: {source}")]
    Mount {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("cgroup controller {0} is not mounted and automount is disabled")]
    Unavailable(String),

    #[error("{op} {path} failed: {source}")]
    Fs {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cgroup {0} is busy")]
    Busy(PathBuf),

    #[error("no matching cgroup found: {0}")]
    NotFound(String),

    #[error("impossible resource limit: {0}")]
    Limit(String),

    #[error("failed to parse {what} from {path}")]
    Parse { path: PathBuf, what: &'static str },

    #[error("cgroup path too long: {0}")]
    PathTooLong(String),
}

pub type Result<T> = std::result::Result<T, XCgroupError>;

impl XCgroupError {
    /// Whether the caller may keep going after this error. Teardown paths
    /// downgrade recoverable errors to warnings and continue upward.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, XCgroupError::Busy(_))
    }

    pub(crate) fn fs(op: &'static str, path: &Path, err: nix::Error) -> Self {
        XCgroupError::Fs {
            op,
            path: path.to_path_buf(),
            source: io::Error::from_raw_os_error(err as i32),
        }
    }

    pub(crate) fn fs_io(op: &'static str, path: &Path, err: io::Error) -> Self {
        XCgroupError::Fs {
            op,
            path: path.to_path_buf(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable() {
        assert!(XCgroupError::Busy(PathBuf::from("/x")).is_recoverable());
        assert!(!XCgroupError::Config("x".to_string()).is_recoverable());
        assert!(!XCgroupError::fs("mkdir", Path::new("/x"), nix::Error::EACCES).is_recoverable());
    }

    #[test]
    fn test_fs_keeps_errno() {
        let e = XCgroupError::fs("rmdir", Path::new("/x"), nix::Error::EBUSY);
        match e {
            XCgroupError::Fs { op, source, .. } => {
                assert_eq!(op, "rmdir");
                assert_eq!(source.raw_os_error(), Some(libc::EBUSY));
            }
            _ => panic!("wrong variant"),
        }
    }
}
