// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Typed I/O against cgroup control files.
//!
//! Control files are pseudo-files: they do not report a stable size, reads
//! must stream until EOF, and every syscall may be interrupted. All helpers
//! here loop on `EINTR` and perform whole-buffer single-shot writes.

use std::os::unix::io::RawFd;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{self, Pid};
use scopeguard::defer;

use crate::error::{Result, XCgroupError};

const READ_CHUNK: usize = 4096;

/// Outcome of attaching one PID to a membership file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PidWrite {
    Attached,
    /// The kernel returned `ESRCH`: the process exited before the write.
    /// Not an error, the PID simply no longer needs containment.
    Vanished,
}

fn retry_eintr<T, F: FnMut() -> nix::Result<T>>(mut f: F) -> nix::Result<T> {
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

fn open_fd(path: &Path, flags: OFlag, mode: Mode) -> Result<RawFd> {
    retry_eintr(|| fcntl::open(path, flags | OFlag::O_CLOEXEC, mode))
        .map_err(|e| XCgroupError::fs("open", path, e))
}

/// Read a whole control file into memory.
pub fn read_blob<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let fd = open_fd(path, OFlag::O_RDONLY, Mode::empty())?;
    defer!({
        let _ = unistd::close(fd);
    });

    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = retry_eintr(|| unistd::read(fd, &mut chunk))
            .map_err(|e| XCgroupError::fs("read", path, e))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(buf)
}

/// Read a control file as trimmed UTF-8 text.
pub fn read_string<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let blob = read_blob(path)?;
    let s = String::from_utf8(blob).map_err(|_| XCgroupError::Parse {
        path: path.to_path_buf(),
        what: "utf-8 text",
    })?;
    Ok(s.trim().to_string())
}

fn read_list<T: std::str::FromStr, P: AsRef<Path>>(path: P, what: &'static str) -> Result<Vec<T>> {
    let path = path.as_ref();
    let blob = read_blob(path)?;
    let text = String::from_utf8_lossy(&blob);

    let mut values = Vec::new();
    for line in text.lines() {
        let token = line.trim();
        if token.is_empty() {
            continue;
        }
        let v = token.parse::<T>().map_err(|_| XCgroupError::Parse {
            path: path.to_path_buf(),
            what,
        })?;
        values.push(v);
    }
    Ok(values)
}

/// Read a newline-separated list of unsigned 32-bit values.
pub fn read_u32_list<P: AsRef<Path>>(path: P) -> Result<Vec<u32>> {
    read_list(path, "u32 list")
}

/// Read a newline-separated list of unsigned 64-bit values.
pub fn read_u64_list<P: AsRef<Path>>(path: P) -> Result<Vec<u64>> {
    read_list(path, "u64 list")
}

/// Write `data` to a control file in one shot. A short write is an error.
pub fn write_blob<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let fd = open_fd(
        path,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        Mode::from_bits_truncate(0o644),
    )?;
    defer!({
        let _ = unistd::close(fd);
    });

    let n = retry_eintr(|| unistd::write(fd, data))
        .map_err(|e| XCgroupError::fs("write", path, e))?;
    if n != data.len() {
        return Err(XCgroupError::fs_io(
            "write",
            path,
            std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", n, data.len()),
            ),
        ));
    }
    Ok(())
}

pub fn write_string<P: AsRef<Path>>(path: P, value: &str) -> Result<()> {
    write_blob(path, value.as_bytes())
}

pub fn write_u64<P: AsRef<Path>>(path: P, value: u64) -> Result<()> {
    write_blob(path, value.to_string().as_bytes())
}

fn render_list<T: ToString>(values: &[T]) -> Vec<u8> {
    let mut buf = String::new();
    for v in values {
        buf.push_str(&v.to_string());
        buf.push('\n');
    }
    buf.into_bytes()
}

/// Write one decimal token per line, trailing newline, single write.
pub fn write_u32_list<P: AsRef<Path>>(path: P, values: &[u32]) -> Result<()> {
    write_blob(path, &render_list(values))
}

pub fn write_u64_list<P: AsRef<Path>>(path: P, values: &[u64]) -> Result<()> {
    write_blob(path, &render_list(values))
}

/// Attach one PID to a membership file (`cgroup.procs` or `tasks`).
///
/// Membership files take one PID per write; the append flag keeps this
/// honest against regular files as well. `ESRCH` maps to
/// [`PidWrite::Vanished`].
pub fn write_pid<P: AsRef<Path>>(path: P, pid: Pid) -> Result<PidWrite> {
    let path = path.as_ref();
    let fd = open_fd(
        path,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
        Mode::from_bits_truncate(0o644),
    )?;
    defer!({
        let _ = unistd::close(fd);
    });

    let data = format!("{}\n", pid);
    match retry_eintr(|| unistd::write(fd, data.as_bytes())) {
        Ok(n) if n == data.len() => Ok(PidWrite::Attached),
        Ok(n) => Err(XCgroupError::fs_io(
            "write",
            path,
            std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", n, data.len()),
            ),
        )),
        Err(Errno::ESRCH) => {
            debug!(sl!(), "pid {} exited before attach to {:?}", pid, path);
            Ok(PidWrite::Vanished)
        }
        Err(e) => Err(XCgroupError::fs("write", path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_roundtrip() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("blob");

        write_blob(&path, b"hello\n").unwrap();
        assert_eq!(read_blob(&path).unwrap(), b"hello\n");

        // a rewrite replaces the whole file
        write_blob(&path, b"x").unwrap();
        assert_eq!(read_blob(&path).unwrap(), b"x");
    }

    #[test]
    fn test_read_missing_file() {
        let tmpdir = tempfile::tempdir().unwrap();
        let err = read_blob(tmpdir.path().join("absent")).unwrap_err();
        match err {
            XCgroupError::Fs { op, source, .. } => {
                assert_eq!(op, "open");
                assert_eq!(source.raw_os_error(), Some(libc::ENOENT));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_string_trimmed() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("s");
        write_string(&path, "  42\n").unwrap();
        assert_eq!(read_string(&path).unwrap(), "42");

        write_u64(&path, u64::MAX).unwrap();
        assert_eq!(read_string(&path).unwrap(), u64::MAX.to_string());
    }

    #[test]
    fn test_list_roundtrip() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("list");

        write_u32_list(&path, &[1, 22, 333]).unwrap();
        assert_eq!(read_blob(&path).unwrap(), b"1\n22\n333\n");
        assert_eq!(read_u32_list(&path).unwrap(), vec![1, 22, 333]);
        assert_eq!(read_u64_list(&path).unwrap(), vec![1, 22, 333]);

        write_u64_list(&path, &[]).unwrap();
        assert!(read_u64_list(&path).unwrap().is_empty());
    }

    #[test]
    fn test_list_blank_lines_skipped() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("list");
        write_blob(&path, b"1\n\n2\n").unwrap();
        assert_eq!(read_u64_list(&path).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_list_parse_error() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("list");
        write_blob(&path, b"1\nnope\n").unwrap();
        assert!(matches!(
            read_u32_list(&path),
            Err(XCgroupError::Parse { .. })
        ));
    }

    #[test]
    fn test_write_pid_appends() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("tasks");

        assert_eq!(
            write_pid(&path, Pid::from_raw(100)).unwrap(),
            PidWrite::Attached
        );
        assert_eq!(
            write_pid(&path, Pid::from_raw(200)).unwrap(),
            PidWrite::Attached
        );
        assert_eq!(read_u64_list(&path).unwrap(), vec![100, 200]);
    }
}
