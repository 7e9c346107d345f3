// Copyright (c) 2024-2026 The Stepjail Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Containment configuration.
//!
//! Loaded once per process hierarchy from a line-oriented `key=value` file
//! (`#` starts a comment, booleans are `yes`/`no`, unknown keys are fatal).
//! The active configuration is an immutable snapshot behind a process-wide
//! lock; `reconfigure` parses a fresh snapshot and swaps it in atomically,
//! and every operation samples the snapshot once at entry.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use xcgroup::XCgroupError;

const MB: u64 = 1024 * 1024;

/// Floor for the RAM limit. Anything lower OOM-kills the step helper
/// before the user code even starts.
pub const MIN_RAM_FLOOR: u64 = 30 * MB;

#[derive(Debug, Clone)]
pub struct CgroupConfig {
    pub automount: bool,
    pub mountpoint: PathBuf,
    /// Scratch subtree below each controller root, always absolute.
    pub prepend: String,

    pub constrain_cores: bool,
    pub task_affinity: bool,
    pub constrain_ram: bool,
    pub constrain_swap: bool,
    pub constrain_kmem: bool,
    pub constrain_devices: bool,

    /// Ratio applied to the job's memory request; 0 means unlimited.
    pub allowed_ram: f64,
    pub max_ram_percent: f64,
    pub min_ram_bytes: u64,

    pub allowed_swap: f64,
    pub max_swap_percent: f64,
    pub swappiness: Option<u64>,

    pub allowed_kmem: f64,
    pub max_kmem_percent: f64,
    pub min_kmem_bytes: u64,

    pub allowed_devices_file: PathBuf,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        CgroupConfig {
            automount: false,
            mountpoint: PathBuf::from("/sys/fs/cgroup"),
            prepend: "/slurm".to_string(),
            constrain_cores: false,
            task_affinity: false,
            constrain_ram: false,
            constrain_swap: false,
            constrain_kmem: false,
            constrain_devices: false,
            allowed_ram: 1.0,
            max_ram_percent: 100.0,
            min_ram_bytes: MIN_RAM_FLOOR,
            allowed_swap: 0.0,
            max_swap_percent: 100.0,
            swappiness: None,
            allowed_kmem: 0.0,
            max_kmem_percent: 100.0,
            min_kmem_bytes: MIN_RAM_FLOOR,
            allowed_devices_file: PathBuf::from("/etc/stepjail/allowed_devices.conf"),
        }
    }
}

impl CgroupConfig {
    pub fn parse(content: &str) -> Result<Self> {
        let mut cfg = CgroupConfig::default();

        for (index, raw) in content.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let lineno = index + 1;

            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), v.trim()),
                None => bail!(XCgroupError::Config(format!(
                    "line {}: expected key=value, got '{}'",
                    lineno, line
                ))),
            };

            match key.as_str() {
                "cgroup_automount" => cfg.automount = parse_bool(&key, value, lineno)?,
                "cgroup_mountpoint" => cfg.mountpoint = PathBuf::from(value),
                "cgroup_prepend" => cfg.prepend = value.to_string(),
                "constrain_cores" => cfg.constrain_cores = parse_bool(&key, value, lineno)?,
                "task_affinity" => cfg.task_affinity = parse_bool(&key, value, lineno)?,
                "constrain_ram_space" => cfg.constrain_ram = parse_bool(&key, value, lineno)?,
                "constrain_swap_space" => cfg.constrain_swap = parse_bool(&key, value, lineno)?,
                "constrain_kmem_space" => cfg.constrain_kmem = parse_bool(&key, value, lineno)?,
                "constrain_devices" => cfg.constrain_devices = parse_bool(&key, value, lineno)?,
                "allowed_ram_space" => cfg.allowed_ram = parse_ratio(&key, value, lineno)?,
                "max_ram_percent" => cfg.max_ram_percent = parse_percent(&key, value, lineno)?,
                "min_ram_space" => cfg.min_ram_bytes = parse_mb(&key, value, lineno)?,
                "allowed_swap_space" => cfg.allowed_swap = parse_ratio(&key, value, lineno)?,
                "max_swap_percent" => cfg.max_swap_percent = parse_percent(&key, value, lineno)?,
                "memory_swappiness" => {
                    cfg.swappiness = Some(parse_u64(&key, value, lineno)?);
                }
                "allowed_kmem_space" => cfg.allowed_kmem = parse_ratio(&key, value, lineno)?,
                "max_kmem_percent" => cfg.max_kmem_percent = parse_percent(&key, value, lineno)?,
                "min_kmem_space" => cfg.min_kmem_bytes = parse_mb(&key, value, lineno)?,
                "allowed_devices_file" => cfg.allowed_devices_file = PathBuf::from(value),
                _ => bail!(XCgroupError::Config(format!(
                    "line {}: unknown configuration key '{}'",
                    lineno, key
                ))),
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&mut self) -> Result<()> {
        if !self.mountpoint.is_absolute() {
            bail!(XCgroupError::Config(format!(
                "cgroup_mountpoint {} is not absolute",
                self.mountpoint.display()
            )));
        }
        if !self.prepend.starts_with('/') {
            bail!(XCgroupError::Config(format!(
                "cgroup_prepend {} must start with '/'",
                self.prepend
            )));
        }
        if let Some(s) = self.swappiness {
            if s > 100 {
                bail!(XCgroupError::Config(format!(
                    "memory_swappiness {} outside 0..100",
                    s
                )));
            }
        }
        if self.min_ram_bytes < MIN_RAM_FLOOR {
            warn!(
                sl!(),
                "min_ram_space below the {} MB floor, raising it",
                MIN_RAM_FLOOR / MB
            );
            self.min_ram_bytes = MIN_RAM_FLOOR;
        }
        if self.min_kmem_bytes < MIN_RAM_FLOOR {
            self.min_kmem_bytes = MIN_RAM_FLOOR;
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str, lineno: usize) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" => Ok(true),
        "no" => Ok(false),
        _ => bail!(XCgroupError::Config(format!(
            "line {}: {} expects yes or no, got '{}'",
            lineno, key, value
        ))),
    }
}

fn parse_u64(key: &str, value: &str, lineno: usize) -> Result<u64> {
    value.parse::<u64>().map_err(|_| {
        XCgroupError::Config(format!(
            "line {}: {} expects an unsigned integer, got '{}'",
            lineno, key, value
        ))
        .into()
    })
}

// sizes are configured in megabytes
fn parse_mb(key: &str, value: &str, lineno: usize) -> Result<u64> {
    Ok(parse_u64(key, value, lineno)?.saturating_mul(MB))
}

fn parse_ratio(key: &str, value: &str, lineno: usize) -> Result<f64> {
    let v = value.parse::<f64>().map_err(|_| {
        XCgroupError::Config(format!(
            "line {}: {} expects a number, got '{}'",
            lineno, key, value
        ))
    })?;
    if !v.is_finite() || v < 0.0 {
        bail!(XCgroupError::Config(format!(
            "line {}: {} must be a finite ratio >= 0, got '{}'",
            lineno, key, value
        )));
    }
    Ok(v)
}

fn parse_percent(key: &str, value: &str, lineno: usize) -> Result<f64> {
    let v = parse_ratio(key, value, lineno)?;
    if v > 100.0 {
        bail!(XCgroupError::Config(format!(
            "line {}: {} outside 0..100, got '{}'",
            lineno, key, value
        )));
    }
    Ok(v)
}

lazy_static! {
    static ref ACTIVE: RwLock<Arc<CgroupConfig>> = RwLock::new(Arc::new(CgroupConfig::default()));
}

/// Parse `path` and publish the result as the active configuration.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Arc<CgroupConfig>> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg = Arc::new(CgroupConfig::parse(&content).with_context(|| {
        format!("parse {}", path.display())
    })?);
    publish(cfg.clone());
    Ok(cfg)
}

/// Re-parse and atomically swap the active configuration. Operations
/// already holding a snapshot keep running against the old view.
pub fn reconfigure<P: AsRef<Path>>(path: P) -> Result<Arc<CgroupConfig>> {
    load(path)
}

/// Install an already-built configuration, e.g. one received from the
/// parent over the step control channel.
pub fn publish(cfg: Arc<CgroupConfig>) {
    *ACTIVE.write().unwrap() = cfg;
}

/// The current configuration snapshot.
pub fn snapshot() -> Arc<CgroupConfig> {
    ACTIVE.read().unwrap().clone()
}
