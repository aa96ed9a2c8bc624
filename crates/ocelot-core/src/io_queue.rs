//! Process-wide I/O queue bounding concurrent reads per physical device.
//!
//! Spinning disks collapse under parallel streaming reads, so the HDD policy
//! is strictly serial. Device class is detected once at startup; devices the
//! probe cannot classify get the SSD policy.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use sysinfo::Disks;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Storage device class, detected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Hdd,
    Ssd,
}

impl DeviceClass {
    /// Concurrent read budget for this class.
    pub fn read_slots(&self) -> usize {
        match self {
            DeviceClass::Hdd => 1,
            DeviceClass::Ssd => 4,
        }
    }
}

/// One mount point with its class and permit pool.
struct DeviceQueue {
    mount_point: std::path::PathBuf,
    class: DeviceClass,
    permits: Arc<Semaphore>,
}

/// Bounds concurrent file reads per physical device.
pub struct IoQueue {
    devices: Vec<DeviceQueue>,
    /// Pool used for paths on unrecognized mounts.
    fallback: Arc<Semaphore>,
}

impl IoQueue {
    /// Detect mounted devices and build their permit pools.
    pub fn detect() -> Self {
        let disks = Disks::new_with_refreshed_list();
        let mut devices = Vec::new();
        for disk in disks.list() {
            let class = match disk.kind() {
                sysinfo::DiskKind::HDD => DeviceClass::Hdd,
                // SSDs and anything unidentified share the SSD policy.
                _ => DeviceClass::Ssd,
            };
            debug!(
                "I/O queue: {} -> {:?} ({} slots)",
                disk.mount_point().display(),
                class,
                class.read_slots()
            );
            devices.push(DeviceQueue {
                mount_point: disk.mount_point().to_path_buf(),
                class,
                permits: Arc::new(Semaphore::new(class.read_slots())),
            });
        }
        // Longest mount prefix must win (e.g. `/` vs `/mnt/models`).
        devices.sort_by_key(|d| std::cmp::Reverse(d.mount_point.as_os_str().len()));

        Self {
            devices,
            fallback: Arc::new(Semaphore::new(DeviceClass::Ssd.read_slots())),
        }
    }

    /// Build a queue with a single pool of the given width (tests, overrides).
    pub fn with_uniform_slots(slots: usize) -> Self {
        Self {
            devices: Vec::new(),
            fallback: Arc::new(Semaphore::new(slots.max(1))),
        }
    }

    /// Device class governing the given path.
    pub fn class_for(&self, path: &Path) -> DeviceClass {
        self.devices
            .iter()
            .find(|d| path.starts_with(&d.mount_point))
            .map(|d| d.class)
            .unwrap_or(DeviceClass::Ssd)
    }

    /// Acquire a read permit for the device owning `path`.
    ///
    /// The permit is released when dropped.
    pub async fn acquire(&self, path: &Path) -> OwnedSemaphorePermit {
        let pool = self
            .devices
            .iter()
            .find(|d| path.starts_with(&d.mount_point))
            .map(|d| Arc::clone(&d.permits))
            .unwrap_or_else(|| Arc::clone(&self.fallback));

        // The semaphore is never closed, so acquisition cannot fail.
        pool.acquire_owned().await.expect("io queue semaphore closed")
    }

    /// Snapshot of per-mount classes, for diagnostics.
    pub fn device_report(&self) -> HashMap<std::path::PathBuf, DeviceClass> {
        self.devices
            .iter()
            .map(|d| (d.mount_point.clone(), d.class))
            .collect()
    }
}
