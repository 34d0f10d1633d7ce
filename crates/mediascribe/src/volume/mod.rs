//! Mounted volume enumeration.
//!
//! One [`VolumeProbe`] implementation per operating system, chosen once at
//! startup with [`probe_for_host`]. Every probe yields the same
//! [`VolumeMount`] shape; identities are passed through
//! [`identity::normalize_uuid`] so they compare equal across hosts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ProbeError;

pub mod darwin;
pub mod identity;
pub mod linux;
pub mod plist;
mod tool;
pub mod windows;

pub use darwin::DarwinProbe;
pub use identity::normalize_uuid;
pub use linux::LinuxProbe;
pub use windows::WindowsProbe;

/// Mount roots under which removable or external media usually appear.
pub const EXTERNAL_MEDIA_ROOTS: &[&str] = &["/Volumes", "/media", "/mnt", "/run/media"];

/// One currently mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Normalized volume identity.
    pub uuid: String,
    /// Partition-level GUID, preferred over `uuid` when present.
    pub partition_uuid: Option<String>,
    pub mount_path: String,
    pub device: Option<String>,
    pub fs_type: Option<String>,
    pub label: Option<String>,
    pub is_external: Option<bool>,
}

impl VolumeMount {
    /// The identity stored in logical paths for files on this volume.
    pub fn identity(&self) -> &str {
        self.partition_uuid.as_deref().unwrap_or(&self.uuid)
    }

    /// True when `identity` names this volume by either identifier.
    pub fn matches_identity(&self, identity: &str) -> bool {
        self.uuid == identity || self.partition_uuid.as_deref() == Some(identity)
    }
}

/// Platform-specific source of the mounted volume list.
pub trait VolumeProbe: Send + Sync {
    fn os_name(&self) -> &'static str;

    fn probe(&self) -> Result<Vec<VolumeMount>, ProbeError>;
}

/// Probe for platforms without a known volume tool.
pub struct UnsupportedProbe;

impl VolumeProbe for UnsupportedProbe {
    fn os_name(&self) -> &'static str {
        std::env::consts::OS
    }

    fn probe(&self) -> Result<Vec<VolumeMount>, ProbeError> {
        Ok(Vec::new())
    }
}

/// Selects the probe for the operating system this binary runs on.
pub fn probe_for_host() -> Box<dyn VolumeProbe> {
    if cfg!(target_os = "macos") {
        Box::new(DarwinProbe)
    } else if cfg!(target_os = "linux") {
        Box::new(LinuxProbe::default())
    } else if cfg!(target_os = "windows") {
        Box::new(WindowsProbe)
    } else {
        Box::new(UnsupportedProbe)
    }
}

/// Lists mounted volumes. Enumeration is best effort: a failing probe is
/// logged and yields an empty list.
pub fn list_mounted_devices(probe: &dyn VolumeProbe) -> Vec<VolumeMount> {
    match probe.probe() {
        Ok(mounts) => {
            info!(
                "Found {} mounted volume(s) on {}",
                mounts.len(),
                probe.os_name()
            );
            mounts
        }
        Err(e) => {
            warn!("Volume enumeration failed on {}: {}", probe.os_name(), e);
            Vec::new()
        }
    }
}

/// Immutable view of the mounted volumes at one point in time.
///
/// Cheap to clone. Refresh by capturing a new snapshot.
#[derive(Debug, Clone)]
pub struct MountSnapshot {
    mounts: Arc<[VolumeMount]>,
    captured_at: Instant,
}

impl MountSnapshot {
    pub fn capture(probe: &dyn VolumeProbe) -> Self {
        Self::from_mounts(list_mounted_devices(probe))
    }

    pub fn from_mounts(mounts: Vec<VolumeMount>) -> Self {
        Self {
            mounts: mounts.into(),
            captured_at: Instant::now(),
        }
    }

    pub fn mounts(&self) -> &[VolumeMount] {
        &self.mounts
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Maps each volume identity to its current mount path.
    pub fn uuid_map(&self) -> HashMap<String, String> {
        self.mounts
            .iter()
            .map(|m| (m.identity().to_string(), m.mount_path.clone()))
            .collect()
    }

    pub fn find(&self, identity: &str) -> Option<&VolumeMount> {
        self.mounts.iter().find(|m| m.matches_identity(identity))
    }
}

/// True when `path` equals `root` or lies below it, compared by
/// `/`-separated components.
pub(crate) fn is_under(path: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return path.starts_with('/');
    }
    path == root
        || path
            .strip_prefix(root)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}

pub(crate) fn external_hint(mount_path: &str) -> Option<bool> {
    if EXTERNAL_MEDIA_ROOTS
        .iter()
        .any(|root| is_under(mount_path, root) && mount_path != *root)
    {
        Some(true)
    } else {
        None
    }
}

/// Keeps one entry per `uuid`, preferring one that carries a mount path.
pub(crate) fn dedup_by_uuid_prefer_mounted(mounts: Vec<VolumeMount>) -> Vec<VolumeMount> {
    let mut order: Vec<String> = Vec::new();
    let mut by_uuid: HashMap<String, VolumeMount> = HashMap::new();

    for mount in mounts {
        if mount.uuid.is_empty() {
            continue;
        }
        match by_uuid.get(&mount.uuid) {
            None => {
                order.push(mount.uuid.clone());
                by_uuid.insert(mount.uuid.clone(), mount);
            }
            Some(prev) if prev.mount_path.is_empty() && !mount.mount_path.is_empty() => {
                by_uuid.insert(mount.uuid.clone(), mount);
            }
            Some(_) => {}
        }
    }

    order
        .into_iter()
        .filter_map(|uuid| by_uuid.remove(&uuid))
        .collect()
}
