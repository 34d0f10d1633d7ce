use std::path::{Path, PathBuf};

use log::debug;

use crate::error::ProbeError;
use crate::volume::tool::run_tool;
use crate::volume::{
    dedup_by_uuid_prefer_mounted, external_hint, is_under, normalize_uuid, VolumeMount,
    VolumeProbe,
};

const SYSTEM_ROOTS: &[&str] = &[
    "/proc", "/sys", "/dev", "/run", "/boot", "/snap", "/var", "/usr", "/etc", "/lib", "/lib64",
];
const REMOVABLE_ROOTS: &[&str] = &["/media", "/mnt", "/run/media"];

/// Linux probe joining `blkid -o export` with the kernel mount table.
pub struct LinuxProbe {
    mounts_file: PathBuf,
}

impl Default for LinuxProbe {
    fn default() -> Self {
        Self {
            mounts_file: PathBuf::from("/proc/mounts"),
        }
    }
}

impl LinuxProbe {
    pub fn with_mounts_file(mounts_file: impl Into<PathBuf>) -> Self {
        Self {
            mounts_file: mounts_file.into(),
        }
    }
}

impl VolumeProbe for LinuxProbe {
    fn os_name(&self) -> &'static str {
        "Linux"
    }

    fn probe(&self) -> Result<Vec<VolumeMount>, ProbeError> {
        let blkid = run_tool("blkid", &["-o", "export"])?;
        let devices = parse_blkid_export(&String::from_utf8_lossy(&blkid));

        let table =
            std::fs::read_to_string(&self.mounts_file).map_err(|e| ProbeError::ReadFile {
                path: self.mounts_file.clone(),
                source: e,
            })?;
        let table = parse_proc_mounts(&table);

        Ok(join_devices(&devices, &table, canonical_device))
    }
}

fn canonical_device(device: &str) -> String {
    std::fs::canonicalize(device)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| device.to_string())
}

/// One block device as reported by `blkid -o export`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDevice {
    pub devname: String,
    pub uuid: Option<String>,
    pub partuuid: Option<String>,
    pub fs_type: Option<String>,
    pub label: Option<String>,
}

/// One line of `/proc/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_path: String,
    pub fs_type: String,
}

/// Parses `KEY=value` blocks. Each `DEVNAME` starts a new device.
pub fn parse_blkid_export(text: &str) -> Vec<BlockDevice> {
    let mut devices = Vec::new();
    let mut current: Option<BlockDevice> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            devices.extend(current.take());
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().to_string();

        if key == "DEVNAME" {
            devices.extend(current.take());
            current = Some(BlockDevice {
                devname: value,
                ..Default::default()
            });
            continue;
        }

        let Some(device) = current.as_mut() else {
            continue;
        };
        match key {
            "UUID" => device.uuid = Some(value),
            "PARTUUID" => device.partuuid = Some(value),
            "TYPE" => device.fs_type = Some(value),
            "LABEL" => device.label = Some(value),
            _ => {}
        }
    }
    devices.extend(current);

    devices
}

/// Parses the kernel mount table, decoding `\040`-style octal escapes.
pub fn parse_proc_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_path = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                device: unescape_octal(device),
                mount_path: unescape_octal(mount_path),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// True for mounts that belong to the operating system rather than to
/// attached media.
pub fn looks_like_system_mount(mount_path: &str) -> bool {
    let normalized = Path::new(mount_path)
        .components()
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned();

    if REMOVABLE_ROOTS.iter().any(|root| is_under(&normalized, root)) {
        return false;
    }
    normalized == "/" || SYSTEM_ROOTS.iter().any(|root| is_under(&normalized, root))
}

/// Joins block devices carrying a filesystem UUID with their mount.
/// `canonicalize` resolves device symlinks such as `/dev/disk/by-uuid/*`.
pub fn join_devices(
    devices: &[BlockDevice],
    table: &[MountEntry],
    canonicalize: impl Fn(&str) -> String,
) -> Vec<VolumeMount> {
    let table: Vec<(String, &MountEntry)> = table
        .iter()
        .map(|entry| (canonicalize(&entry.device), entry))
        .collect();

    let mut mounts = Vec::new();
    for device in devices {
        let Some(uuid) = normalize_uuid(device.uuid.as_deref()) else {
            continue;
        };
        let devname = canonicalize(&device.devname);

        let Some((_, entry)) = table
            .iter()
            .find(|(dev, entry)| *dev == devname && !looks_like_system_mount(&entry.mount_path))
        else {
            debug!("Skipping {}: not mounted outside system paths", devname);
            continue;
        };

        mounts.push(VolumeMount {
            uuid,
            partition_uuid: normalize_uuid(device.partuuid.as_deref()),
            mount_path: entry.mount_path.clone(),
            device: Some(device.devname.clone()),
            fs_type: Some(entry.fs_type.clone())
                .filter(|t| !t.is_empty())
                .or_else(|| device.fs_type.clone()),
            label: device.label.clone(),
            is_external: external_hint(&entry.mount_path),
        });
    }

    dedup_by_uuid_prefer_mounted(mounts)
}
