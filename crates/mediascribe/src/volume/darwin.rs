use log::{debug, warn};

use crate::error::ProbeError;
use crate::volume::plist::{self, PlistValue};
use crate::volume::tool::run_tool;
use crate::volume::{
    dedup_by_uuid_prefer_mounted, external_hint, is_under, normalize_uuid, VolumeMount,
    VolumeProbe,
};

const DISKUTIL: &str = "diskutil";
const VOLUMES_ROOT: &str = "/Volumes";

/// macOS probe backed by `diskutil info -all`.
pub struct DarwinProbe;

impl VolumeProbe for DarwinProbe {
    fn os_name(&self) -> &'static str {
        "Darwin"
    }

    fn probe(&self) -> Result<Vec<VolumeMount>, ProbeError> {
        let structured = run_tool(DISKUTIL, &["info", "-all", "-plist"]).and_then(|out| {
            let xml = String::from_utf8_lossy(&out);
            parse_diskutil_plist(&xml)
        });

        match structured {
            Ok(mounts) => Ok(mounts),
            Err(e) => {
                warn!("diskutil plist output unusable, falling back to text: {}", e);
                let out = run_tool(DISKUTIL, &["info", "-all"])?;
                Ok(parse_diskutil_text(&String::from_utf8_lossy(&out)))
            }
        }
    }
}

fn first_str<'a>(entry: &'a PlistValue, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| entry.get(k).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|v| !v.is_empty())
}

fn mount_from_entry(entry: &PlistValue) -> Option<VolumeMount> {
    let uuid = normalize_uuid(first_str(entry, &["VolumeUUID", "VolumeUUIDString"]))?;
    let mount_path = first_str(entry, &["MountPoint"])?.to_string();

    Some(VolumeMount {
        uuid,
        partition_uuid: normalize_uuid(first_str(entry, &["PartitionUUID"])),
        is_external: external_hint(&mount_path),
        mount_path,
        device: first_str(entry, &["DeviceNode"]).map(String::from),
        fs_type: first_str(entry, &["FilesystemName", "FileSystemType", "Type (Bundle)"])
            .map(String::from),
        label: first_str(entry, &["VolumeName", "MediaName"]).map(String::from),
    })
}

/// Parses `diskutil info -all -plist`. The tool prints one document per
/// disk; a document holding an array of entries is accepted as well.
pub fn parse_diskutil_plist(xml: &str) -> Result<Vec<VolumeMount>, ProbeError> {
    let documents = plist::parse_documents(xml)?;
    if documents.is_empty() {
        return Err(ProbeError::Parse {
            what: "diskutil plist",
            reason: "no plist documents in output".to_string(),
        });
    }

    let mut mounts = Vec::new();
    for doc in &documents {
        match doc {
            PlistValue::Array(items) => mounts.extend(items.iter().filter_map(mount_from_entry)),
            entry @ PlistValue::Dict(_) => mounts.extend(mount_from_entry(entry)),
            other => debug!("Ignoring non-dict plist document: {:?}", other),
        }
    }

    Ok(finish(mounts))
}

/// Parses the human-readable `diskutil info -all` output. Disks are
/// separated by lines of asterisks.
pub fn parse_diskutil_text(text: &str) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();
    let mut block = TextBlock::default();

    for line in text.lines() {
        let line = line.trim();
        if line.starts_with("***") {
            mounts.extend(block.take());
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        let value = (!value.is_empty()).then(|| value.to_string());
        match key.trim() {
            "Device Node" => block.device = value,
            "Volume Name" => block.label = value,
            "Mount Point" => block.mount_path = value,
            "File System Personality" | "File System" => {
                if block.fs_type.is_none() {
                    block.fs_type = value;
                }
            }
            "Volume UUID" => block.uuid = normalize_uuid(value.as_deref()),
            "Disk / Partition UUID" | "Partition UUID" => {
                block.partition_uuid = normalize_uuid(value.as_deref())
            }
            _ => {}
        }
    }
    mounts.extend(block.take());

    finish(mounts)
}

#[derive(Default)]
struct TextBlock {
    uuid: Option<String>,
    partition_uuid: Option<String>,
    mount_path: Option<String>,
    device: Option<String>,
    fs_type: Option<String>,
    label: Option<String>,
}

impl TextBlock {
    fn take(&mut self) -> Option<VolumeMount> {
        let block = std::mem::take(self);
        let uuid = block.uuid?;
        let mount_path = block.mount_path?;
        Some(VolumeMount {
            uuid,
            partition_uuid: block.partition_uuid,
            is_external: external_hint(&mount_path),
            mount_path,
            device: block.device,
            fs_type: block.fs_type,
            label: block.label,
        })
    }
}

fn finish(mounts: Vec<VolumeMount>) -> Vec<VolumeMount> {
    dedup_by_uuid_prefer_mounted(mounts)
        .into_iter()
        .filter(|m| is_under(&m.mount_path, VOLUMES_ROOT) && m.mount_path != VOLUMES_ROOT)
        .collect()
}
