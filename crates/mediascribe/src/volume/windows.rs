use std::collections::HashSet;
use std::path::Path;

use log::warn;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ProbeError;
use crate::volume::tool::run_tool;
use crate::volume::{normalize_uuid, VolumeMount, VolumeProbe};

const GET_VOLUME: &str = "Get-Volume | Select-Object DriveLetter, FileSystemLabel, FileSystem, \
                          UniqueId, Path | ConvertTo-Json";

/// Windows probe backed by PowerShell `Get-Volume`, with `wmic` as fallback.
pub struct WindowsProbe;

impl VolumeProbe for WindowsProbe {
    fn os_name(&self) -> &'static str {
        "Windows"
    }

    fn probe(&self) -> Result<Vec<VolumeMount>, ProbeError> {
        let exists = |p: &str| Path::new(p).exists();

        let structured = run_tool(
            "powershell",
            &["-NoProfile", "-NonInteractive", "-Command", GET_VOLUME],
        )
        .and_then(|out| parse_get_volume_json(&String::from_utf8_lossy(&out), exists));

        match structured {
            Ok(mounts) if !mounts.is_empty() => return Ok(mounts),
            Ok(_) => warn!("Get-Volume reported no usable volumes, trying wmic"),
            Err(e) => warn!("Get-Volume failed, trying wmic: {}", e),
        }

        let out = run_tool(
            "wmic",
            &[
                "volume",
                "get",
                "DriveLetter,Label,FileSystem,SerialNumber",
                "/format:list",
            ],
        )?;
        Ok(parse_wmic_list(&String::from_utf8_lossy(&out), exists))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VolumeRow {
    drive_letter: Option<Value>,
    file_system_label: Option<String>,
    file_system: Option<String>,
    unique_id: Option<String>,
    path: Option<String>,
}

/// `DriveLetter` is a `char` in PowerShell; depending on the version it
/// serializes as a one-letter string or as its code point.
fn drive_letter(value: Option<&Value>) -> Option<char> {
    let letter = match value? {
        Value::String(s) => s.trim().trim_end_matches(':').chars().next(),
        Value::Number(n) => n.as_u64().and_then(|n| char::from_u32(n as u32)),
        _ => None,
    }?;
    letter.is_ascii_alphabetic().then(|| letter.to_ascii_uppercase())
}

fn drive_root(letter: char) -> String {
    format!("{}:\\", letter)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parses `Get-Volume | ConvertTo-Json`, which yields a bare object for a
/// single volume and an array otherwise.
pub fn parse_get_volume_json(
    json: &str,
    path_exists: impl Fn(&str) -> bool,
) -> Result<Vec<VolumeMount>, ProbeError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(json).map_err(|e| ProbeError::Parse {
        what: "Get-Volume JSON",
        reason: e.to_string(),
    })?;
    let rows: Vec<VolumeRow> = match value {
        Value::Array(_) => serde_json::from_value(value),
        other => serde_json::from_value(other).map(|row| vec![row]),
    }
    .map_err(|e| ProbeError::Parse {
        what: "Get-Volume JSON",
        reason: e.to_string(),
    })?;

    let mut mounts = Vec::new();
    for row in rows {
        let letter = drive_letter(row.drive_letter.as_ref());
        let volume_path = non_empty(row.path);
        let Some(mount_path) = letter.map(drive_root).or_else(|| volume_path.clone()) else {
            continue;
        };

        let raw_id = non_empty(row.unique_id)
            .or_else(|| volume_path.clone())
            .or_else(|| letter.map(String::from));
        let Some(uuid) = normalize_uuid(raw_id.as_deref()) else {
            continue;
        };
        if !path_exists(&mount_path) {
            continue;
        }

        mounts.push(VolumeMount {
            uuid,
            partition_uuid: None,
            device: volume_path.or_else(|| Some(mount_path.clone())),
            mount_path,
            fs_type: non_empty(row.file_system),
            label: non_empty(row.file_system_label),
            is_external: None,
        });
    }

    Ok(dedup_by_uuid_and_path(mounts))
}

/// Parses `wmic volume get ... /format:list`: `Key=Value` lines grouped in
/// blank-line separated blocks.
pub fn parse_wmic_list(text: &str, path_exists: impl Fn(&str) -> bool) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();
    let mut block: Vec<(String, String)> = Vec::new();

    let mut flush = |block: &mut Vec<(String, String)>| {
        let field = |name: &str| {
            block
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .filter(|v| !v.is_empty())
        };
        let letter = drive_letter(field("DriveLetter").map(Value::String).as_ref());
        let uuid = normalize_uuid(field("SerialNumber").as_deref());
        if let (Some(letter), Some(uuid)) = (letter, uuid) {
            let mount_path = drive_root(letter);
            if path_exists(&mount_path) {
                mounts.push(VolumeMount {
                    uuid,
                    partition_uuid: None,
                    device: Some(mount_path.clone()),
                    mount_path,
                    fs_type: field("FileSystem"),
                    label: field("Label"),
                    is_external: None,
                });
            }
        }
        block.clear();
    };

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !block.is_empty() {
                flush(&mut block);
            }
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            block.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    if !block.is_empty() {
        flush(&mut block);
    }

    dedup_by_uuid_and_path(mounts)
}

fn dedup_by_uuid_and_path(mounts: Vec<VolumeMount>) -> Vec<VolumeMount> {
    let mut seen = HashSet::new();
    mounts
        .into_iter()
        .filter(|m| seen.insert((m.uuid.clone(), m.mount_path.to_uppercase())))
        .collect()
}
