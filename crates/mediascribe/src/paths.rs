//! Translation between physical paths and logical `(volume, relative)` paths.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::volume::{normalize_uuid, MountSnapshot, VolumeMount};

/// A file location that survives remounts: the volume identity plus a
/// forward-slash relative path inside that volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalPath {
    pub volume_identity: String,
    pub relative_path: String,
}

impl LogicalPath {
    pub fn new(volume_identity: impl Into<String>, relative_path: &str) -> Self {
        Self {
            volume_identity: volume_identity.into(),
            relative_path: normalize_relative_path(relative_path),
        }
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.volume_identity, self.relative_path)
    }
}

/// Re-encodes a relative path with `/` separators, dropping empty and `.`
/// segments. Backslashes are treated as separators as well. `..` removes
/// the previous segment and never climbs above the volume root.
pub fn normalize_relative_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for seg in path.split(['/', '\\']) {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Windows paths compare case-insensitively.
const IGNORE_CASE: bool = cfg!(windows);

/// `target` relative to `root`, comparing whole components.
fn strip_mount(target: &Path, root: &Path, ignore_case: bool) -> Option<PathBuf> {
    let mut rest = target.components();
    for expected in root.components() {
        let actual = rest.next()?;
        let same = if ignore_case {
            actual.as_os_str().to_string_lossy().to_lowercase()
                == expected.as_os_str().to_string_lossy().to_lowercase()
        } else {
            actual == expected
        };
        if !same {
            return None;
        }
    }
    Some(rest.as_path().to_path_buf())
}

fn lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Finds the mounted volume containing `abs_path` and returns its logical
/// path. With nested mounts the longest mount path wins.
pub fn real_path_to_logical(abs_path: &Path, mounts: &[VolumeMount]) -> Option<LogicalPath> {
    let target = lexical(abs_path);

    let (mount, relative) = mounts
        .iter()
        .filter(|m| !m.mount_path.is_empty())
        .filter_map(|m| {
            let root = lexical(Path::new(&m.mount_path));
            let relative = strip_mount(&target, &root, IGNORE_CASE)?;
            Some((m, root.components().count(), relative))
        })
        .max_by_key(|(_, depth, _)| *depth)
        .map(|(m, _, relative)| (m, relative))?;

    let segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    Some(LogicalPath {
        volume_identity: mount.identity().to_string(),
        relative_path: normalize_relative_path(&segments.join("/")),
    })
}

/// Resolves a logical path against the mounted volumes. `None` means the
/// volume is not mounted right now.
pub fn logical_path_to_real(
    volume_identity: &str,
    relative_path: &str,
    mounts: &[VolumeMount],
) -> Option<PathBuf> {
    let normalized = normalize_uuid(Some(volume_identity));
    let mount = mounts.iter().find(|m| {
        m.matches_identity(volume_identity)
            || normalized
                .as_deref()
                .map(|id| m.matches_identity(id))
                .unwrap_or(false)
    })?;

    let mut path = PathBuf::from(&mount.mount_path);
    for segment in normalize_relative_path(relative_path).split('/') {
        if !segment.is_empty() {
            path.push(segment);
        }
    }
    Some(path)
}

impl MountSnapshot {
    pub fn to_logical(&self, abs_path: &Path) -> Option<LogicalPath> {
        real_path_to_logical(abs_path, self.mounts())
    }

    pub fn to_physical(&self, logical: &LogicalPath) -> Option<PathBuf> {
        logical_path_to_real(&logical.volume_identity, &logical.relative_path, self.mounts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(uuid: &str, path: &str) -> VolumeMount {
        VolumeMount {
            uuid: uuid.to_string(),
            partition_uuid: None,
            mount_path: path.to_string(),
            device: None,
            fs_type: None,
            label: None,
            is_external: Some(true),
        }
    }

    const DATA: &str = "ABCD0000-0000-0000-0000-000000000001";

    #[test]
    fn test_round_trip_under_mount() {
        let snapshot = MountSnapshot::from_mounts(vec![mount(DATA, "/Volumes/Data")]);

        let logical = snapshot
            .to_logical(Path::new("/Volumes/Data/clips/a.mp4"))
            .unwrap();
        assert_eq!(logical.volume_identity, DATA);
        assert_eq!(logical.relative_path, "clips/a.mp4");

        let physical = snapshot.to_physical(&logical).unwrap();
        assert_eq!(physical, PathBuf::from("/Volumes/Data/clips/a.mp4"));
    }

    #[test]
    fn test_nested_mount_wins() {
        let mounts = vec![
            mount("OUTER", "/mnt/array"),
            mount("INNER", "/mnt/array/cards"),
        ];

        let logical =
            real_path_to_logical(Path::new("/mnt/array/cards/day1/clip.wav"), &mounts).unwrap();
        assert_eq!(logical.volume_identity, "INNER");
        assert_eq!(logical.relative_path, "day1/clip.wav");

        let logical = real_path_to_logical(Path::new("/mnt/array/other.wav"), &mounts).unwrap();
        assert_eq!(logical.volume_identity, "OUTER");
    }

    #[test]
    fn test_sibling_prefix_is_not_a_match() {
        let mounts = vec![mount("DATA", "/Volumes/Data")];
        assert!(real_path_to_logical(Path::new("/Volumes/Data2/a.mp4"), &mounts).is_none());
        assert!(real_path_to_logical(Path::new("/home/a.mp4"), &mounts).is_none());
    }

    #[test]
    fn test_partition_uuid_is_the_identity() {
        let mut m = mount("FS-UUID", "/media/card");
        m.partition_uuid = Some("PART-UUID".to_string());
        let mounts = vec![m];

        let logical = real_path_to_logical(Path::new("/media/card/x/y.m4a"), &mounts).unwrap();
        assert_eq!(logical.volume_identity, "PART-UUID");

        // Rows written with the filesystem uuid still resolve.
        assert_eq!(
            logical_path_to_real("FS-UUID", "x/y.m4a", &mounts),
            Some(PathBuf::from("/media/card/x/y.m4a"))
        );
    }

    #[test]
    fn test_unmounted_volume_resolves_to_none() {
        let mounts = vec![mount(DATA, "/Volumes/Data")];
        assert!(logical_path_to_real("FFFF", "a.mp4", &mounts).is_none());
        assert!(logical_path_to_real(DATA, "a.mp4", &[]).is_none());
    }

    #[test]
    fn test_identity_is_normalized_before_lookup() {
        let mounts = vec![mount(DATA, "/Volumes/Data")];
        let raw = "{abcd0000-0000-0000-0000-000000000001}";
        assert_eq!(
            logical_path_to_real(raw, "a.mp4", &mounts),
            Some(PathBuf::from("/Volumes/Data/a.mp4"))
        );
    }

    #[test]
    fn test_normalize_relative_path() {
        assert_eq!(normalize_relative_path(r"clips\2024\a.mp4"), "clips/2024/a.mp4");
        assert_eq!(normalize_relative_path("./clips//a.mp4"), "clips/a.mp4");
        assert_eq!(normalize_relative_path(""), "");
    }

    #[test]
    fn test_parent_segments_stay_inside_the_volume() {
        assert_eq!(normalize_relative_path("clips/../audio/a.wav"), "audio/a.wav");
        assert_eq!(normalize_relative_path("../../etc/passwd"), "etc/passwd");
        assert_eq!(normalize_relative_path(r"a\..\..\b.wav"), "b.wav");

        let mounts = vec![mount(DATA, "/Volumes/Data")];
        assert_eq!(
            logical_path_to_real(DATA, "../../etc/passwd", &mounts),
            Some(PathBuf::from("/Volumes/Data/etc/passwd"))
        );
        assert_eq!(LogicalPath::new(DATA, "x/../../y.wav").relative_path, "y.wav");
    }

    #[test]
    fn test_case_insensitive_mount_match() {
        let target = Path::new("/Volumes/DATA/Clips/a.mp4");
        let root = Path::new("/volumes/data");
        assert_eq!(strip_mount(target, root, true), Some(PathBuf::from("Clips/a.mp4")));
        assert_eq!(strip_mount(target, root, false), None);
        assert_eq!(strip_mount(Path::new("/volumes/data2/a"), root, true), None);
    }

    #[cfg(windows)]
    #[test]
    fn test_drive_letter_case_is_ignored() {
        let mounts = vec![mount(DATA, r"e:\")];
        let logical = real_path_to_logical(Path::new(r"E:\Clips\a.mp4"), &mounts).unwrap();
        assert_eq!(logical.volume_identity, DATA);
        assert_eq!(logical.relative_path, "Clips/a.mp4");
    }

    #[test]
    fn test_dot_segments_are_resolved_lexically() {
        let mounts = vec![mount(DATA, "/Volumes/Data/")];
        let logical =
            real_path_to_logical(Path::new("/Volumes/Data/./clips/../audio/b.wav"), &mounts)
                .unwrap();
        assert_eq!(logical.relative_path, "audio/b.wav");
        assert_eq!(logical.to_string(), format!("{}:audio/b.wav", DATA));
    }
}
