//! Canonical volume identities.
//!
//! Each platform reports the identity of the same physical disk in a
//! different shape: braced GUIDs, `\\?\Volume{GUID}\` paths, bare
//! lowercase UUIDs, short FAT/NTFS serial numbers. Everything that
//! compares or stores a volume identity goes through [`normalize_uuid`].

use std::sync::OnceLock;

use regex::Regex;

fn guid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"[0-9a-fA-F]{8}-?[0-9a-fA-F]{4}-?[0-9a-fA-F]{4}-?[0-9a-fA-F]{4}-?[0-9a-fA-F]{12}",
        )
        .expect("GUID pattern is valid")
    })
}

fn braced_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([0-9a-fA-F\-]{36})\}").expect("braced pattern is valid"))
}

/// Normalizes a raw platform volume identifier.
///
/// A 32-hex-digit GUID found anywhere in the value is returned as
/// uppercase `8-4-4-4-12`. Values without a GUID (serial numbers, FAT
/// volume ids) are trimmed and uppercased. `None` and blank input yield
/// `None`.
pub fn normalize_uuid(value: Option<&str>) -> Option<String> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }

    let stripped = raw
        .replace("Volume UUID:", "")
        .replace("UUID:", "");
    let stripped = stripped.trim().trim_matches('\\').trim();

    let inner = match braced_pattern().captures(stripped) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(stripped),
        None => stripped,
    };
    let inner = inner.trim_matches(|c| c == '{' || c == '}');

    if let Some(m) = guid_pattern().find(inner) {
        let hex: String = m.as_str().chars().filter(|c| *c != '-').collect();
        return Some(
            format!(
                "{}-{}-{}-{}-{}",
                &hex[0..8],
                &hex[8..12],
                &hex[12..16],
                &hex[16..20],
                &hex[20..32]
            )
            .to_uppercase(),
        );
    }

    let serial = inner.trim();
    if serial.is_empty() {
        None
    } else {
        Some(serial.to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "12345678-9ABC-DEF0-1234-56789ABCDEF0";

    #[test]
    fn test_guid_surface_forms_normalize_identically() {
        let forms = [
            "12345678-9abc-def0-1234-56789abcdef0",
            "12345678-9ABC-DEF0-1234-56789ABCDEF0",
            "{12345678-9abc-def0-1234-56789abcdef0}",
            "Volume{12345678-9abc-def0-1234-56789abcdef0}",
            r"\\?\Volume{12345678-9abc-def0-1234-56789abcdef0}\",
            r"\12345678-9abc-def0-1234-56789abcdef0\",
            "123456789abcdef0123456789abcdef0",
            "  UUID: 12345678-9abc-def0-1234-56789abcdef0  ",
            "Volume UUID: 12345678-9ABC-DEF0-1234-56789ABCDEF0",
        ];

        for form in forms {
            assert_eq!(
                normalize_uuid(Some(form)).as_deref(),
                Some(CANONICAL),
                "form {:?} did not normalize",
                form
            );
        }
    }

    #[test]
    fn test_serial_numbers_are_uppercased() {
        assert_eq!(normalize_uuid(Some("a1b2-c3d4")).as_deref(), Some("A1B2-C3D4"));
        assert_eq!(normalize_uuid(Some(" 2917419305 ")).as_deref(), Some("2917419305"));
        assert_eq!(
            normalize_uuid(Some("5e2a1c3b-01")).as_deref(),
            Some("5E2A1C3B-01")
        );
    }

    #[test]
    fn test_empty_input_yields_none() {
        assert_eq!(normalize_uuid(None), None);
        assert_eq!(normalize_uuid(Some("")), None);
        assert_eq!(normalize_uuid(Some("   ")), None);
        assert_eq!(normalize_uuid(Some("{}")), None);
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let once = normalize_uuid(Some("volume{12345678-9abc-def0-1234-56789abcdef0}")).unwrap();
        let twice = normalize_uuid(Some(&once)).unwrap();
        assert_eq!(once, twice);
    }
}
