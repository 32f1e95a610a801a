//! Pure target-resolution helpers shared by mapping lookups and
//! unmapped-session classification.

use once_cell::sync::Lazy;
use regex::Regex;

/// Reserved session keys.
pub const MASTER_KEY: &str = "master";
pub const SYSTEM_KEY: &str = "system";
pub const MIC_KEY: &str = "mic";

/// Prefix marking targets that transform into a set of session keys rather
/// than naming one directly.
pub const SPECIAL_PREFIX: &str = "deej.";

/// Expands to the process names attached to the focused window.
pub const SPECIAL_CURRENT: &str = "deej.current";

/// Expands to the keys of every session no slider target matches.
pub const SPECIAL_UNMAPPED: &str = "deej.unmapped";

static DEVICE_KEY_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^.+ \(.+\)$").unwrap());
static WINDOWS_DRIVE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z]:[/\\]").unwrap());
static UNC_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[/\\]{2}[^/\\]+[/\\]").unwrap());

/// Targets are compared case-insensitively.
pub fn normalize_key(s: &str) -> String {
    s.to_lowercase()
}

pub fn has_special_transform(target: &str) -> bool {
    target.starts_with(SPECIAL_PREFIX)
}

/// True for keys shaped like a friendly device name, e.g.
/// `Headphones (Realtek Audio)`. Those always count as mapped.
pub fn is_device_key(key: &str) -> bool {
    DEVICE_KEY_PATTERN.is_match(key)
}

/// True when the target's first component is a filesystem root: a drive
/// letter plus separator, a UNC prefix, or a leading slash.
pub fn is_path(s: &str) -> bool {
    WINDOWS_DRIVE_PATTERN.is_match(s) || UNC_PATTERN.is_match(s) || s.starts_with('/')
}

/// Windows-style paths (drive letter or UNC, either separator) compare
/// case-insensitively with `\` and `/` interchangeable.
fn is_windows_style(s: &str) -> bool {
    WINDOWS_DRIVE_PATTERN.is_match(s) || (UNC_PATTERN.is_match(s) && s.contains('\\'))
}

fn normalize_path(s: &str, windows_style: bool) -> String {
    if windows_style {
        s.replace('\\', "/").to_lowercase()
    } else {
        s.to_string()
    }
}

/// Prefix match of `target` against an absolute `process_path`, up to and
/// including a separator: `/opt/games` matches `/opt/games/factorio/bin`
/// but not `/opt/games2/x`.
pub fn path_matches(process_path: &str, target: &str) -> bool {
    if process_path.is_empty() || target.is_empty() {
        return false;
    }

    let windows_style = is_windows_style(target) || is_windows_style(process_path);
    let process = normalize_path(process_path, windows_style);
    let mut prefix = normalize_path(target, windows_style);

    if !prefix.ends_with('/') {
        prefix.push('/');
    }

    process.starts_with(&prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_paths_detected() {
        assert!(is_path("/usr/bin"));
        assert!(!is_path("firefox"));
        assert!(!is_path("deej.unmapped"));
        assert!(!is_path("relative/path"));
    }

    #[test]
    fn windows_paths_detected() {
        assert!(is_path(r"C:\Games"));
        assert!(is_path("C:/Games"));
        assert!(is_path(r"\\server\share"));
        assert!(is_path("//server/share/"));
    }

    #[test]
    fn unix_prefix_match_is_case_sensitive() {
        assert!(path_matches("/opt/games/factorio/bin/factorio", "/opt/games"));
        assert!(!path_matches("/opt/Games/factorio/bin/factorio", "/opt/games"));
        assert!(!path_matches("/opt/games2/thing", "/opt/games"));
    }

    #[test]
    fn windows_prefix_match_folds_case_and_separators() {
        assert!(path_matches(r"C:\Games\Steam\steam.exe", r"c:\games"));
        assert!(path_matches("C:/Games/Steam/steam.exe", r"C:\GAMES\Steam"));
        assert!(!path_matches(r"C:\GamesOld\x.exe", r"C:\Games"));
    }

    #[test]
    fn exact_directory_match_requires_separator_boundary() {
        assert!(path_matches("/opt/games/x", "/opt/games/"));
        assert!(!path_matches("/opt/games", "/opt/games"));
    }

    #[test]
    fn empty_inputs_never_match() {
        assert!(!path_matches("", "/opt"));
        assert!(!path_matches("/opt/x", ""));
    }

    #[test]
    fn device_keys_match_friendly_pattern() {
        assert!(is_device_key("Headphones (Realtek Audio)"));
        assert!(is_device_key("speakers (usb dac)"));
        assert!(!is_device_key("firefox"));
        assert!(!is_device_key("(orphan)"));
    }

    #[test]
    fn special_transform_detection() {
        assert!(has_special_transform("deej.current"));
        assert!(has_special_transform("deej.unmapped"));
        assert!(!has_special_transform("deejay"));
        assert!(!has_special_transform("spotify"));
    }

    #[test]
    fn keys_normalize_to_lowercase() {
        assert_eq!(normalize_key("FireFox"), "firefox");
        assert_eq!(normalize_key("Deej.Current"), "deej.current");
    }
}
