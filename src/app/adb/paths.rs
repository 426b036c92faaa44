use chrono::{DateTime, Local};
use uuid::Uuid;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub fn timestamp_now() -> String {
    format_timestamp(Local::now())
}

pub fn format_timestamp(at: DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn sanitize_filename_component(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

pub fn validate_device_path(path: &str) -> Result<(), String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("device_path is required".to_string());
    }
    if !trimmed.starts_with('/') {
        return Err("device_path must be an absolute device path starting with '/'".to_string());
    }
    if trimmed.contains('\0') {
        return Err("device_path contains invalid characters".to_string());
    }
    if trimmed == "/" {
        return Err("device_path must not be root".to_string());
    }
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err("device_path must not contain '..' segments".to_string());
    }
    Ok(())
}

pub fn join_device_path(dir: &str, name: &str) -> String {
    let dir = dir.trim().trim_end_matches('/');
    let name = name.trim().trim_start_matches('/');
    if dir.is_empty() {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Remote file name for a recording. `stem` comes from the test parameters; with
/// `unique` set a timestamp and a short random suffix are appended so back-to-back runs
/// never write the same file.
pub fn remote_artifact_name(stem: &str, extension: &str, unique: bool) -> String {
    let stem = sanitize_filename_component(stem);
    let extension = extension.trim_start_matches('.');
    if unique {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{stem}_{}_{}.{extension}", timestamp_now(), &suffix[..8])
    } else {
        format!("{stem}.{extension}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_device_path_requires_absolute() {
        assert!(validate_device_path("").is_err());
        assert!(validate_device_path("sdcard/file.wav").is_err());
        assert!(validate_device_path("/").is_err());
        assert!(validate_device_path("/sdcard/file.wav").is_ok());
    }

    #[test]
    fn validate_device_path_blocks_dotdot() {
        assert!(validate_device_path("/sdcard/../etc/passwd").is_err());
        assert!(validate_device_path("/sdcard/..").is_err());
    }

    #[test]
    fn sanitizes_serials_and_addresses() {
        assert_eq!(sanitize_filename_component("192.168.1.20:5555"), "192.168.1.20_5555");
        assert_eq!(sanitize_filename_component("  "), "unknown");
        assert_eq!(sanitize_filename_component("../x"), "_x");
    }

    #[test]
    fn joins_device_paths() {
        assert_eq!(join_device_path("/sdcard/", "/a.wav"), "/sdcard/a.wav");
        assert_eq!(join_device_path("", "a.wav"), "/a.wav");
    }

    #[test]
    fn unique_names_differ_between_runs() {
        let first = remote_artifact_name("loopback_48000_2ch", "wav", true);
        let second = remote_artifact_name("loopback_48000_2ch", "wav", true);
        assert_ne!(first, second);
        assert!(first.starts_with("loopback_48000_2ch_"));
        assert!(first.ends_with(".wav"));
        assert_eq!(
            remote_artifact_name("loopback_48000_2ch", ".wav", false),
            "loopback_48000_2ch.wav"
        );
    }
}
