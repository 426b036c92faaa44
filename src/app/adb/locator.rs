use std::path::{Path, PathBuf};

const SDK_ENV_VARS: [&str; 2] = ["ANDROID_HOME", "ANDROID_SDK_ROOT"];

fn adb_file_name() -> &'static str {
    if cfg!(windows) {
        "adb.exe"
    } else {
        "adb"
    }
}

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

/// `platform-tools/adb` under the SDK named by `ANDROID_HOME` / `ANDROID_SDK_ROOT`.
pub fn sdk_adb_candidate(lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    SDK_ENV_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|root| normalize_command_path(&root))
        .filter(|root| !root.is_empty())
        .map(|root| PathBuf::from(root).join("platform-tools").join(adb_file_name()))
        .find(|candidate| candidate.is_file())
}

/// Configured path first, then the SDK location, then plain `adb` from `PATH`.
pub fn resolve_adb_program(config_command_path: &str) -> String {
    let normalized = normalize_command_path(config_command_path);
    if !normalized.is_empty() {
        return normalized;
    }
    sdk_adb_candidate(|name| std::env::var(name).ok())
        .map(|path| path.to_string_lossy().to_string())
        .unwrap_or_else(|| "adb".to_string())
}

pub fn validate_adb_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("ADB command is empty".to_string());
    }
    if program == "adb" || program == "adb.exe" {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err("ADB path must point to an executable file".to_string());
    }
    if !path.exists() {
        return Err("ADB executable not found at the configured path".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn strips_wrapping_quotes() {
        assert_eq!(
            normalize_command_path("  \"/opt/android/platform-tools/adb\"  "),
            "/opt/android/platform-tools/adb"
        );
        assert_eq!(
            normalize_command_path("'/opt/android/platform-tools/adb'"),
            "/opt/android/platform-tools/adb"
        );
    }

    #[test]
    fn configured_path_wins() {
        assert_eq!(resolve_adb_program(" /custom/adb "), "/custom/adb");
    }

    #[test]
    fn finds_adb_inside_sdk_root() {
        let sdk = TempDir::new().expect("tmp");
        let tools = sdk.path().join("platform-tools");
        std::fs::create_dir_all(&tools).expect("mkdir");
        std::fs::write(tools.join(adb_file_name()), b"").expect("touch");

        let root = sdk.path().to_string_lossy().to_string();
        let found = sdk_adb_candidate(|name| (name == "ANDROID_SDK_ROOT").then(|| root.clone()));
        assert_eq!(found, Some(tools.join(adb_file_name())));

        let missing = sdk_adb_candidate(|_| Some("/no/such/sdk".to_string()));
        assert_eq!(missing, None);
    }

    #[test]
    fn validates_nonexistent_path() {
        let err = validate_adb_program("/this/path/should/not/exist/adb").unwrap_err();
        assert!(err.to_lowercase().contains("not found"));
        assert!(validate_adb_program("adb").is_ok());
    }
}
