use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::app::error::AppError;

pub const CONFIG_PATH_ENV: &str = "ACOUTEST_CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdbSettings {
    pub command_path: String,
    pub list_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            command_path: String::new(),
            list_timeout_secs: 5,
            command_timeout_secs: 10,
            transfer_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputSettings {
    pub output_root: String,
    pub delete_remote_after_pull: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            output_root: String::new(),
            delete_remote_after_pull: true,
        }
    }
}

/// Default tinycap/tinyplay parameters. Kept as strings: they are handed to the
/// device tools verbatim and the tools decide what is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecordingSettings {
    pub card: String,
    pub device: String,
    pub channels: String,
    pub sample_rate: String,
    pub bits: String,
    pub period_size: String,
    pub playback_card: String,
    pub playback_device: String,
    pub remote_dir: String,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            card: "0".to_string(),
            device: "0".to_string(),
            channels: "2".to_string(),
            sample_rate: "48000".to_string(),
            bits: "16".to_string(),
            period_size: String::new(),
            playback_card: "0".to_string(),
            playback_device: "0".to_string(),
            remote_dir: "/sdcard".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    pub use_root: bool,
    pub disable_selinux: bool,
    pub recorder_startup_ms: u64,
    pub settle_ms: u64,
    pub stop_timeout_secs: u64,
    pub min_valid_bytes: u64,
    pub unique_remote_names: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            use_root: true,
            disable_selinux: true,
            recorder_startup_ms: 2000,
            settle_ms: 2000,
            stop_timeout_secs: 5,
            min_valid_bytes: 1000,
            unique_remote_names: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HalPropertyConfig {
    pub name: String,
    pub value: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HalSettings {
    pub dump_dir: String,
    pub clear_dump_dir_on_start: bool,
    pub properties: Vec<HalPropertyConfig>,
}

impl Default for HalSettings {
    fn default() -> Self {
        Self {
            dump_dir: "/data/vendor/audiohal/audio_dump".to_string(),
            clear_dump_dir_on_start: true,
            properties: vec![
                HalPropertyConfig {
                    name: "vendor.audio.hal.dump.output".to_string(),
                    value: "1".to_string(),
                    enabled: true,
                },
                HalPropertyConfig {
                    name: "vendor.audio.hal.dump.input".to_string(),
                    value: "1".to_string(),
                    enabled: true,
                },
                HalPropertyConfig {
                    name: "vendor.audio.hal.dump.effect".to_string(),
                    value: "1".to_string(),
                    enabled: false,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SweepSettings {
    pub remote_dir: String,
    pub record_padding_secs: u64,
    pub play_margin_secs: u64,
    pub pause_between_ms: u64,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            remote_dir: "/sdcard/sweep".to_string(),
            record_padding_secs: 2,
            play_margin_secs: 10,
            pause_between_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogcatSettings {
    pub format: String,
    pub batch_lines: usize,
    pub batch_interval_ms: u64,
}

impl Default for LogcatSettings {
    fn default() -> Self {
        Self {
            format: "threadtime".to_string(),
            batch_lines: 50,
            batch_interval_ms: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub recording: RecordingSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub hal: HalSettings,
    #[serde(default)]
    pub sweep: SweepSettings,
    #[serde(default)]
    pub logcat: LogcatSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adb: AdbSettings::default(),
            output: OutputSettings::default(),
            recording: RecordingSettings::default(),
            session: SessionSettings::default(),
            hal: HalSettings::default(),
            sweep: SweepSettings::default(),
            logcat: LogcatSettings::default(),
            logging: LoggingSettings::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    home_dir().join(".acoutest_config.json")
}

pub fn backup_config_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "acoutest_config".to_string());
    name.push_str(".backup.json");
    path.with_file_name(name)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), trace_id))?;
    let config = recover_config(&value, trace_id)?;
    let config = apply_legacy_overrides(config, &value);
    Ok(validate_config(config))
}

/// Reads every field that fits its type. A mistyped field is dropped with a warning
/// and keeps its default, so one bad value does not discard the rest of the file.
fn recover_config(value: &Value, trace_id: &str) -> Result<AppConfig, AppError> {
    if let Ok(config) = serde_json::from_value::<AppConfig>(value.clone()) {
        return Ok(config);
    }
    let Some(sections) = value.as_object() else {
        return Err(AppError::validation("Config file must hold a JSON object", trace_id));
    };
    let mut accepted = match serde_json::to_value(AppConfig::default()) {
        Ok(Value::Object(map)) => map,
        _ => return Err(AppError::system("Failed to build default config", trace_id)),
    };

    for (section, raw) in sections {
        let Some(current) = accepted.get(section).cloned() else {
            continue;
        };
        match (current, raw) {
            (Value::Object(defaults), Value::Object(fields)) => {
                let mut merged = defaults;
                for (field, field_value) in fields {
                    let previous = merged.insert(field.clone(), field_value.clone());
                    accepted.insert(section.clone(), Value::Object(merged.clone()));
                    if let Err(err) = serde_json::from_value::<AppConfig>(Value::Object(accepted.clone())) {
                        warn!(trace_id = %trace_id, key = %format!("{section}.{field}"), error = %err, "ignoring invalid config value");
                        match previous {
                            Some(old) => merged.insert(field.clone(), old),
                            None => merged.remove(field),
                        };
                    }
                }
                accepted.insert(section.clone(), Value::Object(merged));
            }
            (current, raw) => {
                accepted.insert(section.clone(), raw.clone());
                if let Err(err) = serde_json::from_value::<AppConfig>(Value::Object(accepted.clone())) {
                    warn!(trace_id = %trace_id, key = %section, error = %err, "ignoring invalid config value");
                    accepted.insert(section.clone(), current);
                }
            }
        }
    }

    serde_json::from_value(Value::Object(accepted))
        .map_err(|err| AppError::validation(format!("Invalid config: {err}"), trace_id))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), trace_id))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    Ok(())
}

// Early builds stored a flat layout; keep reading those keys.
fn apply_legacy_overrides(mut config: AppConfig, value: &Value) -> AppConfig {
    if let Some(output_path) = value.get("output_path").and_then(|v| v.as_str()) {
        if config.output.output_root.trim().is_empty() {
            config.output.output_root = output_path.to_string();
        }
    }
    if let Some(adb_path) = value.get("adb_path").and_then(|v| v.as_str()) {
        if config.adb.command_path.trim().is_empty() {
            config.adb.command_path = adb_path.to_string();
        }
    }
    if let Some(props) = value.get("hal_props").and_then(|v| v.as_object()) {
        let parsed = props
            .iter()
            .filter_map(|(name, prop_value)| {
                prop_value.as_str().map(|prop_value| HalPropertyConfig {
                    name: name.clone(),
                    value: prop_value.to_string(),
                    enabled: true,
                })
            })
            .collect::<Vec<_>>();
        if !parsed.is_empty() {
            config.hal.properties = parsed;
        }
    }
    config
}

pub fn validate_config(mut config: AppConfig) -> AppConfig {
    let defaults = AppConfig::default();
    if config.adb.list_timeout_secs == 0 {
        config.adb.list_timeout_secs = defaults.adb.list_timeout_secs;
    }
    if config.adb.command_timeout_secs == 0 {
        config.adb.command_timeout_secs = defaults.adb.command_timeout_secs;
    }
    if config.adb.transfer_timeout_secs < config.adb.command_timeout_secs {
        config.adb.transfer_timeout_secs = defaults
            .adb
            .transfer_timeout_secs
            .max(config.adb.command_timeout_secs);
    }
    if config.session.settle_ms > 30_000 {
        config.session.settle_ms = defaults.session.settle_ms;
    }
    if config.session.recorder_startup_ms > 30_000 {
        config.session.recorder_startup_ms = defaults.session.recorder_startup_ms;
    }
    if config.session.stop_timeout_secs == 0 {
        config.session.stop_timeout_secs = defaults.session.stop_timeout_secs;
    }
    if config.recording.remote_dir.trim().is_empty() || !config.recording.remote_dir.starts_with('/') {
        config.recording.remote_dir = defaults.recording.remote_dir;
    }
    if config.sweep.remote_dir.trim().is_empty() || !config.sweep.remote_dir.starts_with('/') {
        config.sweep.remote_dir = defaults.sweep.remote_dir;
    }
    if config.logcat.batch_lines == 0 {
        config.logcat.batch_lines = defaults.logcat.batch_lines;
    }
    if config.logcat.batch_interval_ms < 10 {
        config.logcat.batch_interval_ms = defaults.logcat.batch_interval_ms;
    }
    config
        .hal
        .properties
        .retain(|prop| !prop.name.trim().is_empty());
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn merges_legacy_values() {
        let value = serde_json::json!({
            "output_path": "/tmp/out",
            "adb_path": "/opt/platform-tools/adb",
            "hal_props": { "vendor.audio.dump": "1" }
        });
        let mut config: AppConfig = serde_json::from_value(value.clone()).unwrap_or_default();
        config = apply_legacy_overrides(config, &value);
        assert_eq!(config.output.output_root, "/tmp/out");
        assert_eq!(config.adb.command_path, "/opt/platform-tools/adb");
        assert_eq!(config.hal.properties.len(), 1);
        assert_eq!(config.hal.properties[0].name, "vendor.audio.dump");
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = AppConfig::default();
        config.adb.list_timeout_secs = 0;
        config.session.settle_ms = 600_000;
        config.recording.remote_dir = "sdcard".to_string();
        config.logcat.batch_lines = 0;
        config.hal.properties.push(HalPropertyConfig {
            name: "  ".to_string(),
            value: "1".to_string(),
            enabled: true,
        });
        let validated = validate_config(config);
        assert_eq!(validated.adb.list_timeout_secs, 5);
        assert_eq!(validated.session.settle_ms, 2000);
        assert_eq!(validated.recording.remote_dir, "/sdcard");
        assert_eq!(validated.logcat.batch_lines, 50);
        assert!(validated.hal.properties.iter().all(|p| !p.name.trim().is_empty()));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"session": {"settle_ms": 500}}"#).expect("write");
        let config = load_config_from_path(&path, "trace-cfg").expect("load");
        assert_eq!(config.session.settle_ms, 500);
        assert_eq!(config.session.min_valid_bytes, 1000);
        assert_eq!(config.recording.sample_rate, "48000");
    }

    #[test]
    fn mistyped_field_keeps_the_rest_of_the_file() {
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "output": {"output_root": "/data/qa"},
                "hal": {"dump_dir": "/data/vendor/qa_dump"},
                "session": {"settle_ms": "500", "min_valid_bytes": 4096}
            }"#,
        )
        .expect("write");

        let config = load_config_from_path(&path, "trace-cfg").expect("load");

        assert_eq!(config.output.output_root, "/data/qa");
        assert_eq!(config.hal.dump_dir, "/data/vendor/qa_dump");
        assert_eq!(config.session.min_valid_bytes, 4096);
        assert_eq!(config.session.settle_ms, SessionSettings::default().settle_ms);
    }

    #[test]
    fn non_object_file_is_rejected() {
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("config.json");
        fs::write(&path, "[1, 2, 3]").expect("write");
        let err = load_config_from_path(&path, "trace-cfg").expect_err("array");
        assert_eq!(err.code, crate::app::error::ERR_VALIDATION);
    }

    #[test]
    fn save_keeps_backup_of_previous_file() {
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("config.json");
        let backup = backup_config_path(&path);
        let mut config = AppConfig::default();
        save_config_to_path(&config, &path, &backup, "t").expect("first save");
        assert!(!backup.exists());

        config.output.output_root = "/tmp/acoutest".to_string();
        save_config_to_path(&config, &path, &backup, "t").expect("second save");
        assert!(backup.exists());
        let reloaded = load_config_from_path(&path, "t").expect("reload");
        assert_eq!(reloaded.output.output_root, "/tmp/acoutest");
    }
}
