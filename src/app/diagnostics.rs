use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use zip::write::SimpleFileOptions;

use crate::app::adb::command::AdbCommand;
use crate::app::adb::executor::AdbExecutor;
use crate::app::adb::parse::parse_adb_devices;
use crate::app::adb::paths::sanitize_filename_component;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::models::DeviceSummary;
use crate::app::state::ActivityRecord;

#[derive(Debug, Serialize)]
struct DiagnosticsManifest {
    app_version: &'static str,
    os: &'static str,
    arch: &'static str,
    timestamp_utc: String,
    trace_id: String,
    adb_program: String,
    local_playback_feature: bool,
}

#[derive(Debug, Default, Serialize)]
struct DevicesPayload {
    parsed: Vec<DeviceSummary>,
    raw_stdout: String,
    raw_stderr: String,
    exit_code: Option<i32>,
    error: Option<String>,
}

/// What goes into the bundle besides the live `adb devices` probe.
pub struct DiagnosticsInput<'a> {
    pub config: &'a AppConfig,
    pub history: &'a [ActivityRecord],
    pub selected_serial: Option<&'a str>,
}

fn collect_devices(executor: &dyn AdbExecutor, timeout: Duration, trace_id: &str) -> DevicesPayload {
    let mut payload = DevicesPayload::default();
    match executor.run(&AdbCommand::devices(), timeout, trace_id) {
        Ok(output) => {
            payload.exit_code = output.exit_code;
            payload.parsed = parse_adb_devices(&output.stdout);
            payload.raw_stdout = output.stdout;
            payload.raw_stderr = output.stderr;
        }
        Err(err) => {
            warn!(
                trace_id = %trace_id,
                error = %err.error,
                code = %err.code,
                "Failed to run adb devices for diagnostics"
            );
            payload.error = Some(err.error);
        }
    }
    payload
}

fn zip_error(err: impl std::fmt::Display, trace_id: &str) -> AppError {
    AppError::system(format!("Failed to write bundle: {err}"), trace_id)
}

fn to_json(value: &impl Serialize, trace_id: &str) -> Result<Vec<u8>, AppError> {
    serde_json::to_vec_pretty(value).map_err(|err| {
        AppError::system(format!("Failed to serialize diagnostics payload: {err}"), trace_id)
    })
}

/// Writes `diagnostics_<ts>_<trace>.zip` into `output_dir` with a manifest, the device
/// listing (raw and parsed), the effective config and recent test history. A missing
/// adb is recorded in the bundle, not treated as a failure.
pub fn export_diagnostics_bundle(
    executor: &dyn AdbExecutor,
    input: &DiagnosticsInput<'_>,
    output_dir: &Path,
    trace_id: &str,
) -> Result<PathBuf, AppError> {
    fs::create_dir_all(output_dir).map_err(|err| {
        AppError::system(format!("Failed to create output dir: {err}"), trace_id)
    })?;

    let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let trace_short = sanitize_filename_component(trace_id)
        .chars()
        .take(8)
        .collect::<String>();
    let bundle_path = output_dir.join(format!("diagnostics_{timestamp}_{trace_short}.zip"));

    let manifest = DiagnosticsManifest {
        app_version: env!("CARGO_PKG_VERSION"),
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        timestamp_utc: Utc::now().to_rfc3339(),
        trace_id: trace_id.to_string(),
        adb_program: executor.program().to_string(),
        local_playback_feature: cfg!(feature = "local-playback"),
    };
    let devices = collect_devices(
        executor,
        Duration::from_secs(input.config.adb.list_timeout_secs),
        trace_id,
    );

    let entries: Vec<(&str, Vec<u8>)> = vec![
        ("manifest.json", to_json(&manifest, trace_id)?),
        ("devices.json", to_json(&devices, trace_id)?),
        ("devices.txt", devices.raw_stdout.clone().into_bytes()),
        ("config.json", to_json(input.config, trace_id)?),
        (
            "history.json",
            to_json(
                &serde_json::json!({
                    "selected_serial": input.selected_serial,
                    "activities": input.history,
                }),
                trace_id,
            )?,
        ),
    ];

    let file = fs::File::create(&bundle_path)
        .map_err(|err| AppError::system(format!("Failed to create bundle: {err}"), trace_id))?;
    let mut zip = zip::ZipWriter::new(file);
    for (name, bytes) in entries {
        zip.start_file(name, SimpleFileOptions::default())
            .map_err(|err| zip_error(err, trace_id))?;
        zip.write_all(&bytes).map_err(|err| zip_error(err, trace_id))?;
    }
    zip.finish()
        .map_err(|err| AppError::system(format!("Failed to finalize bundle: {err}"), trace_id))?;

    info!(trace_id = %trace_id, path = %bundle_path.display(), "diagnostics bundle written");
    Ok(bundle_path)
}
