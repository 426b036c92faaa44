//! The API a presentation layer binds to. Every call takes an optional trace id
//! (generated when absent) and answers with a [`CommandResponse`] carrying it.
//! Long-running work is started here and reported through [`AppState::events`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::adb::command::AdbCommand;
use crate::app::adb::locator::validate_adb_program;
use crate::app::capture;
use crate::app::config::{backup_config_path, save_config_to_path, validate_config, AppConfig};
use crate::app::diagnostics::{self, DiagnosticsInput};
use crate::app::error::AppError;
use crate::app::hal::{HalProperty, HalPropertySet};
use crate::app::models::{
    AdbInfo, CommandResponse, HostCommandResult, LogcatCapture, RefreshStatus, ScreenshotResult,
};
use crate::app::playback::PlaybackStatus;
use crate::app::remote::{self, normalize_keycode, RemoteAction};
use crate::app::session::presets::{
    hal_dump_plan, loopback_plan, microphone_plan, multichannel_plan, CaptureParams, PlaybackParams,
};
use crate::app::session::{SessionKind, SessionPlan, SessionSnapshot, SessionTiming, StopOutcome, StopReport};
use crate::app::state::{ActivityRecord, AppState};
use crate::app::sweep::{self, list_sweep_files, SweepRequest, SweepSummary, SweepTiming};


fn resolve_trace_id(input: Option<String>) -> String {
    input
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn ensure_non_empty(value: &str, field: &str, trace_id: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::validation(
            format!("{field} is required"),
            trace_id,
        ));
    }
    Ok(())
}

fn respond<T>(trace_id: String, data: T) -> Result<CommandResponse<T>, AppError> {
    Ok(CommandResponse { trace_id, data })
}

fn list_timeout(config: &AppConfig) -> Duration {
    Duration::from_secs(config.adb.list_timeout_secs)
}

fn command_timeout(config: &AppConfig) -> Duration {
    Duration::from_secs(config.adb.command_timeout_secs)
}

/// An explicit serial wins; otherwise the registry's selection, refreshing once when
/// nothing is selected yet.
fn resolve_serial(
    state: &AppState,
    config: &AppConfig,
    serial: Option<String>,
    trace_id: &str,
) -> Result<String, AppError> {
    if let Some(serial) = serial.map(|value| value.trim().to_string()).filter(|value| !value.is_empty()) {
        return Ok(serial);
    }
    let mut registry = state
        .registry
        .lock()
        .map_err(|_| AppError::system("Device registry locked", trace_id))?;
    registry.ensure_selected(state.executor.as_ref(), list_timeout(config), trace_id)
}

pub fn get_config(state: &AppState, trace_id: Option<String>) -> Result<CommandResponse<AppConfig>, AppError> {
    respond(resolve_trace_id(trace_id), state.config())
}

/// Clamps, persists (keeping a backup of the previous file) and applies to later calls.
/// Tests already running keep the timing they started with.
pub fn save_app_config(
    state: &AppState,
    config: AppConfig,
    trace_id: Option<String>,
) -> Result<CommandResponse<AppConfig>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = validate_config(config);
    let path = state.config_path();
    save_config_to_path(&config, path, &backup_config_path(path), &trace_id)?;
    state.replace_config(config.clone());
    info!(trace_id = %trace_id, path = %path.display(), "config saved");
    respond(trace_id, config)
}

pub fn reset_config(state: &AppState, trace_id: Option<String>) -> Result<CommandResponse<AppConfig>, AppError> {
    save_app_config(state, AppConfig::default(), trace_id)
}

pub fn check_adb(state: &AppState, trace_id: Option<String>) -> Result<CommandResponse<AdbInfo>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "check_adb");
    let program = state.executor.program().to_string();

    if let Err(message) = validate_adb_program(&program) {
        warn!(trace_id = %trace_id, error = %message, "adb validation failed");
        return respond(
            trace_id,
            AdbInfo {
                available: false,
                version_output: String::new(),
                command_path: program,
                error: Some(message),
            },
        );
    }

    let config = state.config();
    let output = match state.executor.run(&AdbCommand::version(), list_timeout(&config), &trace_id) {
        Ok(output) => output,
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err.error, "adb check failed");
            return respond(
                trace_id,
                AdbInfo {
                    available: false,
                    version_output: String::new(),
                    command_path: program,
                    error: Some(err.error),
                },
            );
        }
    };

    let available = output.success();
    let error = if available {
        None
    } else if output.stderr.trim().is_empty() {
        Some("ADB command returned a non-zero exit code".to_string())
    } else {
        Some(output.stderr.trim().to_string())
    };
    respond(
        trace_id,
        AdbInfo {
            available,
            version_output: output.combined().trim().to_string(),
            command_path: program,
            error,
        },
    )
}

pub fn refresh_devices(state: &AppState, trace_id: Option<String>) -> Result<CommandResponse<RefreshStatus>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = state.config();
    let mut registry = state
        .registry
        .lock()
        .map_err(|_| AppError::system("Device registry locked", &trace_id))?;
    let status = registry.refresh(state.executor.as_ref(), list_timeout(&config), &trace_id);
    drop(registry);
    respond(trace_id, status)
}

pub fn select_device(
    state: &AppState,
    serial: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<Option<String>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&serial, "serial", &trace_id)?;
    let mut registry = state
        .registry
        .lock()
        .map_err(|_| AppError::system("Device registry locked", &trace_id))?;
    registry.select(&serial);
    let selected = registry.selected().map(str::to_string);
    drop(registry);
    info!(trace_id = %trace_id, selected = ?selected, "device selected");
    respond(trace_id, selected)
}

pub fn connect_device(
    state: &AppState,
    address: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<HostCommandResult>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = state.config();
    let mut registry = state
        .registry
        .lock()
        .map_err(|_| AppError::system("Device registry locked", &trace_id))?;
    let result = registry.connect_network(
        state.executor.as_ref(),
        &address,
        command_timeout(&config),
        list_timeout(&config),
        &trace_id,
    )?;
    drop(registry);
    respond(trace_id, result)
}

/// What to run. Unset parameter blocks fall back to the configured recording settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestRequest {
    Loopback {
        audio_file: String,
        capture: Option<CaptureParams>,
        playback: Option<PlaybackParams>,
    },
    Microphone {
        capture: Option<CaptureParams>,
    },
    Multichannel {
        audio_file: String,
        playback: Option<PlaybackParams>,
    },
    HalDump {
        /// Applied over the configured property set; an entry with the same name replaces it.
        #[serde(default)]
        properties: Vec<HalProperty>,
    },
}

impl TestRequest {
    pub fn kind(&self) -> SessionKind {
        match self {
            TestRequest::Loopback { .. } => SessionKind::Loopback,
            TestRequest::Microphone { .. } => SessionKind::Microphone,
            TestRequest::Multichannel { .. } => SessionKind::Multichannel,
            TestRequest::HalDump { .. } => SessionKind::HalDump,
        }
    }
}

fn plan_for(config: &AppConfig, request: TestRequest, trace_id: &str) -> Result<SessionPlan, AppError> {
    let capture_or_default =
        |capture: Option<CaptureParams>| capture.unwrap_or_else(|| CaptureParams::from_settings(&config.recording));
    let playback_or_default =
        |playback: Option<PlaybackParams>| playback.unwrap_or_else(|| PlaybackParams::from_settings(&config.recording));

    let plan = match request {
        TestRequest::Loopback {
            audio_file,
            capture,
            playback,
        } => {
            ensure_non_empty(&audio_file, "audio_file", trace_id)?;
            loopback_plan(
                config,
                Path::new(audio_file.trim()),
                &capture_or_default(capture),
                &playback_or_default(playback),
            )
        }
        TestRequest::Microphone { capture } => microphone_plan(config, &capture_or_default(capture)),
        TestRequest::Multichannel { audio_file, playback } => {
            ensure_non_empty(&audio_file, "audio_file", trace_id)?;
            multichannel_plan(config, Path::new(audio_file.trim()), &playback_or_default(playback))
        }
        TestRequest::HalDump { properties } => {
            let mut set = HalPropertySet::from_config(&config.hal.properties);
            for prop in &properties {
                set.set(&prop.name, &prop.value, prop.enabled);
            }
            if !set.is_active() {
                return Err(AppError::validation("No HAL property enabled", trace_id));
            }
            hal_dump_plan(config, set)
        }
    };
    Ok(plan)
}

pub fn start_test(
    state: &AppState,
    request: TestRequest,
    serial: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<SessionSnapshot>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let kind = request.kind();
    info!(trace_id = %trace_id, kind = kind.label(), "start_test");

    let config = state.config();
    let plan = plan_for(&config, request, &trace_id)?;
    let session = state
        .session(kind)
        .ok_or_else(|| AppError::system(format!("No {} session", kind.label()), &trace_id))?;
    let serial = resolve_serial(state, &config, serial, &trace_id)?;

    let snapshot = state.scheduler.with_device(&serial, || {
        session.start(&serial, plan, SessionTiming::from_config(&config), &trace_id)
    })?;
    respond(trace_id, snapshot)
}

/// `None` when the test was not running. Finished runs, good or bad, go into the
/// activity history.
pub fn stop_test(
    state: &AppState,
    kind: SessionKind,
    trace_id: Option<String>,
) -> Result<CommandResponse<Option<StopReport>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, kind = kind.label(), "stop_test");
    let session = state
        .session(kind)
        .ok_or_else(|| AppError::system(format!("No {} session", kind.label()), &trace_id))?;
    let layout = state.layout();

    let serial = session.snapshot().serial;
    let outcome = match serial.as_deref() {
        Some(serial) => state
            .scheduler
            .with_device(serial, || session.stop(&layout, &trace_id)),
        None => session.stop(&layout, &trace_id),
    };

    let serial = serial.unwrap_or_default();
    match outcome {
        Ok(StopOutcome::NotRunning) => respond(trace_id, None),
        Ok(StopOutcome::Completed(report)) => {
            state.record(ActivityRecord::new(
                kind.label(),
                &report.serial,
                &trace_id,
                Ok(report.local_paths.clone()),
            ));
            respond(trace_id, Some(report))
        }
        Err(err) => {
            state.record(ActivityRecord::new(kind.label(), &serial, &trace_id, Err(&err)));
            Err(err)
        }
    }
}

pub fn session_snapshots(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<SessionSnapshot>>, AppError> {
    respond(
        resolve_trace_id(trace_id),
        state.sessions().map(|session| session.snapshot()).collect(),
    )
}

/// Current device-side values of the configured HAL properties.
pub fn read_hal_properties(
    state: &AppState,
    serial: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<HashMap<String, String>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = state.config();
    let serial = resolve_serial(state, &config, serial, &trace_id)?;
    let set = HalPropertySet::from_config(&config.hal.properties);
    let values = set.read_back(
        state.executor.as_ref(),
        Some(&serial),
        command_timeout(&config),
        &trace_id,
    )?;
    respond(trace_id, values)
}

pub fn capture_screenshot(
    state: &AppState,
    serial: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<ScreenshotResult>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = state.config();
    let serial = resolve_serial(state, &config, serial, &trace_id)?;
    let layout = state.layout();
    let result = state.scheduler.with_device(&serial, || {
        capture::capture_screenshot(
            state.executor.as_ref(),
            &serial,
            &layout,
            command_timeout(&config),
            Duration::from_secs(config.adb.transfer_timeout_secs),
            &trace_id,
        )
    })?;
    state.record(ActivityRecord::new(
        "screenshot",
        &serial,
        &trace_id,
        Ok(vec![result.local_path.clone()]),
    ));
    respond(trace_id, result)
}

pub fn start_logcat(
    state: &AppState,
    serial: Option<String>,
    filter: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<LogcatCapture>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = state.config();
    let serial = resolve_serial(state, &config, serial, &trace_id)?;
    let capture = state.logcat.start(
        &state.executor,
        &serial,
        filter.as_deref(),
        &config.logcat,
        &state.layout(),
        state.events.clone(),
        &trace_id,
    )?;
    respond(trace_id, capture)
}

pub fn stop_logcat(
    state: &AppState,
    serial: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<LogcatCapture>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = state.config();
    let serial = resolve_serial(state, &config, serial, &trace_id)?;
    let capture = state.logcat.stop(&serial, &trace_id)?;
    respond(trace_id, capture)
}

pub fn clear_logcat(
    state: &AppState,
    serial: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<()>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = state.config();
    let serial = resolve_serial(state, &config, serial, &trace_id)?;
    capture::clear_logcat(state.executor.as_ref(), &serial, command_timeout(&config), &trace_id)?;
    respond(trace_id, ())
}

pub fn send_remote_action(
    state: &AppState,
    serial: Option<String>,
    action: RemoteAction,
    trace_id: Option<String>,
) -> Result<CommandResponse<HostCommandResult>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = state.config();
    let serial = resolve_serial(state, &config, serial, &trace_id)?;
    let result = remote::send(
        state.executor.as_ref(),
        &serial,
        &action,
        command_timeout(&config),
        &trace_id,
    )?;
    respond(trace_id, result)
}

/// Accepts aliases such as `play` or `volume up`, bare key names and numeric codes.
pub fn send_keyevent(
    state: &AppState,
    serial: Option<String>,
    key: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<HostCommandResult>, AppError> {
    let trace = resolve_trace_id(trace_id);
    let keycode = normalize_keycode(&key).ok_or_else(|| AppError::validation("key is required", &trace))?;
    send_remote_action(state, serial, RemoteAction::KeyEvent(keycode), Some(trace))
}

pub fn play_on_host(
    state: &AppState,
    audio_file: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<PlaybackStatus>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&audio_file, "audio_file", &trace_id)?;
    state.playback.play(Path::new(audio_file.trim()), &trace_id)?;
    respond(trace_id, state.playback.status())
}

pub fn stop_host_playback(state: &AppState, trace_id: Option<String>) -> Result<CommandResponse<bool>, AppError> {
    respond(resolve_trace_id(trace_id), state.playback.stop())
}

pub fn playback_status(state: &AppState, trace_id: Option<String>) -> Result<CommandResponse<PlaybackStatus>, AppError> {
    respond(resolve_trace_id(trace_id), state.playback.status())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SweepStartRequest {
    /// Explicit files; when empty every `.wav` in `dir` is used.
    pub files: Vec<String>,
    pub dir: Option<String>,
    pub capture: Option<CaptureParams>,
    pub playback: Option<PlaybackParams>,
    pub batch_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SweepStatus {
    pub running: bool,
    pub batch_dir: Option<String>,
    pub total: usize,
}

fn sweep_status_of(slot: &Option<sweep::SweepHandle>) -> SweepStatus {
    match slot {
        Some(handle) => SweepStatus {
            running: !handle.is_finished(),
            batch_dir: Some(handle.batch_dir().to_string_lossy().to_string()),
            total: handle.total(),
        },
        None => SweepStatus {
            running: false,
            batch_dir: None,
            total: 0,
        },
    }
}

pub fn start_sweep(
    state: &AppState,
    request: SweepStartRequest,
    serial: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<SweepStatus>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "start_sweep");
    let config = state.config();

    let files: Vec<PathBuf> = if request.files.iter().any(|file| !file.trim().is_empty()) {
        request
            .files
            .iter()
            .map(|file| file.trim())
            .filter(|file| !file.is_empty())
            .map(PathBuf::from)
            .collect()
    } else {
        let dir = request.dir.clone().unwrap_or_default();
        ensure_non_empty(&dir, "dir", &trace_id)?;
        list_sweep_files(Path::new(dir.trim()), &trace_id)?
    };
    let serial = resolve_serial(state, &config, serial, &trace_id)?;

    let mut slot = state
        .sweep
        .lock()
        .map_err(|_| AppError::system("Sweep state locked", &trace_id))?;
    if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
        return Err(AppError::validation("Sweep already running", &trace_id));
    }
    if let Some(previous) = slot.take() {
        if let Err(err) = previous.join(&trace_id) {
            warn!(trace_id = %trace_id, error = %err, "previous sweep ended abnormally");
        }
    }

    let sweep_request = SweepRequest {
        serial: serial.clone(),
        files,
        capture: request
            .capture
            .unwrap_or_else(|| CaptureParams::from_settings(&config.recording)),
        playback: request
            .playback
            .unwrap_or_else(|| PlaybackParams::from_settings(&config.recording)),
        batch_name: request.batch_name,
    };
    let handle = state.scheduler.with_device(&serial, || {
        sweep::start_sweep(
            state.executor.clone(),
            &state.layout(),
            sweep_request,
            SweepTiming::from_config(&config),
            state.events.clone(),
            &trace_id,
        )
    })?;
    *slot = Some(handle);
    let status = sweep_status_of(&slot);
    drop(slot);
    respond(trace_id, status)
}

/// Asks the batch to end after the item in flight; does not wait for it.
pub fn stop_sweep(state: &AppState, trace_id: Option<String>) -> Result<CommandResponse<SweepStatus>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let slot = state
        .sweep
        .lock()
        .map_err(|_| AppError::system("Sweep state locked", &trace_id))?;
    if let Some(handle) = slot.as_ref() {
        handle.request_stop();
        info!(trace_id = %trace_id, "sweep stop requested");
    }
    let status = sweep_status_of(&slot);
    drop(slot);
    respond(trace_id, status)
}

pub fn sweep_status(state: &AppState, trace_id: Option<String>) -> Result<CommandResponse<SweepStatus>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let slot = state
        .sweep
        .lock()
        .map_err(|_| AppError::system("Sweep state locked", &trace_id))?;
    let status = sweep_status_of(&slot);
    drop(slot);
    respond(trace_id, status)
}

/// Blocks until the current batch ends and returns its summary. Meant for headless runs.
pub fn wait_sweep(state: &AppState, trace_id: Option<String>) -> Result<CommandResponse<SweepSummary>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let handle = state
        .sweep
        .lock()
        .map_err(|_| AppError::system("Sweep state locked", &trace_id))?
        .take()
        .ok_or_else(|| AppError::validation("No sweep started", &trace_id))?;
    let serial = handle.serial().to_string();
    let summary = handle.join(&trace_id)?;
    let paths = summary
        .items
        .iter()
        .filter_map(|item| item.local_path.clone())
        .collect::<Vec<_>>();
    let result = if summary.failed() == 0 {
        Ok(paths)
    } else {
        Err(AppError::result(
            format!("{} of {} sweep items failed", summary.failed(), summary.items.len()),
            &trace_id,
        ))
    };
    state.record(ActivityRecord::new("sweep", &serial, &trace_id, result.as_ref().cloned()));
    respond(trace_id, summary)
}

pub fn export_diagnostics(
    state: &AppState,
    output_dir: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<String>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "export_diagnostics");
    let config = state.config();
    let output_dir = output_dir
        .map(|dir| dir.trim().to_string())
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| state.layout().root().join("diagnostics"));
    let history = state.history();
    let selected = state
        .registry
        .lock()
        .ok()
        .and_then(|registry| registry.selected().map(str::to_string));

    let bundle_path = diagnostics::export_diagnostics_bundle(
        state.executor.as_ref(),
        &DiagnosticsInput {
            config: &config,
            history: &history,
            selected_serial: selected.as_deref(),
        },
        &output_dir,
        &trace_id,
    )?;
    respond(trace_id, bundle_path.to_string_lossy().to_string())
}
