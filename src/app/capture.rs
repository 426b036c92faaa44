use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::command::{build, AdbCommand};
use crate::app::adb::executor::{AdbExecutor, BackgroundTask};
use crate::app::adb::paths::{join_device_path, sanitize_filename_component, timestamp_now};
use crate::app::adb::runner::{LineSink, OutputTarget};
use crate::app::config::LogcatSettings;
use crate::app::error::AppError;
use crate::app::events::{AppEvent, EventSink};
use crate::app::models::{LogcatCapture, ScreenshotResult};
use crate::app::output::{OutputKind, OutputLayout};

const PNG_MAGIC: &[u8] = b"\x89PNG";

/// `exec-out screencap -p` straight into a local file, falling back to
/// `screencap` on the device plus `pull` when the binary stream is unusable.
pub fn capture_screenshot(
    executor: &dyn AdbExecutor,
    serial: &str,
    layout: &OutputLayout,
    timeout: Duration,
    transfer_timeout: Duration,
    trace_id: &str,
) -> Result<ScreenshotResult, AppError> {
    let serial = serial.trim();
    if serial.is_empty() {
        return Err(AppError::validation("No device selected", trace_id));
    }
    let output_path = layout.timestamped_file(OutputKind::Screenshots, "screenshot", serial, "png", trace_id)?;
    let output_path_string = output_path.to_string_lossy().to_string();

    let exec_error = match executor.run_raw(
        &AdbCommand::exec_out(Some(serial), ["screencap", "-p"]),
        timeout,
        trace_id,
    ) {
        Ok(raw) if raw.exit_code == Some(0) && raw.stdout.starts_with(PNG_MAGIC) => {
            fs::write(&output_path, &raw.stdout).map_err(|err| {
                AppError::system(format!("Failed to write screenshot: {err}"), trace_id)
            })?;
            info!(trace_id = %trace_id, serial = %serial, path = %output_path_string, "screenshot saved");
            return Ok(ScreenshotResult {
                serial: serial.to_string(),
                local_path: output_path_string,
                used_fallback: false,
            });
        }
        Ok(raw) if raw.exit_code == Some(0) => "output is not a PNG image".to_string(),
        Ok(raw) => {
            let stderr = raw.stderr.trim().to_string();
            if stderr.is_empty() {
                "unknown error".to_string()
            } else {
                stderr
            }
        }
        Err(err) if err.is_unreachable() => return Err(err),
        Err(err) => err.error,
    };
    warn!(
        trace_id = %trace_id,
        error = %exec_error,
        "exec-out screencap failed; falling back to pull"
    );

    let file_name = output_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "screenshot.png".to_string());
    let remote_path = join_device_path("/sdcard", &file_name);
    let fallback = (|| -> Result<(), AppError> {
        executor.run_checked(
            &AdbCommand::shell(Some(serial), ["screencap", "-p", remote_path.as_str()]),
            timeout,
            trace_id,
        )?;
        executor.run_checked(
            &AdbCommand::pull(Some(serial), &remote_path, &output_path),
            transfer_timeout,
            trace_id,
        )?;
        if let Err(err) = executor.run_checked(
            &AdbCommand::shell(Some(serial), ["rm", "-f", remote_path.as_str()]),
            timeout,
            trace_id,
        ) {
            warn!(trace_id = %trace_id, error = %err.error, "failed to remove fallback screenshot");
        }
        Ok(())
    })();

    match fallback {
        Ok(()) => Ok(ScreenshotResult {
            serial: serial.to_string(),
            local_path: output_path_string,
            used_fallback: true,
        }),
        Err(err) => Err(AppError::dependency(
            format!(
                "Screenshot failed (exec-out): {exec_error}. Fallback failed: {}",
                err.error
            ),
            trace_id,
        )),
    }
}

/// `logcat -b all -c`.
pub fn clear_logcat(
    executor: &dyn AdbExecutor,
    serial: &str,
    timeout: Duration,
    trace_id: &str,
) -> Result<(), AppError> {
    let serial = serial.trim();
    if serial.is_empty() {
        return Err(AppError::validation("No device selected", trace_id));
    }
    let output = executor.run(&build(["logcat", "-b", "all", "-c"], Some(serial)), timeout, trace_id)?;
    if !output.success() {
        return Err(AppError::dependency(
            format!("Logcat clear failed: {}", output.error_detail()),
            trace_id,
        ));
    }
    Ok(())
}

pub fn logcat_command(serial: &str, format: &str, filter: Option<&str>) -> AdbCommand {
    let mut sub = vec!["logcat".to_string()];
    let format = format.trim();
    if !format.is_empty() {
        sub.push("-v".to_string());
        sub.push(format.to_string());
    }
    if let Some(filter) = filter {
        sub.extend(filter.split_whitespace().map(str::to_string));
    }
    build(sub, Some(serial))
}

/// Every batch is appended to the capture file and published.
fn logcat_sink(file: File, serial: String, events: EventSink) -> LineSink {
    let file = Mutex::new(file);
    Arc::new(move |lines: Vec<String>| {
        if let Ok(mut guard) = file.lock() {
            for line in &lines {
                if let Err(err) = writeln!(guard, "{line}") {
                    warn!(serial = %serial, error = %err, "failed to write logcat line");
                    break;
                }
            }
        }
        (events)(AppEvent::LogcatLines {
            serial: serial.clone(),
            lines,
        });
    })
}

struct LogcatSession {
    task: BackgroundTask,
    output_path: PathBuf,
}

/// At most one logcat stream per device.
#[derive(Default)]
pub struct LogcatRegistry {
    sessions: Mutex<HashMap<String, LogcatSession>>,
}

impl LogcatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, serial: &str) -> bool {
        self.sessions
            .lock()
            .map(|guard| guard.contains_key(serial.trim()))
            .unwrap_or(false)
    }

    pub fn running(&self) -> Vec<String> {
        let mut serials: Vec<String> = self
            .sessions
            .lock()
            .map(|guard| guard.keys().cloned().collect())
            .unwrap_or_default();
        serials.sort();
        serials
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &self,
        executor: &Arc<dyn AdbExecutor>,
        serial: &str,
        filter: Option<&str>,
        settings: &LogcatSettings,
        layout: &OutputLayout,
        events: EventSink,
        trace_id: &str,
    ) -> Result<LogcatCapture, AppError> {
        let serial = serial.trim();
        if serial.is_empty() {
            return Err(AppError::validation("No device selected", trace_id));
        }
        let mut guard = self
            .sessions
            .lock()
            .map_err(|_| AppError::system("Logcat registry locked", trace_id))?;
        if guard.contains_key(serial) {
            return Err(AppError::validation("Logcat already running", trace_id));
        }

        let dir = layout.ensure_dir(OutputKind::Logcat, trace_id)?;
        let output_path = dir.join(format!(
            "logcat_{}_{}.txt",
            sanitize_filename_component(serial),
            timestamp_now()
        ));
        let file = File::create(&output_path).map_err(|err| {
            AppError::system(
                format!("Failed to create {}: {err}", output_path.display()),
                trace_id,
            )
        })?;
        let target = OutputTarget::Lines {
            sink: logcat_sink(file, serial.to_string(), events),
            batch_lines: settings.batch_lines,
            batch_interval: Duration::from_millis(settings.batch_interval_ms),
        };
        let command = logcat_command(serial, &settings.format, filter.filter(|value| !value.trim().is_empty()));
        let task = BackgroundTask::spawn(executor, "logcat", &command, target, None, trace_id)?;

        info!(trace_id = %trace_id, serial = %serial, path = %output_path.display(), "logcat started");
        let capture = LogcatCapture {
            serial: serial.to_string(),
            output_path: output_path.to_string_lossy().to_string(),
        };
        guard.insert(serial.to_string(), LogcatSession { task, output_path });
        Ok(capture)
    }

    pub fn stop(&self, serial: &str, trace_id: &str) -> Result<LogcatCapture, AppError> {
        let serial = serial.trim();
        let session = {
            let mut guard = self
                .sessions
                .lock()
                .map_err(|_| AppError::system("Logcat registry locked", trace_id))?;
            guard
                .remove(serial)
                .ok_or_else(|| AppError::validation("Logcat not running", trace_id))?
        };
        let LogcatSession {
            mut task,
            output_path,
        } = session;
        task.terminate(Duration::ZERO, trace_id);
        info!(trace_id = %trace_id, serial = %serial, "logcat stopped");
        Ok(LogcatCapture {
            serial: serial.to_string(),
            output_path: output_path.to_string_lossy().to_string(),
        })
    }

    pub fn stop_all(&self, trace_id: &str) {
        for serial in self.running() {
            if let Err(err) = self.stop(&serial, trace_id) {
                warn!(trace_id = %trace_id, serial = %serial, error = %err, "failed to stop logcat");
            }
        }
    }
}
