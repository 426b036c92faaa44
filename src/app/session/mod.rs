//! One parametrized recording session drives every on-device test procedure.
//!
//! A [`SessionPlan`] says what to prepare, which tools to launch and what to collect;
//! [`RecordingSession`] runs the plan through
//! `Idle -> Preparing -> Running -> Stopping -> Idle`, publishing each transition as an
//! [`AppEvent`]. Any failure returns the session to `Idle`.

pub mod presets;


use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::app::adb::command::{quote_device_arg, AdbCommand};
use crate::app::adb::executor::{AdbExecutor, BackgroundTask};
use crate::app::adb::parse::{
    is_missing_file_message, parse_ls_la, parse_remote_file_check, RemoteFileCheck,
};
use crate::app::adb::paths::validate_device_path;
use crate::app::adb::runner::OutputTarget;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::events::{AppEvent, EventSink};
use crate::app::hal::HalPropertySet;
use crate::app::output::{OutputKind, OutputLayout};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Loopback,
    Microphone,
    Multichannel,
    HalDump,
}

impl SessionKind {
    pub const ALL: [SessionKind; 4] = [
        SessionKind::Loopback,
        SessionKind::Microphone,
        SessionKind::Multichannel,
        SessionKind::HalDump,
    ];

    pub fn label(self) -> &'static str {
        match self {
            SessionKind::Loopback => "loopback",
            SessionKind::Microphone => "mic",
            SessionKind::Multichannel => "multichannel",
            SessionKind::HalDump => "hal-dump",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "loopback" | "ref" | "loopback-ref" => Some(SessionKind::Loopback),
            "mic" | "microphone" => Some(SessionKind::Microphone),
            "multichannel" | "play" => Some(SessionKind::Multichannel),
            "hal-dump" | "hal_dump" | "hal" => Some(SessionKind::HalDump),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Preparing,
    Running,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupStep {
    /// `adb root` followed by `wait-for-device`; skipped with a warning on user builds.
    Root,
    /// `setenforce 0`; best effort like `Root`.
    DisableSelinux,
    MakeDir(String),
    /// Removes the contents of a remote directory, keeping the directory.
    ClearDir(String),
    Push { local: PathBuf, remote: String },
}

/// A device-side tool run through `adb shell` for the lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub label: String,
    pub command: Vec<String>,
    pub kill_name: String,
    pub kill_signal: Option<String>,
}

impl LaunchSpec {
    pub fn launch_command(&self, serial: &str) -> AdbCommand {
        AdbCommand::shell(Some(serial), self.command.iter().cloned())
    }

    pub fn kill_command(&self, serial: &str) -> AdbCommand {
        let mut args = vec!["killall".to_string()];
        if let Some(signal) = &self.kill_signal {
            args.push(format!("-{}", signal.trim_start_matches('-')));
        }
        args.push(self.kill_name.clone());
        AdbCommand::shell(Some(serial), args)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSpec {
    None,
    File {
        remote_path: String,
        output: OutputKind,
        prefix: String,
        extension: String,
    },
    Directory {
        remote_dir: String,
        output: OutputKind,
    },
}

impl ArtifactSpec {
    pub fn remote_location(&self) -> Option<&str> {
        match self {
            ArtifactSpec::None => None,
            ArtifactSpec::File { remote_path, .. } => Some(remote_path),
            ArtifactSpec::Directory { remote_dir, .. } => Some(remote_dir),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPlan {
    pub kind: SessionKind,
    pub setup: Vec<SetupStep>,
    pub hal: HalPropertySet,
    pub recorder: Option<LaunchSpec>,
    pub player: Option<LaunchSpec>,
    pub artifact: ArtifactSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTiming {
    pub recorder_startup: Duration,
    pub settle: Duration,
    pub stop_grace: Duration,
    pub command_timeout: Duration,
    pub transfer_timeout: Duration,
    pub min_valid_bytes: u64,
    pub delete_remote_after_pull: bool,
}

impl SessionTiming {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            recorder_startup: Duration::from_millis(config.session.recorder_startup_ms),
            settle: Duration::from_millis(config.session.settle_ms),
            stop_grace: Duration::from_secs(config.session.stop_timeout_secs),
            command_timeout: Duration::from_secs(config.adb.command_timeout_secs),
            transfer_timeout: Duration::from_secs(config.adb.transfer_timeout_secs),
            min_valid_bytes: config.session.min_valid_bytes,
            delete_remote_after_pull: config.output.delete_remote_after_pull,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopReport {
    pub serial: String,
    pub local_paths: Vec<String>,
    pub remote_path: Option<String>,
    pub size_bytes: u64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Completed(StopReport),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub kind: SessionKind,
    pub phase: SessionPhase,
    pub serial: Option<String>,
    pub remote_artifact: Option<String>,
    pub started_at: Option<String>,
    pub status: String,
}

struct RunningSession {
    serial: String,
    plan: SessionPlan,
    timing: SessionTiming,
    tasks: Vec<BackgroundTask>,
    started_at: String,
}

enum SessionState {
    Idle,
    Preparing { serial: String },
    Running(RunningSession),
    Stopping { serial: String },
}

impl SessionState {
    fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Preparing { .. } => SessionPhase::Preparing,
            SessionState::Running(_) => SessionPhase::Running,
            SessionState::Stopping { .. } => SessionPhase::Stopping,
        }
    }
}

pub struct RecordingSession {
    kind: SessionKind,
    executor: Arc<dyn AdbExecutor>,
    events: EventSink,
    state: Mutex<SessionState>,
    status: Mutex<String>,
}

impl RecordingSession {
    pub fn new(
        kind: SessionKind,
        executor: Arc<dyn AdbExecutor>,
        events: EventSink,
    ) -> Self {
        Self {
            kind,
            executor,
            events,
            state: Mutex::new(SessionState::Idle),
            status: Mutex::new("Idle".to_string()),
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    fn lock_state(&self, trace_id: &str) -> Result<MutexGuard<'_, SessionState>, AppError> {
        self.state
            .lock()
            .map_err(|_| AppError::system("Session state locked", trace_id))
    }

    fn set_state(&self, next: SessionState) {
        match self.state.lock() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.state
            .lock()
            .map(|guard| guard.phase())
            .unwrap_or(SessionPhase::Idle)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self
            .status
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        let (phase, serial, remote_artifact, started_at) = match self.state.lock() {
            Ok(guard) => match &*guard {
                SessionState::Idle => (SessionPhase::Idle, None, None, None),
                SessionState::Preparing { serial } => {
                    (SessionPhase::Preparing, Some(serial.clone()), None, None)
                }
                SessionState::Running(running) => (
                    SessionPhase::Running,
                    Some(running.serial.clone()),
                    running.plan.artifact.remote_location().map(str::to_string),
                    Some(running.started_at.clone()),
                ),
                SessionState::Stopping { serial } => {
                    (SessionPhase::Stopping, Some(serial.clone()), None, None)
                }
            },
            Err(_) => (SessionPhase::Idle, None, None, None),
        };
        SessionSnapshot {
            kind: self.kind,
            phase,
            serial,
            remote_artifact,
            started_at,
            status,
        }
    }

    fn publish(&self, phase: SessionPhase, status: impl Into<String>, trace_id: &str) {
        let status = status.into();
        if let Ok(mut guard) = self.status.lock() {
            *guard = status.clone();
        }
        (self.events)(AppEvent::SessionPhase {
            kind: self.kind,
            phase,
            status,
            trace_id: trace_id.to_string(),
        });
    }

    fn fail(&self, error: &AppError) {
        self.set_state(SessionState::Idle);
        (self.events)(AppEvent::SessionFailed {
            kind: self.kind,
            error: error.clone(),
        });
        self.publish(SessionPhase::Idle, format!("Failed: {}", error.error), &error.trace_id);
    }

    pub fn start(
        &self,
        serial: &str,
        plan: SessionPlan,
        timing: SessionTiming,
        trace_id: &str,
    ) -> Result<SessionSnapshot, AppError> {
        let serial = serial.trim();
        if serial.is_empty() {
            return Err(AppError::validation("No device selected", trace_id));
        }
        if plan.kind != self.kind {
            return Err(AppError::validation(
                format!("{} plan given to {} session", plan.kind.label(), self.kind.label()),
                trace_id,
            ));
        }
        validate_plan(&plan, trace_id)?;

        {
            let mut state = self.lock_state(trace_id)?;
            if !matches!(*state, SessionState::Idle) {
                return Err(AppError::validation(
                    format!("{} session already active", self.kind.label()),
                    trace_id,
                ));
            }
            *state = SessionState::Preparing {
                serial: serial.to_string(),
            };
        }
        info!(trace_id = %trace_id, kind = self.kind.label(), serial = %serial, "session preparing");
        self.publish(SessionPhase::Preparing, "Preparing device", trace_id);

        match self.prepare_and_launch(serial, &plan, &timing, trace_id) {
            Ok(tasks) => {
                self.set_state(SessionState::Running(RunningSession {
                    serial: serial.to_string(),
                    plan,
                    timing,
                    tasks,
                    started_at: Utc::now().to_rfc3339(),
                }));
                info!(trace_id = %trace_id, kind = self.kind.label(), "session running");
                self.publish(SessionPhase::Running, "Running", trace_id);
                Ok(self.snapshot())
            }
            Err(err) => {
                warn!(trace_id = %trace_id, kind = self.kind.label(), error = %err, "session start failed");
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn prepare_and_launch(
        &self,
        serial: &str,
        plan: &SessionPlan,
        timing: &SessionTiming,
        trace_id: &str,
    ) -> Result<Vec<BackgroundTask>, AppError> {
        for step in &plan.setup {
            self.run_setup_step(serial, step, timing, trace_id)?;
        }
        plan.hal
            .apply(self.executor.as_ref(), Some(serial), timing.command_timeout, trace_id)?;

        let mut tasks = Vec::new();
        if let Some(recorder) = &plan.recorder {
            tasks.push(self.launch(serial, recorder, trace_id)?);
            if plan.player.is_some() && !timing.recorder_startup.is_zero() {
                std::thread::sleep(timing.recorder_startup);
            }
            if let Some(err) = early_exit_error(&mut tasks[0], trace_id) {
                return Err(err);
            }
        }
        if let Some(player) = &plan.player {
            match self.launch(serial, player, trace_id) {
                Ok(task) => tasks.push(task),
                Err(err) => {
                    self.terminate_all(&mut tasks, timing.stop_grace, trace_id);
                    return Err(err);
                }
            }
        }
        Ok(tasks)
    }

    fn launch(
        &self,
        serial: &str,
        spec: &LaunchSpec,
        trace_id: &str,
    ) -> Result<BackgroundTask, AppError> {
        BackgroundTask::spawn(
            &self.executor,
            spec.label.clone(),
            &spec.launch_command(serial),
            OutputTarget::Discard,
            Some(spec.kill_command(serial)),
            trace_id,
        )
    }

    fn run_setup_step(
        &self,
        serial: &str,
        step: &SetupStep,
        timing: &SessionTiming,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let device = Some(serial);
        let timeout = timing.command_timeout;
        match step {
            SetupStep::Root => {
                match self.executor.run_checked(&AdbCommand::root(device), timeout, trace_id) {
                    Ok(_) => {
                        // adbd restarts after `root`; later commands race it otherwise.
                        let wait = crate::app::adb::command::build(["wait-for-device"], device);
                        self.executor.run_checked(&wait, timeout, trace_id)?;
                    }
                    Err(err) if err.is_unreachable() => return Err(err),
                    Err(err) => {
                        warn!(trace_id = %trace_id, error = %err, "adb root unavailable; continuing");
                    }
                }
            }
            SetupStep::DisableSelinux => {
                let command = AdbCommand::shell(device, ["setenforce", "0"]);
                match self.executor.run_checked(&command, timeout, trace_id) {
                    Ok(_) => {}
                    Err(err) if err.is_unreachable() => return Err(err),
                    Err(err) => {
                        warn!(trace_id = %trace_id, error = %err, "setenforce failed; continuing");
                    }
                }
            }
            SetupStep::MakeDir(dir) => {
                self.executor.run_checked(
                    &AdbCommand::shell(device, ["mkdir", "-p", dir.as_str()]),
                    timeout,
                    trace_id,
                )?;
            }
            SetupStep::ClearDir(dir) => {
                let script = format!("rm -rf {}/*", quote_device_arg(dir.trim_end_matches('/')));
                self.executor.run_checked(
                    &AdbCommand::shell_script(device, script),
                    timeout,
                    trace_id,
                )?;
            }
            SetupStep::Push { local, remote } => {
                self.executor.run_checked(
                    &AdbCommand::push(device, local, remote),
                    timing.transfer_timeout,
                    trace_id,
                )?;
            }
        }
        Ok(())
    }

    fn terminate_all(&self, tasks: &mut [BackgroundTask], grace: Duration, trace_id: &str) {
        // Reverse launch order: the player goes first so the recorder keeps the tail.
        for task in tasks.iter_mut().rev() {
            task.terminate(grace, trace_id);
        }
    }

    /// Stopping an idle (or already stopping) session does nothing and reports
    /// `NotRunning`, so repeated clicks are harmless.
    pub fn stop(&self, layout: &OutputLayout, trace_id: &str) -> Result<StopOutcome, AppError> {
        let running = {
            let mut state = self.lock_state(trace_id)?;
            match std::mem::replace(&mut *state, SessionState::Idle) {
                SessionState::Running(running) => {
                    *state = SessionState::Stopping {
                        serial: running.serial.clone(),
                    };
                    running
                }
                other => {
                    debug!(trace_id = %trace_id, kind = self.kind.label(), phase = ?other.phase(), "stop ignored");
                    *state = other;
                    return Ok(StopOutcome::NotRunning);
                }
            }
        };
        info!(trace_id = %trace_id, kind = self.kind.label(), serial = %running.serial, "session stopping");
        self.publish(SessionPhase::Stopping, "Stopping", trace_id);

        match self.teardown(running, layout, trace_id) {
            Ok(report) => {
                self.set_state(SessionState::Idle);
                let status = match report.local_paths.as_slice() {
                    [] => "Stopped".to_string(),
                    [single] => format!("Saved {single}"),
                    many => format!("Saved {} files", many.len()),
                };
                (self.events)(AppEvent::SessionCompleted {
                    kind: self.kind,
                    report: report.clone(),
                    trace_id: trace_id.to_string(),
                });
                self.publish(SessionPhase::Idle, status, trace_id);
                Ok(StopOutcome::Completed(report))
            }
            Err(err) => {
                warn!(trace_id = %trace_id, kind = self.kind.label(), error = %err, "session stop failed");
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn teardown(
        &self,
        mut running: RunningSession,
        layout: &OutputLayout,
        trace_id: &str,
    ) -> Result<StopReport, AppError> {
        let timing = running.timing.clone();
        self.terminate_all(&mut running.tasks, timing.stop_grace, trace_id);
        if !timing.settle.is_zero() {
            std::thread::sleep(timing.settle);
        }

        let serial = running.serial.as_str();
        let mut report = StopReport {
            serial: serial.to_string(),
            local_paths: Vec::new(),
            remote_path: running.plan.artifact.remote_location().map(str::to_string),
            size_bytes: 0,
            warnings: Vec::new(),
        };
        for err in running.plan.hal.clear(
            self.executor.as_ref(),
            Some(serial),
            timing.command_timeout,
            trace_id,
        ) {
            report.warnings.push(err.error);
        }

        match &running.plan.artifact {
            ArtifactSpec::None => {}
            ArtifactSpec::File {
                remote_path,
                output,
                prefix,
                extension,
            } => {
                let size = check_remote_recording(
                    self.executor.as_ref(),
                    serial,
                    remote_path,
                    timing.min_valid_bytes,
                    timing.command_timeout,
                    trace_id,
                )?;
                let local = layout.timestamped_file(*output, prefix, serial, extension, trace_id)?;
                self.executor.run_checked(
                    &AdbCommand::pull(Some(serial), remote_path, &local),
                    timing.transfer_timeout,
                    trace_id,
                )?;
                report.size_bytes = size;
                report.local_paths.push(local.to_string_lossy().to_string());
                if timing.delete_remote_after_pull {
                    self.remove_remote(serial, remote_path, timing.command_timeout, &mut report.warnings, trace_id);
                }
            }
            ArtifactSpec::Directory { remote_dir, output } => {
                self.collect_directory(serial, remote_dir, *output, layout, &timing, &mut report, trace_id)?;
            }
        }
        info!(
            trace_id = %trace_id,
            kind = self.kind.label(),
            files = report.local_paths.len(),
            bytes = report.size_bytes,
            "session artifacts collected"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn collect_directory(
        &self,
        serial: &str,
        remote_dir: &str,
        output: OutputKind,
        layout: &OutputLayout,
        timing: &SessionTiming,
        report: &mut StopReport,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let listing = self.executor.run(
            &AdbCommand::shell(Some(serial), ["ls", "-la", remote_dir]),
            timing.command_timeout,
            trace_id,
        )?;
        if !listing.success() && !is_missing_file_message(&listing.combined()) {
            return Err(AppError::dependency(
                format!("Could not list {remote_dir}: {}", listing.error_detail()),
                trace_id,
            ));
        }
        let files: Vec<_> = parse_ls_la(remote_dir, &listing.stdout)
            .into_iter()
            .filter(|entry| !entry.is_dir && entry.size_bytes.unwrap_or(0) > 0)
            .collect();
        if files.is_empty() {
            return Err(AppError::result(
                format!("Dump produced no files in {remote_dir}"),
                trace_id,
            ));
        }

        let local_dir = layout.timestamped_dir(output, serial, trace_id)?;
        for entry in &files {
            let local = local_dir.join(&entry.name);
            let pulled = self.executor.run_checked(
                &AdbCommand::pull(Some(serial), &entry.path, &local),
                timing.transfer_timeout,
                trace_id,
            );
            match pulled {
                Ok(_) => {
                    report.size_bytes += entry.size_bytes.unwrap_or(0);
                    report.local_paths.push(local.to_string_lossy().to_string());
                    if timing.delete_remote_after_pull {
                        self.remove_remote(serial, &entry.path, timing.command_timeout, &mut report.warnings, trace_id);
                    }
                }
                Err(err) => report.warnings.push(err.error),
            }
        }
        if report.local_paths.is_empty() {
            return Err(AppError::dependency(
                format!(
                    "Failed to pull any dump file from {remote_dir}: {}",
                    report.warnings.join("; ")
                ),
                trace_id,
            ));
        }
        Ok(())
    }

    fn remove_remote(
        &self,
        serial: &str,
        remote_path: &str,
        timeout: Duration,
        warnings: &mut Vec<String>,
        trace_id: &str,
    ) {
        let command = AdbCommand::shell(Some(serial), ["rm", "-f", remote_path]);
        if let Err(err) = self
            .executor
            .run_checked(&command, timeout, trace_id)
        {
            warn!(trace_id = %trace_id, error = %err, "failed to remove remote artifact");
            warnings.push(err.error);
        }
    }
}

/// `ls -la` on the recorded file: missing or at most `min_valid_bytes` is a result error.
pub(crate) fn check_remote_recording(
    executor: &dyn AdbExecutor,
    serial: &str,
    remote_path: &str,
    min_valid_bytes: u64,
    timeout: Duration,
    trace_id: &str,
) -> Result<u64, AppError> {
    let output = executor.run(
        &AdbCommand::shell(Some(serial), ["ls", "-la", remote_path]),
        timeout,
        trace_id,
    )?;
    if !output.success() && !is_missing_file_message(&output.combined()) {
        return Err(AppError::dependency(
            format!("Could not check {remote_path}: {}", output.error_detail()),
            trace_id,
        ));
    }
    match parse_remote_file_check(remote_path, &output.stdout, &output.stderr) {
        RemoteFileCheck::Missing => Err(AppError::result(
            format!("Recording produced no file at {remote_path}"),
            trace_id,
        )),
        RemoteFileCheck::Present { size_bytes } if size_bytes <= min_valid_bytes => {
            Err(AppError::result(
                format!("Recording is empty ({size_bytes} bytes) at {remote_path}"),
                trace_id,
            ))
        }
        RemoteFileCheck::Present { size_bytes } => Ok(size_bytes),
    }
}

fn validate_plan(plan: &SessionPlan, trace_id: &str) -> Result<(), AppError> {
    for step in &plan.setup {
        let remote = match step {
            SetupStep::Push { local, remote } => {
                if !local.is_file() {
                    return Err(AppError::validation(
                        format!("Audio file not found: {}", local.display()),
                        trace_id,
                    ));
                }
                remote
            }
            SetupStep::MakeDir(dir) | SetupStep::ClearDir(dir) => dir,
            SetupStep::Root | SetupStep::DisableSelinux => continue,
        };
        validate_device_path(remote).map_err(|message| {
            AppError::validation(format!("{message}: {remote}"), trace_id)
        })?;
    }
    if plan.recorder.is_none() && plan.player.is_none() && matches!(plan.artifact, ArtifactSpec::File { .. }) {
        return Err(AppError::validation(
            "A file artifact needs a recorder or player",
            trace_id,
        ));
    }
    Ok(())
}

fn early_exit_error(task: &mut BackgroundTask, trace_id: &str) -> Option<AppError> {
    if !task.has_completed() {
        return None;
    }
    let excerpt = task.stderr_excerpt();
    let detail = if !excerpt.is_empty() {
        excerpt
    } else {
        match task.exit_code().flatten() {
            Some(code) => format!("exit code {code}"),
            None => "terminated".to_string(),
        }
    };
    Some(AppError::dependency(
        format!("{} exited right after launch: {detail}", task.label()),
        trace_id,
    ))
}
