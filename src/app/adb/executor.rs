use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::adb::command::AdbCommand;
use crate::app::adb::runner::{
    run_command_raw, spawn_background, BackgroundProcess, CommandOutput, OutputTarget, RawOutput,
};
use crate::app::error::AppError;

/// Everything above this trait talks to adb only through it, so orchestration can be
/// exercised against a scripted fake.
pub trait AdbExecutor: Send + Sync {
    fn program(&self) -> &str;

    fn run_raw(
        &self,
        command: &AdbCommand,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<RawOutput, AppError>;

    fn spawn(
        &self,
        command: &AdbCommand,
        target: OutputTarget,
        trace_id: &str,
    ) -> Result<Box<dyn BackgroundProcess>, AppError>;

    fn run(
        &self,
        command: &AdbCommand,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        self.run_raw(command, timeout, trace_id).map(CommandOutput::from)
    }

    /// Like [`AdbExecutor::run`], but a non-zero exit becomes an `ERR_DEPENDENCY` error
    /// carrying the tool's own output.
    fn run_checked(
        &self,
        command: &AdbCommand,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        let output = self.run(command, timeout, trace_id)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("`{}` failed: {}", command.display(), output.error_detail()),
                trace_id,
            ));
        }
        Ok(output)
    }
}

pub struct SystemAdb {
    program: String,
}

impl SystemAdb {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl AdbExecutor for SystemAdb {
    fn program(&self) -> &str {
        &self.program
    }

    fn run_raw(
        &self,
        command: &AdbCommand,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<RawOutput, AppError> {
        let started = Instant::now();
        let result = run_command_raw(&self.program, command.args(), timeout, trace_id);
        debug!(
            trace_id = %trace_id,
            command = %command.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            exit_code = ?result.as_ref().ok().and_then(|out| out.exit_code),
            "adb command finished"
        );
        result
    }

    fn spawn(
        &self,
        command: &AdbCommand,
        target: OutputTarget,
        trace_id: &str,
    ) -> Result<Box<dyn BackgroundProcess>, AppError> {
        info!(trace_id = %trace_id, command = %command.display(), "spawning background adb");
        let process = spawn_background(&self.program, command.args(), target, trace_id)?;
        Ok(Box::new(process))
    }
}

/// A long-running invocation (recorder, player, logcat) plus how to stop it.
///
/// The local child is usually only the `adb shell` wrapper, so stopping also needs
/// a device-side kill of the tool by name.
pub struct BackgroundTask {
    label: String,
    process: Box<dyn BackgroundProcess>,
    remote_kill: Option<AdbCommand>,
    executor: Arc<dyn AdbExecutor>,
    exit: Option<Option<i32>>,
}

impl BackgroundTask {
    pub fn new(
        label: impl Into<String>,
        process: Box<dyn BackgroundProcess>,
        remote_kill: Option<AdbCommand>,
        executor: Arc<dyn AdbExecutor>,
    ) -> Self {
        Self {
            label: label.into(),
            process,
            remote_kill,
            executor,
            exit: None,
        }
    }

    pub fn spawn(
        executor: &Arc<dyn AdbExecutor>,
        label: impl Into<String>,
        command: &AdbCommand,
        target: OutputTarget,
        remote_kill: Option<AdbCommand>,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        let process = executor.spawn(command, target, trace_id)?;
        Ok(Self::new(label, process, remote_kill, Arc::clone(executor)))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn exit_code(&self) -> Option<Option<i32>> {
        self.exit
    }

    pub fn stderr_excerpt(&self) -> String {
        self.process.stderr_excerpt()
    }

    pub fn has_completed(&mut self) -> bool {
        if self.exit.is_some() {
            return true;
        }
        match self.process.try_wait() {
            Ok(Some(code)) => {
                self.exit = Some(code);
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(task = %self.label, error = %err, "failed to poll background task");
                false
            }
        }
    }

    pub fn wait(&mut self, timeout: Duration, trace_id: &str) -> Result<Option<i32>, AppError> {
        let start = Instant::now();
        loop {
            if self.has_completed() {
                return Ok(self.exit.flatten());
            }
            if start.elapsed() >= timeout {
                return Err(AppError::timeout(
                    format!("{} did not finish within {}s", self.label, timeout.as_secs()),
                    trace_id,
                ));
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Best effort. Never fails; problems are logged.
    pub fn terminate(&mut self, grace: Duration, trace_id: &str) {
        if let Some(kill) = &self.remote_kill {
            match self.executor.run(kill, Duration::from_secs(5), trace_id) {
                Ok(output) if !output.success() => {
                    // killall exits 1 when nothing matched, which is fine after a natural exit.
                    debug!(
                        trace_id = %trace_id,
                        task = %self.label,
                        detail = %output.error_detail(),
                        "remote kill reported no match"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(trace_id = %trace_id, task = %self.label, error = %err, "remote kill failed");
                }
            }
        }

        let start = Instant::now();
        while !self.has_completed() && start.elapsed() < grace {
            std::thread::sleep(Duration::from_millis(50));
        }
        if !self.has_completed() {
            if let Err(err) = self.process.kill() {
                warn!(trace_id = %trace_id, task = %self.label, error = %err, "local kill failed");
            }
            self.has_completed();
        }
    }
}
