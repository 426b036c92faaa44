use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::app::error::AppError;

const STDERR_EXCERPT_MAX_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout and stderr joined; adb prints some results (e.g. `connect`) on either.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    /// The most useful single line of text for an error message.
    pub fn error_detail(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else if !stdout.is_empty() {
            stdout.to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            }
        }
    }
}

impl From<RawOutput> for CommandOutput {
    fn from(raw: RawOutput) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&raw.stdout).to_string(),
            stderr: raw.stderr,
            exit_code: raw.exit_code,
        }
    }
}

fn spawn_error(program: &str, err: std::io::Error, trace_id: &str) -> AppError {
    if err.kind() == std::io::ErrorKind::NotFound {
        AppError::environment(format!("{program} not found; is it installed and on PATH?"), trace_id)
    } else {
        AppError::system(format!("Failed to spawn {program}: {err}"), trace_id)
    }
}

fn drain<R: Read + Send + 'static>(reader: R) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut reader = reader;
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

pub fn run_command_raw(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<RawOutput, AppError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| spawn_error(program, err, trace_id))?;

    // Both pipes are drained concurrently: a chatty child blocks once a pipe buffer fills.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;
    let stdout_handle = drain(stdout);
    let stderr_handle = drain(stderr);

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(AppError::timeout(
                        format!("Command timed out after {}s", timeout.as_secs_f32()),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(AppError::system(
                    format!("Failed to poll command: {err}"),
                    trace_id,
                ));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(RawOutput {
        stdout: stdout_bytes,
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

pub type LineSink = Arc<dyn Fn(Vec<String>) + Send + Sync>;

/// Where a background process writes its stdout.
#[derive(Clone)]
pub enum OutputTarget {
    Discard,
    File(PathBuf),
    Lines {
        sink: LineSink,
        batch_lines: usize,
        batch_interval: Duration,
    },
}

impl std::fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discard => f.write_str("Discard"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Lines { batch_lines, .. } => f
                .debug_struct("Lines")
                .field("batch_lines", batch_lines)
                .finish_non_exhaustive(),
        }
    }
}

/// A locally spawned child that keeps running after the call returns.
pub trait BackgroundProcess: Send {
    /// `Ok(Some(code))` once exited; the inner code is `None` when killed by a signal.
    fn try_wait(&mut self) -> Result<Option<Option<i32>>, String>;
    fn kill(&mut self) -> Result<(), String>;
    fn stderr_excerpt(&self) -> String;
}

pub struct SystemProcess {
    child: Child,
    stop_flag: Arc<AtomicBool>,
    stderr_buffer: Arc<Mutex<String>>,
}

pub(crate) fn append_limited(buffer: &mut String, chunk: &str, max_len: usize) {
    if max_len == 0 || buffer.len() >= max_len {
        return;
    }
    let remaining = max_len - buffer.len();
    if chunk.len() <= remaining {
        buffer.push_str(chunk);
    } else {
        let mut end = remaining;
        while !chunk.is_char_boundary(end) {
            end -= 1;
        }
        buffer.push_str(&chunk[..end]);
    }
}

pub fn spawn_background(
    program: &str,
    args: &[String],
    target: OutputTarget,
    trace_id: &str,
) -> Result<SystemProcess, AppError> {
    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null()).stderr(Stdio::piped());
    match &target {
        OutputTarget::Discard => {
            command.stdout(Stdio::null());
        }
        OutputTarget::File(path) => {
            let file = File::create(path).map_err(|err| {
                AppError::system(
                    format!("Failed to create {}: {err}", path.display()),
                    trace_id,
                )
            })?;
            command.stdout(Stdio::from(file));
        }
        OutputTarget::Lines { .. } => {
            command.stdout(Stdio::piped());
        }
    }

    let mut child = command
        .spawn()
        .map_err(|err| spawn_error(program, err, trace_id))?;

    let stop_flag = Arc::new(AtomicBool::new(false));
    let stderr_buffer = Arc::new(Mutex::new(String::new()));

    if let Some(stderr) = child.stderr.take() {
        let buffer = Arc::clone(&stderr_buffer);
        std::thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(Result::ok) {
                if let Ok(mut guard) = buffer.lock() {
                    append_limited(&mut guard, &line, STDERR_EXCERPT_MAX_LEN);
                    append_limited(&mut guard, "\n", STDERR_EXCERPT_MAX_LEN);
                }
            }
        });
    }

    if let OutputTarget::Lines {
        sink,
        batch_lines,
        batch_interval,
    } = target
    {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
        let stop = Arc::clone(&stop_flag);
        let trace = trace_id.to_string();
        let batch_lines = batch_lines.max(1);
        std::thread::spawn(move || {
            let reader = BufReader::new(stdout);
            let mut pending: Vec<String> = Vec::new();
            let mut last_emit = Instant::now();
            for line_result in reader.lines() {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let line = match line_result {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(trace_id = %trace, error = %err, "failed to read process stdout");
                        break;
                    }
                };
                pending.push(line);
                if pending.len() >= batch_lines || last_emit.elapsed() >= batch_interval {
                    (sink)(std::mem::take(&mut pending));
                    last_emit = Instant::now();
                }
            }
            if !pending.is_empty() {
                (sink)(pending);
            }
        });
    }

    Ok(SystemProcess {
        child,
        stop_flag,
        stderr_buffer,
    })
}

impl BackgroundProcess for SystemProcess {
    fn try_wait(&mut self) -> Result<Option<Option<i32>>, String> {
        self.child
            .try_wait()
            .map(|status| status.map(|status| status.code()))
            .map_err(|err| err.to_string())
    }

    fn kill(&mut self) -> Result<(), String> {
        self.stop_flag.store(true, Ordering::Relaxed);
        match self.child.kill() {
            Ok(()) => {}
            // Already exited.
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(err) => return Err(err.to_string()),
        }
        self.child.wait().map(|_| ()).map_err(|err| err.to_string())
    }

    fn stderr_excerpt(&self) -> String {
        self.stderr_buffer
            .lock()
            .map(|guard| guard.trim().to_string())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> (String, Vec<String>) {
        ("sh".to_string(), vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn large_stdout_does_not_deadlock() {
        let (program, args) =
            sh("i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done");
        let output = run_command_raw(&program, &args, Duration::from_secs(10), "trace-large")
            .expect("expected large-output command to complete without timing out");
        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.len() >= 1_000_000);
    }

    #[test]
    fn timeout_is_reported_as_timeout_kind() {
        let (program, args) = sh("sleep 5");
        let err = run_command_raw(&program, &args, Duration::from_millis(200), "trace-timeout")
            .expect_err("expected timeout");
        assert!(err.is_timeout());
        assert_eq!(err.trace_id, "trace-timeout");
    }

    #[test]
    fn missing_program_is_environment_error() {
        let err = run_command_raw(
            "acoutest-no-such-binary",
            &[],
            Duration::from_secs(1),
            "trace-missing",
        )
        .expect_err("expected spawn failure");
        assert_eq!(err.code, crate::app::error::ERR_ENVIRONMENT);
    }

    #[test]
    fn error_detail_prefers_stderr() {
        let output = CommandOutput {
            stdout: "partial".to_string(),
            stderr: "adb: error: remote object does not exist\n".to_string(),
            exit_code: Some(1),
        };
        assert_eq!(output.error_detail(), "adb: error: remote object does not exist");
        let silent = CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(3),
        };
        assert_eq!(silent.error_detail(), "exit code 3");
    }

    #[test]
    fn background_lines_are_batched_to_sink() {
        let (program, args) = sh("echo one; echo two; echo three >&2");
        let collected = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink_store = Arc::clone(&collected);
        let sink: LineSink = Arc::new(move |lines| {
            sink_store.lock().expect("sink").extend(lines);
        });
        let mut process = spawn_background(
            &program,
            &args,
            OutputTarget::Lines {
                sink,
                batch_lines: 10,
                batch_interval: Duration::from_secs(5),
            },
            "trace-lines",
        )
        .expect("spawn");

        let start = Instant::now();
        while process.try_wait().expect("wait").is_none() {
            assert!(start.elapsed() < Duration::from_secs(5), "child did not exit");
            std::thread::sleep(Duration::from_millis(10));
        }
        // Reader threads finish once the pipes close.
        let start = Instant::now();
        while collected.lock().expect("lines").len() < 2 && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*collected.lock().expect("lines"), vec!["one", "two"]);
        let start = Instant::now();
        while process.stderr_excerpt().is_empty() && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(process.stderr_excerpt(), "three");
    }

    #[test]
    fn kill_stops_long_running_child() {
        let (program, args) = sh("sleep 30");
        let mut process =
            spawn_background(&program, &args, OutputTarget::Discard, "trace-kill").expect("spawn");
        assert!(process.try_wait().expect("poll").is_none());
        process.kill().expect("kill");
        assert!(process.try_wait().expect("poll").is_some());
    }

    #[test]
    fn append_limited_respects_char_boundaries() {
        let mut buffer = String::new();
        append_limited(&mut buffer, "ab\u{00e9}", 3);
        assert_eq!(buffer, "ab");
    }
}
