//! Scripted stand-in for the adb binary used by orchestration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::app::adb::command::AdbCommand;
use crate::app::adb::executor::AdbExecutor;
use crate::app::adb::runner::{BackgroundProcess, OutputTarget, RawOutput};
use crate::app::error::AppError;

enum Reply {
    Output(RawOutput),
    Error(AppError),
}

struct Rule {
    needle: String,
    reply: Reply,
    once: bool,
    used: bool,
}

struct SpawnRule {
    needle: String,
    exit_code: Option<i32>,
    stderr: String,
}

#[derive(Default)]
pub struct ScriptedAdb {
    rules: Mutex<Vec<Rule>>,
    spawn_rules: Mutex<Vec<SpawnRule>>,
    calls: Mutex<Vec<String>>,
    pull_payload: Mutex<Vec<u8>>,
}

impl ScriptedAdb {
    pub fn new() -> Self {
        let adb = Self::default();
        *adb.pull_payload.lock().expect("payload") = b"RIFF fake wav payload".to_vec();
        adb
    }

    fn push_rule(&self, needle: &str, reply: Reply, once: bool) {
        self.rules.lock().expect("rules").push(Rule {
            needle: needle.to_string(),
            reply,
            once,
            used: false,
        });
    }

    /// Every command containing `needle` gets this reply. Later rules win.
    pub fn respond(&self, needle: &str, exit_code: i32, stdout: &str, stderr: &str) {
        self.push_rule(needle, Reply::Output(output(exit_code, stdout.as_bytes(), stderr)), false);
    }

    /// Consumed by the first matching command; checked before sticky rules.
    pub fn respond_once(&self, needle: &str, exit_code: i32, stdout: &str, stderr: &str) {
        self.push_rule(needle, Reply::Output(output(exit_code, stdout.as_bytes(), stderr)), true);
    }

    pub fn respond_bytes(&self, needle: &str, stdout: &[u8]) {
        self.push_rule(needle, Reply::Output(output(0, stdout, "")), false);
    }

    pub fn fail(&self, needle: &str, error: AppError) {
        self.push_rule(needle, Reply::Error(error), false);
    }

    /// Background processes matching `needle` exit right away.
    pub fn spawn_exits(&self, needle: &str, exit_code: Option<i32>, stderr: &str) {
        self.spawn_rules.lock().expect("spawn rules").push(SpawnRule {
            needle: needle.to_string(),
            exit_code,
            stderr: stderr.to_string(),
        });
    }

    pub fn set_pull_payload(&self, bytes: &[u8]) {
        *self.pull_payload.lock().expect("payload") = bytes.to_vec();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn count_calls(&self, needle: &str) -> usize {
        self.calls().iter().filter(|call| call.contains(needle)).count()
    }

    fn lookup(&self, rendered: &str) -> Option<Result<RawOutput, AppError>> {
        let mut rules = self.rules.lock().expect("rules");
        if let Some(rule) = rules
            .iter_mut()
            .find(|rule| rule.once && !rule.used && rendered.contains(&rule.needle))
        {
            rule.used = true;
            return Some(reply_clone(&rule.reply));
        }
        rules
            .iter()
            .rev()
            .find(|rule| !rule.once && rendered.contains(&rule.needle))
            .map(|rule| reply_clone(&rule.reply))
    }
}

fn output(exit_code: i32, stdout: &[u8], stderr: &str) -> RawOutput {
    RawOutput {
        stdout: stdout.to_vec(),
        stderr: stderr.to_string(),
        exit_code: Some(exit_code),
    }
}

fn reply_clone(reply: &Reply) -> Result<RawOutput, AppError> {
    match reply {
        Reply::Output(out) => Ok(out.clone()),
        Reply::Error(err) => Err(err.clone()),
    }
}

impl AdbExecutor for ScriptedAdb {
    fn program(&self) -> &str {
        "adb"
    }

    fn run_raw(
        &self,
        command: &AdbCommand,
        _timeout: Duration,
        _trace_id: &str,
    ) -> Result<RawOutput, AppError> {
        let rendered = command.args().join(" ");
        self.calls.lock().expect("calls").push(rendered.clone());
        let reply = self
            .lookup(&rendered)
            .unwrap_or_else(|| Ok(output(0, b"", "")));

        let sub = command.subcommand();
        if let (Ok(out), Some("pull")) = (&reply, sub.first().map(String::as_str)) {
            if out.exit_code == Some(0) {
                if let Some(local) = sub.last() {
                    let payload = self.pull_payload.lock().expect("payload").clone();
                    let _ = std::fs::write(local, payload);
                }
            }
        }
        reply
    }

    fn spawn(
        &self,
        command: &AdbCommand,
        _target: OutputTarget,
        _trace_id: &str,
    ) -> Result<Box<dyn BackgroundProcess>, AppError> {
        let rendered = command.args().join(" ");
        self.calls
            .lock()
            .expect("calls")
            .push(format!("spawn: {rendered}"));
        let rules = self.spawn_rules.lock().expect("spawn rules");
        let early = rules.iter().rev().find(|rule| rendered.contains(&rule.needle));
        let process = FakeProcess {
            exited: Arc::new(AtomicBool::new(early.is_some())),
            exit_code: early.map(|rule| rule.exit_code).unwrap_or(None),
            stderr: early.map(|rule| rule.stderr.clone()).unwrap_or_default(),
        };
        Ok(Box::new(process))
    }
}

pub struct FakeProcess {
    exited: Arc<AtomicBool>,
    exit_code: Option<i32>,
    stderr: String,
}

impl BackgroundProcess for FakeProcess {
    fn try_wait(&mut self) -> Result<Option<Option<i32>>, String> {
        if self.exited.load(Ordering::SeqCst) {
            Ok(Some(self.exit_code))
        } else {
            Ok(None)
        }
    }

    fn kill(&mut self) -> Result<(), String> {
        self.exited.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stderr_excerpt(&self) -> String {
        self.stderr.clone()
    }
}
