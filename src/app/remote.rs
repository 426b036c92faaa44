use std::time::Duration;

use tracing::info;

use crate::app::adb::command::AdbCommand;
use crate::app::adb::executor::AdbExecutor;
use crate::app::error::AppError;
use crate::app::models::HostCommandResult;

/// Named media keys the UI buttons map to. Anything else is passed through as typed.
pub fn normalize_keycode(key: &str) -> Option<String> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().all(|ch| ch.is_ascii_digit()) {
        return Some(trimmed.to_string());
    }
    let upper = trimmed.to_ascii_uppercase().replace([' ', '-'], "_");
    let alias = match upper.as_str() {
        "PLAY" | "PAUSE" | "PLAY_PAUSE" => "KEYCODE_MEDIA_PLAY_PAUSE",
        "NEXT" => "KEYCODE_MEDIA_NEXT",
        "PREVIOUS" | "PREV" => "KEYCODE_MEDIA_PREVIOUS",
        "STOP" => "KEYCODE_MEDIA_STOP",
        "VOLUME_UP" | "VOL_UP" => "KEYCODE_VOLUME_UP",
        "VOLUME_DOWN" | "VOL_DOWN" => "KEYCODE_VOLUME_DOWN",
        "MUTE" => "KEYCODE_VOLUME_MUTE",
        "HOME" => "KEYCODE_HOME",
        "BACK" => "KEYCODE_BACK",
        _ => "",
    };
    if !alias.is_empty() {
        return Some(alias.to_string());
    }
    if upper.starts_with("KEYCODE_") {
        Some(upper)
    } else {
        Some(format!("KEYCODE_{upper}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAction {
    KeyEvent(String),
    StartActivity(String),
    Broadcast { action: String, extras: Vec<(String, String)> },
    ForceStop(String),
}

impl RemoteAction {
    pub fn command(&self, serial: &str) -> AdbCommand {
        let device = Some(serial);
        match self {
            RemoteAction::KeyEvent(code) => {
                AdbCommand::shell(device, ["input", "keyevent", code.as_str()])
            }
            RemoteAction::StartActivity(component) => {
                AdbCommand::shell(device, ["am", "start", "-n", component.as_str()])
            }
            RemoteAction::Broadcast { action, extras } => {
                let mut args = vec!["am".to_string(), "broadcast".to_string(), "-a".to_string(), action.clone()];
                for (key, value) in extras {
                    args.push("--es".to_string());
                    args.push(key.clone());
                    args.push(value.clone());
                }
                AdbCommand::shell(device, args)
            }
            RemoteAction::ForceStop(package) => {
                AdbCommand::shell(device, ["am", "force-stop", package.as_str()])
            }
        }
    }

    fn target(&self) -> &str {
        match self {
            RemoteAction::KeyEvent(value)
            | RemoteAction::StartActivity(value)
            | RemoteAction::ForceStop(value) => value,
            RemoteAction::Broadcast { action, .. } => action,
        }
    }
}

/// Runs a single control command; `am` reports some failures on stdout with exit 0,
/// so `Error:` lines count as failure too.
pub fn send(
    executor: &dyn AdbExecutor,
    serial: &str,
    action: &RemoteAction,
    timeout: Duration,
    trace_id: &str,
) -> Result<HostCommandResult, AppError> {
    let serial = serial.trim();
    if serial.is_empty() {
        return Err(AppError::validation("No device selected", trace_id));
    }
    if action.target().trim().is_empty() {
        return Err(AppError::validation("Remote action target is required", trace_id));
    }
    let output = executor.run_checked(&action.command(serial), timeout, trace_id)?;
    if let Some(line) = output
        .stdout
        .lines()
        .chain(output.stderr.lines())
        .find(|line| line.trim_start().starts_with("Error"))
    {
        return Err(AppError::dependency(line.trim().to_string(), trace_id));
    }
    info!(trace_id = %trace_id, serial = %serial, action = ?action, "remote action sent");
    Ok(HostCommandResult {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: output.exit_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::fake::ScriptedAdb;
    use crate::app::error::{ERR_DEPENDENCY, ERR_VALIDATION};

    #[test]
    fn keycodes_normalize() {
        assert_eq!(normalize_keycode("play").as_deref(), Some("KEYCODE_MEDIA_PLAY_PAUSE"));
        assert_eq!(normalize_keycode("volume up").as_deref(), Some("KEYCODE_VOLUME_UP"));
        assert_eq!(normalize_keycode("85").as_deref(), Some("85"));
        assert_eq!(normalize_keycode("keycode_enter").as_deref(), Some("KEYCODE_ENTER"));
        assert_eq!(normalize_keycode("dpad_up").as_deref(), Some("KEYCODE_DPAD_UP"));
        assert_eq!(normalize_keycode("  "), None);
    }

    #[test]
    fn actions_build_shell_commands() {
        assert_eq!(
            RemoteAction::KeyEvent("KEYCODE_MEDIA_NEXT".into()).command("S1").args(),
            ["-s", "S1", "shell", "input", "keyevent", "KEYCODE_MEDIA_NEXT"]
        );
        assert_eq!(
            RemoteAction::Broadcast {
                action: "com.example.PLAY".into(),
                extras: vec![("track".into(), "sweep 1k".into())],
            }
            .command("S1")
            .args(),
            ["-s", "S1", "shell", "am", "broadcast", "-a", "com.example.PLAY", "--es", "track", "'sweep 1k'"]
        );
    }

    #[test]
    fn broadcast_extras_cannot_chain_device_commands() {
        let args = RemoteAction::Broadcast {
            action: "com.example.PLAY".into(),
            extras: vec![("track".into(), "x; reboot".into())],
        }
        .command("S1")
        .args()
        .to_vec();
        assert_eq!(args.last().map(String::as_str), Some("'x; reboot'"));
        assert!(!args.iter().any(|arg| arg == "reboot"));
    }

    #[test]
    fn am_error_on_stdout_is_failure() {
        let adb = ScriptedAdb::new();
        adb.respond(
            "am start",
            0,
            "Starting: Intent { cmp=com.x/.Main }\nError type 3\nError: Activity class {com.x/.Main} does not exist.\n",
            "",
        );
        let err = send(
            &adb,
            "S1",
            &RemoteAction::StartActivity("com.x/.Main".into()),
            Duration::from_secs(1),
            "t",
        )
        .expect_err("missing activity");
        assert_eq!(err.code, ERR_DEPENDENCY);
        assert!(err.error.starts_with("Error type 3"));
    }

    #[test]
    fn empty_target_is_rejected() {
        let adb = ScriptedAdb::new();
        let err = send(&adb, "S1", &RemoteAction::ForceStop(" ".into()), Duration::from_secs(1), "t")
            .expect_err("empty");
        assert_eq!(err.code, ERR_VALIDATION);
        assert!(adb.calls().is_empty());
    }
}
