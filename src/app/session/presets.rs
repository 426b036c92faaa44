use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::app::adb::paths::{join_device_path, remote_artifact_name, sanitize_filename_component};
use crate::app::config::{AppConfig, RecordingSettings};
use crate::app::hal::HalPropertySet;
use crate::app::output::OutputKind;
use crate::app::session::{ArtifactSpec, LaunchSpec, SessionKind, SessionPlan, SetupStep};

/// `tinycap` parameters. Passed through as typed by the user; the device tool decides
/// what it accepts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureParams {
    pub card: String,
    pub device: String,
    pub channels: String,
    pub sample_rate: String,
    pub bits: String,
    pub period_size: String,
}

impl CaptureParams {
    pub fn from_settings(settings: &RecordingSettings) -> Self {
        Self {
            card: settings.card.clone(),
            device: settings.device.clone(),
            channels: settings.channels.clone(),
            sample_rate: settings.sample_rate.clone(),
            bits: settings.bits.clone(),
            period_size: settings.period_size.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlaybackParams {
    pub card: String,
    pub device: String,
}

impl PlaybackParams {
    pub fn from_settings(settings: &RecordingSettings) -> Self {
        Self {
            card: settings.playback_card.clone(),
            device: settings.playback_device.clone(),
        }
    }
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: &str) {
    let value = value.trim();
    if !value.is_empty() {
        args.push(flag.to_string());
        args.push(value.to_string());
    }
}

pub fn tinycap_command(remote_path: &str, params: &CaptureParams, duration_secs: Option<u64>) -> Vec<String> {
    let mut args = vec!["tinycap".to_string(), remote_path.to_string()];
    push_flag(&mut args, "-D", &params.card);
    push_flag(&mut args, "-d", &params.device);
    push_flag(&mut args, "-c", &params.channels);
    push_flag(&mut args, "-r", &params.sample_rate);
    push_flag(&mut args, "-b", &params.bits);
    push_flag(&mut args, "-p", &params.period_size);
    if let Some(secs) = duration_secs {
        args.push("-T".to_string());
        args.push(secs.to_string());
    }
    args
}

pub fn tinyplay_command(remote_path: &str, params: &PlaybackParams) -> Vec<String> {
    let mut args = vec!["tinyplay".to_string(), remote_path.to_string()];
    push_flag(&mut args, "-D", &params.card);
    push_flag(&mut args, "-d", &params.device);
    args
}

/// SIGINT lets tinycap finish the WAV header before exiting.
pub fn recorder_spec(remote_path: &str, params: &CaptureParams, duration_secs: Option<u64>) -> LaunchSpec {
    LaunchSpec {
        label: "tinycap".to_string(),
        command: tinycap_command(remote_path, params, duration_secs),
        kill_name: "tinycap".to_string(),
        kill_signal: Some("2".to_string()),
    }
}

pub fn player_spec(remote_path: &str, params: &PlaybackParams) -> LaunchSpec {
    LaunchSpec {
        label: "tinyplay".to_string(),
        command: tinyplay_command(remote_path, params),
        kill_name: "tinyplay".to_string(),
        kill_signal: None,
    }
}

fn base_setup(config: &AppConfig) -> Vec<SetupStep> {
    let mut steps = Vec::new();
    if config.session.use_root {
        steps.push(SetupStep::Root);
    }
    if config.session.disable_selinux {
        steps.push(SetupStep::DisableSelinux);
    }
    steps
}

/// Device path a local audio file is pushed to.
pub fn remote_audio_path(remote_dir: &str, local: &Path) -> String {
    let name = local
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    join_device_path(remote_dir, &sanitize_filename_component(&name))
}

fn recording_path(config: &AppConfig, stem: &str) -> String {
    join_device_path(
        &config.recording.remote_dir,
        &remote_artifact_name(stem, "wav", config.session.unique_remote_names),
    )
}

pub fn loopback_plan(
    config: &AppConfig,
    audio_file: &Path,
    capture: &CaptureParams,
    playback: &PlaybackParams,
) -> SessionPlan {
    let remote_dir = config.recording.remote_dir.clone();
    let remote_audio = remote_audio_path(&remote_dir, audio_file);
    let remote_recording = recording_path(config, "loopback");

    let mut setup = base_setup(config);
    setup.push(SetupStep::MakeDir(remote_dir));
    setup.push(SetupStep::Push {
        local: audio_file.to_path_buf(),
        remote: remote_audio.clone(),
    });

    SessionPlan {
        kind: SessionKind::Loopback,
        setup,
        hal: HalPropertySet::new(),
        recorder: Some(recorder_spec(&remote_recording, capture, None)),
        player: Some(player_spec(&remote_audio, playback)),
        artifact: ArtifactSpec::File {
            remote_path: remote_recording,
            output: OutputKind::Loopback,
            prefix: "loopback".to_string(),
            extension: "wav".to_string(),
        },
    }
}

pub fn microphone_plan(config: &AppConfig, capture: &CaptureParams) -> SessionPlan {
    let remote_recording = recording_path(config, "mic");
    let mut setup = base_setup(config);
    setup.push(SetupStep::MakeDir(config.recording.remote_dir.clone()));

    SessionPlan {
        kind: SessionKind::Microphone,
        setup,
        hal: HalPropertySet::new(),
        recorder: Some(recorder_spec(&remote_recording, capture, None)),
        player: None,
        artifact: ArtifactSpec::File {
            remote_path: remote_recording,
            output: OutputKind::MicTest,
            prefix: "mic".to_string(),
            extension: "wav".to_string(),
        },
    }
}

pub fn multichannel_plan(config: &AppConfig, audio_file: &Path, playback: &PlaybackParams) -> SessionPlan {
    let remote_dir = config.recording.remote_dir.clone();
    let remote_audio = remote_audio_path(&remote_dir, audio_file);
    let mut setup = base_setup(config);
    setup.push(SetupStep::MakeDir(remote_dir));
    setup.push(SetupStep::Push {
        local: audio_file.to_path_buf(),
        remote: remote_audio.clone(),
    });

    SessionPlan {
        kind: SessionKind::Multichannel,
        setup,
        hal: HalPropertySet::new(),
        recorder: None,
        player: Some(player_spec(&remote_audio, playback)),
        artifact: ArtifactSpec::None,
    }
}

pub fn hal_dump_plan(config: &AppConfig, properties: HalPropertySet) -> SessionPlan {
    let dump_dir = config.hal.dump_dir.trim_end_matches('/').to_string();
    let mut setup = base_setup(config);
    if config.hal.clear_dump_dir_on_start {
        setup.push(SetupStep::ClearDir(dump_dir.clone()));
    }
    setup.push(SetupStep::MakeDir(dump_dir.clone()));

    SessionPlan {
        kind: SessionKind::HalDump,
        setup,
        hal: properties,
        recorder: None,
        player: None,
        artifact: ArtifactSpec::Directory {
            remote_dir: dump_dir,
            output: OutputKind::HalDump,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.session.unique_remote_names = false;
        config
    }

    #[test]
    fn tinycap_skips_blank_parameters() {
        let params = CaptureParams {
            card: "1".to_string(),
            device: "".to_string(),
            channels: "8".to_string(),
            sample_rate: "96000".to_string(),
            bits: "24".to_string(),
            period_size: " ".to_string(),
        };
        assert_eq!(
            tinycap_command("/sdcard/a.wav", &params, Some(7)),
            ["tinycap", "/sdcard/a.wav", "-D", "1", "-c", "8", "-r", "96000", "-b", "24", "-T", "7"]
        );
    }

    #[test]
    fn loopback_pushes_then_records_and_plays() {
        let config = config();
        let plan = loopback_plan(
            &config,
            &PathBuf::from("/tmp/ref tone.wav"),
            &CaptureParams::from_settings(&config.recording),
            &PlaybackParams::from_settings(&config.recording),
        );
        assert_eq!(plan.kind, SessionKind::Loopback);
        assert_eq!(plan.setup[0], SetupStep::Root);
        assert_eq!(plan.setup[1], SetupStep::DisableSelinux);
        assert_eq!(
            plan.setup[3],
            SetupStep::Push {
                local: PathBuf::from("/tmp/ref tone.wav"),
                remote: "/sdcard/ref_tone.wav".to_string(),
            }
        );
        let recorder = plan.recorder.expect("recorder");
        assert_eq!(recorder.command[1], "/sdcard/loopback.wav");
        assert_eq!(
            recorder.kill_command("S1").args(),
            ["-s", "S1", "shell", "killall", "-2", "tinycap"]
        );
        let player = plan.player.expect("player");
        assert_eq!(player.command, ["tinyplay", "/sdcard/ref_tone.wav", "-D", "0", "-d", "0"]);
        assert_eq!(plan.artifact.remote_location(), Some("/sdcard/loopback.wav"));
    }

    #[test]
    fn unique_names_differ_between_runs() {
        let config = AppConfig::default();
        let params = CaptureParams::from_settings(&config.recording);
        let first = microphone_plan(&config, &params);
        let second = microphone_plan(&config, &params);
        assert_ne!(first.artifact.remote_location(), second.artifact.remote_location());
    }

    #[test]
    fn root_steps_follow_config() {
        let mut config = config();
        config.session.use_root = false;
        config.session.disable_selinux = false;
        let plan = microphone_plan(&config, &CaptureParams::default());
        assert_eq!(plan.setup, vec![SetupStep::MakeDir("/sdcard".to_string())]);
        assert!(plan.player.is_none());
    }

    #[test]
    fn hal_dump_clears_directory_first() {
        let config = config();
        let plan = hal_dump_plan(&config, HalPropertySet::from_config(&config.hal.properties));
        assert_eq!(
            plan.setup[2],
            SetupStep::ClearDir("/data/vendor/audiohal/audio_dump".to_string())
        );
        assert!(plan.hal.is_active());
        assert!(matches!(plan.artifact, ArtifactSpec::Directory { .. }));
        assert!(plan.recorder.is_none() && plan.player.is_none());
    }
}
