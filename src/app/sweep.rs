//! Frequency-sweep batches: each sweep file is pushed, recorded while it plays, and
//! pulled back, one file at a time on a worker thread.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::app::adb::command::AdbCommand;
use crate::app::adb::executor::{AdbExecutor, BackgroundTask};
use crate::app::adb::paths::{join_device_path, remote_artifact_name, sanitize_filename_component, timestamp_now};
use crate::app::adb::runner::OutputTarget;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::events::{AppEvent, EventSink};
use crate::app::output::{OutputKind, OutputLayout};
use crate::app::session::check_remote_recording;
use crate::app::session::presets::{recorder_spec, remote_audio_path, tinyplay_command, CaptureParams, PlaybackParams};

fn frequency_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(k?)hz").ok())
        .as_ref()
}

/// Frequency in Hz embedded in a file name, e.g. `sweep_1.5kHz.wav` -> 1500.
pub fn frequency_from_name(name: &str) -> Option<f64> {
    let caps = frequency_regex()?.captures(name)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let kilo = caps.get(2).map(|m| !m.as_str().is_empty()).unwrap_or(false);
    Some(if kilo { value * 1000.0 } else { value })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Ascending by frequency; files without one go last, by name.
pub fn order_sweep_files(mut files: Vec<PathBuf>) -> Vec<PathBuf> {
    files.sort_by(|a, b| {
        let (name_a, name_b) = (file_name(a), file_name(b));
        match (frequency_from_name(&name_a), frequency_from_name(&name_b)) {
            (Some(fa), Some(fb)) => fa.total_cmp(&fb).then_with(|| name_a.cmp(&name_b)),
            (Some(_), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (None, None) => name_a.cmp(&name_b),
        }
    });
    files
}

/// `.wav` files directly inside `dir`, in sweep order.
pub fn list_sweep_files(dir: &Path, trace_id: &str) -> Result<Vec<PathBuf>, AppError> {
    let entries = fs::read_dir(dir).map_err(|err| {
        AppError::validation(
            format!("Cannot read sweep folder {}: {err}", dir.display()),
            trace_id,
        )
    })?;
    let files = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case("wav"))
                .unwrap_or(false)
        })
        .collect();
    Ok(order_sweep_files(files))
}

pub fn wav_duration_secs(path: &Path, trace_id: &str) -> Result<f64, AppError> {
    let reader = hound::WavReader::open(path).map_err(|err| {
        AppError::validation(
            format!("Not a readable WAV file {}: {err}", path.display()),
            trace_id,
        )
    })?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(AppError::validation(
            format!("WAV file {} has a zero sample rate", path.display()),
            trace_id,
        ));
    }
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

/// Whole seconds handed to `tinycap -T`.
pub fn record_duration_secs(play_secs: f64, padding_secs: u64) -> u64 {
    play_secs.max(0.0).ceil() as u64 + padding_secs
}

/// Name an item's recording is saved under: `1000Hz` style when a frequency is known.
pub fn item_label(path: &Path) -> String {
    match frequency_from_name(&file_name(path)) {
        Some(hz) if hz.fract() == 0.0 => format!("{}Hz", hz as u64),
        Some(hz) => format!("{hz}Hz"),
        None => sanitize_filename_component(
            &path
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_default(),
        ),
    }
}

/// One label per file, in batch order. Later files that map to an already used label
/// get `_2`, `_3`, ... so no two items share a recording path.
pub fn batch_labels(paths: &[PathBuf]) -> Vec<String> {
    let mut taken = HashSet::new();
    paths
        .iter()
        .map(|path| {
            let base = item_label(path);
            let mut label = base.clone();
            let mut suffix = 2;
            while !taken.insert(label.clone()) {
                label = format!("{base}_{suffix}");
                suffix += 1;
            }
            label
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SweepItemResult {
    pub index: usize,
    pub file: String,
    pub frequency_hz: Option<f64>,
    pub local_path: Option<String>,
    pub size_bytes: u64,
    pub error: Option<AppError>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SweepSummary {
    pub batch_dir: String,
    pub items: Vec<SweepItemResult>,
    pub cancelled: bool,
}

impl SweepSummary {
    pub fn failed(&self) -> usize {
        self.items.iter().filter(|item| item.error.is_some()).count()
    }

    pub fn completed(&self) -> usize {
        self.items.len() - self.failed()
    }
}

#[derive(Debug, Clone)]
pub struct SweepRequest {
    pub serial: String,
    pub files: Vec<PathBuf>,
    pub capture: CaptureParams,
    pub playback: PlaybackParams,
    pub batch_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepTiming {
    pub remote_dir: String,
    pub record_padding_secs: u64,
    pub play_margin_secs: u64,
    pub pause_between: Duration,
    pub recorder_startup: Duration,
    pub command_timeout: Duration,
    pub transfer_timeout: Duration,
    pub stop_grace: Duration,
    pub min_valid_bytes: u64,
    pub delete_remote_after_pull: bool,
    pub unique_remote_names: bool,
}

impl SweepTiming {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            remote_dir: config.sweep.remote_dir.clone(),
            record_padding_secs: config.sweep.record_padding_secs,
            play_margin_secs: config.sweep.play_margin_secs,
            pause_between: Duration::from_millis(config.sweep.pause_between_ms),
            recorder_startup: Duration::from_millis(config.session.recorder_startup_ms),
            command_timeout: Duration::from_secs(config.adb.command_timeout_secs),
            transfer_timeout: Duration::from_secs(config.adb.transfer_timeout_secs),
            stop_grace: Duration::from_secs(config.session.stop_timeout_secs),
            min_valid_bytes: config.session.min_valid_bytes,
            delete_remote_after_pull: config.output.delete_remote_after_pull,
            unique_remote_names: config.session.unique_remote_names,
        }
    }
}

#[derive(Debug, Clone)]
struct SweepItem {
    path: PathBuf,
    label: String,
    duration_secs: f64,
}

/// A running batch. Dropping the handle does not stop the worker.
pub struct SweepHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<SweepSummary>>,
    serial: String,
    batch_dir: PathBuf,
    total: usize,
}

impl SweepHandle {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn batch_dir(&self) -> &Path {
        &self.batch_dir
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Takes effect between items; the item in flight finishes first.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| thread.is_finished())
            .unwrap_or(true)
    }

    pub fn join(mut self, trace_id: &str) -> Result<SweepSummary, AppError> {
        let thread = self
            .thread
            .take()
            .ok_or_else(|| AppError::system("Sweep already joined", trace_id))?;
        thread
            .join()
            .map_err(|_| AppError::system("Sweep worker panicked", trace_id))
    }
}

/// Validates the batch and prepares the device on the calling thread, then runs the
/// items on a worker.
pub fn start_sweep(
    executor: Arc<dyn AdbExecutor>,
    layout: &OutputLayout,
    request: SweepRequest,
    timing: SweepTiming,
    events: EventSink,
    trace_id: &str,
) -> Result<SweepHandle, AppError> {
    let serial = request.serial.trim().to_string();
    if serial.is_empty() {
        return Err(AppError::validation("No device selected", trace_id));
    }
    if request.files.is_empty() {
        return Err(AppError::validation("No sweep files given", trace_id));
    }
    let ordered = order_sweep_files(request.files.clone());
    let labels = batch_labels(&ordered);
    let mut items = Vec::new();
    for (path, label) in ordered.into_iter().zip(labels) {
        if !path.is_file() {
            return Err(AppError::validation(
                format!("Sweep file not found: {}", path.display()),
                trace_id,
            ));
        }
        let duration_secs = wav_duration_secs(&path, trace_id)?;
        items.push(SweepItem {
            path,
            label,
            duration_secs,
        });
    }

    executor.run_checked(
        &AdbCommand::shell(Some(&serial), ["mkdir", "-p", timing.remote_dir.as_str()]),
        timing.command_timeout,
        trace_id,
    )?;

    let batch_name = request
        .batch_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(sanitize_filename_component)
        .unwrap_or_else(|| format!("sweep_{}_{}", sanitize_filename_component(&serial), timestamp_now()));
    let batch_dir = layout.ensure_dir(OutputKind::Sweep, trace_id)?.join(batch_name);
    fs::create_dir_all(&batch_dir).map_err(|err| {
        AppError::system(
            format!("Failed to create sweep dir {}: {err}", batch_dir.display()),
            trace_id,
        )
    })?;

    let stop = Arc::new(AtomicBool::new(false));
    let total = items.len();
    let worker = SweepWorker {
        executor,
        serial: serial.clone(),
        capture: request.capture,
        playback: request.playback,
        timing,
        batch_dir: batch_dir.clone(),
        events,
        trace_id: trace_id.to_string(),
    };
    let worker_stop = Arc::clone(&stop);
    let thread = std::thread::Builder::new()
        .name("sweep".to_string())
        .spawn(move || worker.run(&items, &worker_stop))
        .map_err(|err| AppError::system(format!("Failed to start sweep worker: {err}"), trace_id))?;

    info!(trace_id = %trace_id, total, dir = %batch_dir.display(), "sweep started");
    Ok(SweepHandle {
        stop,
        thread: Some(thread),
        serial,
        batch_dir,
        total,
    })
}

struct SweepWorker {
    executor: Arc<dyn AdbExecutor>,
    serial: String,
    capture: CaptureParams,
    playback: PlaybackParams,
    timing: SweepTiming,
    batch_dir: PathBuf,
    events: EventSink,
    trace_id: String,
}

impl SweepWorker {
    fn run(&self, items: &[SweepItem], stop: &AtomicBool) -> SweepSummary {
        let trace_id = self.trace_id.as_str();
        let mut results = Vec::new();
        let mut cancelled = false;

        for (index, item) in items.iter().enumerate() {
            if stop.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
            if index > 0 && !self.timing.pause_between.is_zero() {
                std::thread::sleep(self.timing.pause_between);
            }
            let name = file_name(&item.path);
            (self.events)(AppEvent::SweepProgress {
                index,
                total: items.len(),
                file: name.clone(),
                trace_id: trace_id.to_string(),
            });

            let outcome = self.run_item(item);
            let result = match outcome {
                Ok((local, size_bytes)) => SweepItemResult {
                    index,
                    file: name,
                    frequency_hz: frequency_from_name(&file_name(&item.path)),
                    local_path: Some(local.to_string_lossy().to_string()),
                    size_bytes,
                    error: None,
                },
                Err(err) => {
                    warn!(trace_id = %trace_id, file = %name, error = %err, "sweep item failed");
                    SweepItemResult {
                        index,
                        frequency_hz: frequency_from_name(&name),
                        file: name,
                        local_path: None,
                        size_bytes: 0,
                        error: Some(err),
                    }
                }
            };
            (self.events)(AppEvent::SweepItem {
                result: result.clone(),
                trace_id: trace_id.to_string(),
            });
            results.push(result);
        }

        let summary = SweepSummary {
            batch_dir: self.batch_dir.to_string_lossy().to_string(),
            items: results,
            cancelled,
        };
        info!(
            trace_id = %trace_id,
            completed = summary.completed(),
            failed = summary.failed(),
            cancelled,
            "sweep finished"
        );
        (self.events)(AppEvent::SweepFinished {
            completed: summary.completed(),
            failed: summary.failed(),
            cancelled,
            trace_id: trace_id.to_string(),
        });
        summary
    }

    fn run_item(&self, item: &SweepItem) -> Result<(PathBuf, u64), AppError> {
        let trace_id = self.trace_id.as_str();
        let serial = self.serial.as_str();
        let executor = &self.executor;
        let timing = &self.timing;

        let remote_audio = remote_audio_path(&timing.remote_dir, &item.path);
        executor.run_checked(
            &AdbCommand::push(Some(serial), &item.path, &remote_audio),
            timing.transfer_timeout,
            trace_id,
        )?;

        let label = item.label.as_str();
        let remote_recording = join_device_path(
            &timing.remote_dir,
            &remote_artifact_name(&format!("rec_{label}"), "wav", timing.unique_remote_names),
        );
        let record_secs = record_duration_secs(item.duration_secs, timing.record_padding_secs);
        let spec = recorder_spec(&remote_recording, &self.capture, Some(record_secs));
        let mut recorder = BackgroundTask::spawn(
            executor,
            spec.label.clone(),
            &spec.launch_command(serial),
            OutputTarget::Discard,
            Some(spec.kill_command(serial)),
            trace_id,
        )?;
        if !timing.recorder_startup.is_zero() {
            std::thread::sleep(timing.recorder_startup);
        }

        let play_timeout = Duration::from_secs(item.duration_secs.ceil() as u64 + timing.play_margin_secs);
        let played = executor.run_checked(
            &AdbCommand::shell(Some(serial), tinyplay_command(&remote_audio, &self.playback)),
            play_timeout,
            trace_id,
        );
        if let Err(err) = played {
            recorder.terminate(timing.stop_grace, trace_id);
            return Err(err);
        }

        let record_timeout = Duration::from_secs(record_secs + timing.play_margin_secs);
        if let Err(err) = recorder.wait(record_timeout, trace_id) {
            warn!(trace_id = %trace_id, error = %err, "recorder overran; stopping it");
            recorder.terminate(timing.stop_grace, trace_id);
        }

        let size_bytes = check_remote_recording(
            executor.as_ref(),
            serial,
            &remote_recording,
            timing.min_valid_bytes,
            timing.command_timeout,
            trace_id,
        )?;
        let local = self.batch_dir.join(format!("{label}.wav"));
        executor.run_checked(
            &AdbCommand::pull(Some(serial), &remote_recording, &local),
            timing.transfer_timeout,
            trace_id,
        )?;

        if timing.delete_remote_after_pull {
            let cleanup = AdbCommand::shell(
                Some(serial),
                ["rm", "-f", remote_recording.as_str(), remote_audio.as_str()],
            );
            if let Err(err) = executor.run_checked(&cleanup, timing.command_timeout, trace_id) {
                warn!(trace_id = %trace_id, error = %err, "sweep cleanup failed");
            }
        }
        Ok((local, size_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::fake::ScriptedAdb;
    use crate::app::error::{ERR_RESULT, ERR_VALIDATION};
    use crate::app::events::collecting_sink;
    use tempfile::TempDir;

    fn write_wav(path: &Path, sample_rate: u32, frames: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
        for _ in 0..frames {
            writer.write_sample(0i16).expect("sample");
        }
        writer.finalize().expect("finalize");
    }

    fn timing() -> SweepTiming {
        let mut config = AppConfig::default();
        config.session.unique_remote_names = false;
        let mut timing = SweepTiming::from_config(&config);
        timing.pause_between = Duration::ZERO;
        timing.recorder_startup = Duration::ZERO;
        timing.stop_grace = Duration::from_millis(50);
        timing
    }

    #[test]
    fn frequency_parsing_handles_units() {
        assert_eq!(frequency_from_name("sweep_1kHz.wav"), Some(1000.0));
        assert_eq!(frequency_from_name("tone_1.5KHZ.wav"), Some(1500.0));
        assert_eq!(frequency_from_name("250hz_left.wav"), Some(250.0));
        assert_eq!(frequency_from_name("pink_noise.wav"), None);
    }

    #[test]
    fn files_sort_by_frequency_then_name() {
        let ordered = order_sweep_files(vec![
            PathBuf::from("b_noise.wav"),
            PathBuf::from("10kHz.wav"),
            PathBuf::from("a_noise.wav"),
            PathBuf::from("500Hz.wav"),
            PathBuf::from("2kHz.wav"),
        ]);
        let names: Vec<_> = ordered.iter().map(|path| file_name(path)).collect();
        assert_eq!(names, ["500Hz.wav", "2kHz.wav", "10kHz.wav", "a_noise.wav", "b_noise.wav"]);
    }

    #[test]
    fn durations_round_up_and_pad() {
        let tmp = TempDir::new().expect("tmp");
        let path = tmp.path().join("1kHz.wav");
        write_wav(&path, 8000, 12000);
        let secs = wav_duration_secs(&path, "t").expect("duration");
        assert!((secs - 1.5).abs() < 1e-9);
        assert_eq!(record_duration_secs(secs, 2), 4);
        assert_eq!(record_duration_secs(3.0, 2), 5);
    }

    #[test]
    fn labels_prefer_frequency() {
        assert_eq!(item_label(Path::new("/x/sweep_1kHz.wav")), "1000Hz");
        assert_eq!(item_label(Path::new("/x/sweep_62.5Hz.wav")), "62.5Hz");
        assert_eq!(item_label(Path::new("/x/pink noise.wav")), "pink_noise");
    }

    #[test]
    fn repeated_frequencies_get_distinct_labels() {
        let labels = batch_labels(&[
            PathBuf::from("left_1kHz.wav"),
            PathBuf::from("1000Hz.wav"),
            PathBuf::from("right_1kHz.wav"),
            PathBuf::from("1000Hz_2.wav"),
        ]);
        assert_eq!(labels, ["1000Hz", "1000Hz_2", "1000Hz_3", "1000Hz_2_2"]);
    }

    #[test]
    fn same_frequency_files_are_saved_separately() {
        let tmp = TempDir::new().expect("tmp");
        let left = tmp.path().join("left_1kHz.wav");
        let right = tmp.path().join("right_1kHz.wav");
        write_wav(&left, 8000, 80);
        write_wav(&right, 8000, 80);

        let adb = Arc::new(ScriptedAdb::new());
        adb.spawn_exits("tinycap", Some(0), "");
        adb.respond("ls -la", 0, "-rw-rw---- 1 root sdcard_rw 48000 2024-05-01 10:00 rec.wav\n", "");
        let executor: Arc<dyn AdbExecutor> = adb.clone();
        let (sink, _events) = collecting_sink();

        let summary = start_sweep(
            executor,
            &OutputLayout::new(tmp.path().join("out")),
            SweepRequest {
                serial: "S1".to_string(),
                files: vec![left, right],
                capture: CaptureParams::default(),
                playback: PlaybackParams::default(),
                batch_name: Some("b".to_string()),
            },
            timing(),
            sink,
            "t",
        )
        .expect("start")
        .join("t")
        .expect("join");

        assert_eq!(summary.completed(), 2);
        let paths: Vec<String> = summary
            .items
            .iter()
            .map(|item| item.local_path.clone().expect("local"))
            .collect();
        assert_ne!(paths[0], paths[1]);
        assert!(paths[0].ends_with("1000Hz.wav"));
        assert!(paths[1].ends_with("1000Hz_2.wav"));
        assert!(paths.iter().all(|path| Path::new(path).is_file()));
        assert!(adb
            .calls()
            .iter()
            .any(|call| call.starts_with("spawn:") && call.contains("rec_1000Hz_2.wav")));
    }

    #[test]
    fn list_skips_non_wav_files() {
        let tmp = TempDir::new().expect("tmp");
        write_wav(&tmp.path().join("2kHz.wav"), 8000, 10);
        write_wav(&tmp.path().join("100Hz.WAV"), 8000, 10);
        fs::write(tmp.path().join("notes.txt"), "x").expect("write");
        let names: Vec<_> = list_sweep_files(tmp.path(), "t")
            .expect("list")
            .iter()
            .map(|path| file_name(path))
            .collect();
        assert_eq!(names, ["100Hz.WAV", "2kHz.wav"]);
    }

    #[test]
    fn batch_records_each_file_in_order() {
        let tmp = TempDir::new().expect("tmp");
        let high = tmp.path().join("sweep_2kHz.wav");
        let low = tmp.path().join("sweep_250Hz.wav");
        write_wav(&high, 8000, 800);
        write_wav(&low, 8000, 800);

        let adb = Arc::new(ScriptedAdb::new());
        adb.spawn_exits("tinycap", Some(0), "");
        adb.respond(
            "ls -la",
            0,
            "-rw-rw---- 1 root sdcard_rw 48000 2024-05-01 10:00 rec.wav\n",
            "",
        );
        let executor: Arc<dyn AdbExecutor> = adb.clone();
        let (sink, events) = collecting_sink();
        let layout = OutputLayout::new(tmp.path().join("out"));

        let handle = start_sweep(
            executor,
            &layout,
            SweepRequest {
                serial: "S1".to_string(),
                files: vec![high, low],
                capture: CaptureParams::default(),
                playback: PlaybackParams::default(),
                batch_name: Some("batch1".to_string()),
            },
            timing(),
            sink,
            "trace-sweep",
        )
        .expect("start");
        assert_eq!(handle.total(), 2);
        let summary = handle.join("trace-sweep").expect("join");

        assert!(!summary.cancelled);
        assert_eq!(summary.completed(), 2);
        assert_eq!(summary.items[0].file, "sweep_250Hz.wav");
        let first = summary.items[0].local_path.clone().expect("local");
        assert!(first.ends_with("250Hz.wav"));
        assert!(Path::new(&first).starts_with(tmp.path().join("out").join("sweep").join("batch1")));

        let calls = adb.calls();
        let spawn = calls
            .iter()
            .find(|call| call.starts_with("spawn:"))
            .expect("recorder spawn");
        assert!(spawn.contains("/sdcard/sweep/rec_250Hz.wav"));
        assert!(spawn.ends_with("-T 3"));
        assert_eq!(adb.count_calls("shell tinyplay"), 2);

        let events = events.lock().unwrap();
        assert!(matches!(
            events.last(),
            Some(AppEvent::SweepFinished { completed: 2, failed: 0, cancelled: false, .. })
        ));
    }

    #[test]
    fn failed_item_does_not_stop_batch() {
        let tmp = TempDir::new().expect("tmp");
        let a = tmp.path().join("100Hz.wav");
        let b = tmp.path().join("200Hz.wav");
        write_wav(&a, 8000, 80);
        write_wav(&b, 8000, 80);

        let adb = Arc::new(ScriptedAdb::new());
        adb.spawn_exits("tinycap", Some(0), "");
        adb.respond("ls -la", 0, "-rw-rw---- 1 root sdcard_rw 48000 2024-05-01 10:00 rec.wav\n", "");
        adb.respond_once("ls -la", 1, "", "No such file or directory");
        let executor: Arc<dyn AdbExecutor> = adb.clone();
        let (sink, _events) = collecting_sink();

        let summary = start_sweep(
            executor,
            &OutputLayout::new(tmp.path()),
            SweepRequest {
                serial: "S1".to_string(),
                files: vec![a, b],
                capture: CaptureParams::default(),
                playback: PlaybackParams::default(),
                batch_name: None,
            },
            timing(),
            sink,
            "t",
        )
        .expect("start")
        .join("t")
        .expect("join");

        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.items[0].error.as_ref().map(|err| err.code.as_str()), Some(ERR_RESULT));
        assert!(summary.items[1].error.is_none());
    }

    #[test]
    fn stop_flag_is_checked_between_items() {
        let tmp = TempDir::new().expect("tmp");
        let a = tmp.path().join("100Hz.wav");
        write_wav(&a, 8000, 80);
        let adb = Arc::new(ScriptedAdb::new());
        let worker = SweepWorker {
            executor: adb.clone(),
            serial: "S1".to_string(),
            capture: CaptureParams::default(),
            playback: PlaybackParams::default(),
            timing: timing(),
            batch_dir: tmp.path().to_path_buf(),
            events: crate::app::events::noop_sink(),
            trace_id: "t".to_string(),
        };
        let stop = AtomicBool::new(true);

        let summary = worker.run(
            &[SweepItem {
                path: a,
                label: "100Hz".to_string(),
                duration_secs: 0.01,
            }],
            &stop,
        );

        assert!(summary.cancelled);
        assert!(summary.items.is_empty());
        assert!(adb.calls().is_empty());
    }

    #[test]
    fn missing_file_is_rejected_before_any_adb_call() {
        let tmp = TempDir::new().expect("tmp");
        let adb = Arc::new(ScriptedAdb::new());
        let executor: Arc<dyn AdbExecutor> = adb.clone();
        let err = start_sweep(
            executor,
            &OutputLayout::new(tmp.path()),
            SweepRequest {
                serial: "S1".to_string(),
                files: vec![tmp.path().join("absent_1kHz.wav")],
                capture: CaptureParams::default(),
                playback: PlaybackParams::default(),
                batch_name: None,
            },
            timing(),
            crate::app::events::noop_sink(),
            "t",
        )
        .err()
        .expect("missing file");
        assert_eq!(err.code, ERR_VALIDATION);
        assert!(adb.calls().is_empty());
    }
}
