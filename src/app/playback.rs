//! "Play on this PC". The audio backend is probed on first use and the outcome is
//! kept for the life of the process; a host without audio only loses this action.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use serde::Serialize;
use tracing::{info, warn};

use crate::app::error::AppError;

pub trait PlaybackBackend: Send + Sync {
    fn name(&self) -> &str;
    /// Blocks until the file finished playing or `stop` was raised.
    fn play(&self, path: &Path, stop: &AtomicBool) -> Result<(), String>;
}

pub type BackendLoader = Box<dyn Fn() -> Result<Arc<dyn PlaybackBackend>, String> + Send + Sync>;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlaybackStatus {
    pub available: bool,
    pub backend: Option<String>,
    pub reason: Option<String>,
    pub playing: Option<String>,
}

struct PlaybackJob {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct HostPlayback {
    loader: BackendLoader,
    backend: OnceLock<Result<Arc<dyn PlaybackBackend>, String>>,
    current: Mutex<Option<PlaybackJob>>,
}

impl HostPlayback {
    /// The loader does not run here; it runs on the first call that needs audio.
    pub fn new(loader: BackendLoader) -> Self {
        Self {
            loader,
            backend: OnceLock::new(),
            current: Mutex::new(None),
        }
    }

    pub fn system() -> Self {
        Self::new(Box::new(default_loader))
    }

    fn backend(&self) -> Result<Arc<dyn PlaybackBackend>, String> {
        self.backend
            .get_or_init(|| {
                let loaded = (self.loader)();
                match &loaded {
                    Ok(backend) => info!(backend = backend.name(), "host playback available"),
                    Err(reason) => warn!(reason = %reason, "host playback unavailable"),
                }
                loaded
            })
            .clone()
    }

    pub fn is_available(&self) -> bool {
        self.backend().is_ok()
    }

    pub fn status(&self) -> PlaybackStatus {
        let playing = self.playing_path().map(|path| path.to_string_lossy().to_string());
        match self.backend() {
            Ok(backend) => PlaybackStatus {
                available: true,
                backend: Some(backend.name().to_string()),
                reason: None,
                playing,
            },
            Err(reason) => PlaybackStatus {
                available: false,
                backend: None,
                reason: Some(reason),
                playing: None,
            },
        }
    }

    fn playing_path(&self) -> Option<PathBuf> {
        let guard = self.current.lock().ok()?;
        guard
            .as_ref()
            .filter(|job| !job.thread.is_finished())
            .map(|job| job.path.clone())
    }

    pub fn is_playing(&self) -> bool {
        self.playing_path().is_some()
    }

    /// Starts playback on a worker thread, replacing anything already playing.
    pub fn play(&self, path: &Path, trace_id: &str) -> Result<(), AppError> {
        if !path.is_file() {
            return Err(AppError::validation(
                format!("Audio file not found: {}", path.display()),
                trace_id,
            ));
        }
        let backend = self.backend().map_err(|reason| {
            AppError::unavailable(format!("Local playback unavailable: {reason}"), trace_id)
        })?;

        let mut guard = self
            .current
            .lock()
            .map_err(|_| AppError::system("Playback state locked", trace_id))?;
        if let Some(previous) = guard.take() {
            previous.stop.store(true, Ordering::SeqCst);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let worker_path = path.to_path_buf();
        let trace = trace_id.to_string();
        let thread = std::thread::Builder::new()
            .name("host-playback".to_string())
            .spawn(move || {
                if let Err(err) = backend.play(&worker_path, &worker_stop) {
                    warn!(trace_id = %trace, path = %worker_path.display(), error = %err, "host playback failed");
                }
            })
            .map_err(|err| AppError::system(format!("Failed to start playback: {err}"), trace_id))?;

        info!(trace_id = %trace_id, path = %path.display(), "host playback started");
        *guard = Some(PlaybackJob {
            path: path.to_path_buf(),
            stop,
            thread,
        });
        Ok(())
    }

    /// Returns whether anything was playing.
    pub fn stop(&self) -> bool {
        let job = match self.current.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        match job {
            Some(job) => {
                let was_playing = !job.thread.is_finished();
                job.stop.store(true, Ordering::SeqCst);
                was_playing
            }
            None => false,
        }
    }
}

#[cfg(feature = "local-playback")]
fn default_loader() -> Result<Arc<dyn PlaybackBackend>, String> {
    rodio_backend::RodioBackend::probe().map(|backend| Arc::new(backend) as Arc<dyn PlaybackBackend>)
}

#[cfg(not(feature = "local-playback"))]
fn default_loader() -> Result<Arc<dyn PlaybackBackend>, String> {
    Err("built without the local-playback feature".to_string())
}

#[cfg(feature = "local-playback")]
mod rodio_backend {
    use std::fs::File;
    use std::io::BufReader;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use rodio::{Decoder, OutputStreamBuilder, Sink};

    use super::PlaybackBackend;

    pub struct RodioBackend;

    impl RodioBackend {
        /// Opens and drops the default output once to find out whether there is one.
        pub fn probe() -> Result<Self, String> {
            let stream = OutputStreamBuilder::open_default_stream()
                .map_err(|e| format!("Failed to open audio output: {e}"))?;
            drop(stream);
            Ok(Self)
        }
    }

    impl PlaybackBackend for RodioBackend {
        fn name(&self) -> &str {
            "rodio"
        }

        // OutputStream is not Send, so each playback opens its own on the worker thread.
        fn play(&self, path: &Path, stop: &AtomicBool) -> Result<(), String> {
            let stream = OutputStreamBuilder::open_default_stream()
                .map_err(|e| format!("Failed to open audio output: {e}"))?;
            let sink = Sink::connect_new(stream.mixer());

            let file = File::open(path).map_err(|e| format!("Failed to open {}: {e}", path.display()))?;
            let source = Decoder::new(BufReader::new(file))
                .map_err(|e| format!("Failed to decode {}: {e}", path.display()))?;
            sink.append(source);

            while !sink.empty() {
                if stop.load(Ordering::SeqCst) {
                    sink.stop();
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::error::{ERR_UNAVAILABLE, ERR_VALIDATION};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct SilentBackend {
        played: Mutex<Vec<PathBuf>>,
    }

    impl PlaybackBackend for SilentBackend {
        fn name(&self) -> &str {
            "silent"
        }

        fn play(&self, path: &Path, stop: &AtomicBool) -> Result<(), String> {
            self.played.lock().unwrap().push(path.to_path_buf());
            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }
    }

    fn audio_file(tmp: &TempDir) -> PathBuf {
        let path = tmp.path().join("tone.wav");
        std::fs::write(&path, b"RIFF").unwrap();
        path
    }

    #[test]
    fn failing_backend_is_probed_once_and_reported_unavailable() {
        let tmp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let playback = HostPlayback::new(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("no audio device".to_string())
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let path = audio_file(&tmp);
        let first = playback.play(&path, "t1").expect_err("unavailable");
        let second = playback.play(&path, "t2").expect_err("unavailable");

        assert_eq!(first.code, ERR_UNAVAILABLE);
        assert_eq!(second.code, ERR_UNAVAILABLE);
        assert!(!playback.is_available());
        assert_eq!(playback.status().reason.as_deref(), Some("no audio device"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_file_is_checked_before_probing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let playback = HostPlayback::new(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("unused".to_string())
        }));
        let err = playback
            .play(Path::new("/nonexistent/tone.wav"), "t")
            .expect_err("missing");
        assert_eq!(err.code, ERR_VALIDATION);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn play_then_stop() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(SilentBackend {
            played: Mutex::new(Vec::new()),
        });
        let shared = Arc::clone(&backend);
        let playback = HostPlayback::new(Box::new(move || Ok(shared.clone() as Arc<dyn PlaybackBackend>)));
        let path = audio_file(&tmp);

        playback.play(&path, "t").expect("play");
        let deadline = Instant::now() + Duration::from_secs(2);
        while backend.played.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(playback.is_playing());
        assert_eq!(playback.status().backend.as_deref(), Some("silent"));
        assert!(playback.stop());
        assert!(!playback.is_playing());
        assert!(!playback.stop());
        assert_eq!(backend.played.lock().unwrap().as_slice(), [path]);
    }

    #[cfg(not(feature = "local-playback"))]
    #[test]
    fn default_build_has_no_backend() {
        let playback = HostPlayback::system();
        assert!(!playback.is_available());
    }
}
