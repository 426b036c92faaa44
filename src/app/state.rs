use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::app::adb::executor::{AdbExecutor, SystemAdb};
use crate::app::adb::locator::resolve_adb_program;
use crate::app::capture::LogcatRegistry;
use crate::app::config::{load_config_from_path, AppConfig};
use crate::app::error::AppError;
use crate::app::events::EventSink;
use crate::app::output::OutputLayout;
use crate::app::playback::HostPlayback;
use crate::app::registry::DeviceRegistry;
use crate::app::scheduler::TaskScheduler;
use crate::app::session::{RecordingSession, SessionKind, StopOutcome};
use crate::app::sweep::SweepHandle;

const HISTORY_LIMIT: usize = 50;

/// One finished test run, kept for the diagnostics bundle.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ActivityRecord {
    pub activity: String,
    pub serial: String,
    pub trace_id: String,
    pub finished_at: String,
    pub ok: bool,
    pub detail: String,
    pub local_paths: Vec<String>,
}

impl ActivityRecord {
    pub fn new(activity: impl Into<String>, serial: &str, trace_id: &str, result: Result<Vec<String>, &AppError>) -> Self {
        let (ok, detail, local_paths) = match result {
            Ok(paths) => (true, String::new(), paths),
            Err(err) => (false, format!("{} ({})", err.error, err.code), Vec::new()),
        };
        Self {
            activity: activity.into(),
            serial: serial.to_string(),
            trace_id: trace_id.to_string(),
            finished_at: Utc::now().to_rfc3339(),
            ok,
            detail,
            local_paths,
        }
    }
}

pub struct AppState {
    config_path: PathBuf,
    config: RwLock<AppConfig>,
    pub executor: Arc<dyn AdbExecutor>,
    pub registry: Mutex<DeviceRegistry>,
    sessions: HashMap<SessionKind, RecordingSession>,
    pub logcat: LogcatRegistry,
    pub sweep: Mutex<Option<SweepHandle>>,
    pub playback: HostPlayback,
    pub scheduler: TaskScheduler,
    pub events: EventSink,
    history: Mutex<VecDeque<ActivityRecord>>,
}

impl AppState {
    pub fn new(
        config_path: PathBuf,
        config: AppConfig,
        executor: Arc<dyn AdbExecutor>,
        playback: HostPlayback,
        events: EventSink,
    ) -> Self {
        let sessions = SessionKind::ALL
            .iter()
            .map(|kind| {
                (
                    *kind,
                    RecordingSession::new(*kind, Arc::clone(&executor), Arc::clone(&events)),
                )
            })
            .collect();
        Self {
            config_path,
            config: RwLock::new(config),
            executor,
            registry: Mutex::new(DeviceRegistry::new()),
            sessions,
            logcat: LogcatRegistry::new(),
            sweep: Mutex::new(None),
            playback,
            scheduler: TaskScheduler::new(),
            events,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Config from `path` (see [`crate::app::config::config_path`] for the default),
    /// the real adb binary and the real playback backend.
    pub fn load(path: PathBuf, events: EventSink, trace_id: &str) -> Result<Self, AppError> {
        let config = load_config_from_path(&path, trace_id)?;
        let program = resolve_adb_program(&config.adb.command_path);
        let executor: Arc<dyn AdbExecutor> = Arc::new(SystemAdb::new(program));
        Ok(Self::new(path, config, executor, HostPlayback::system(), events))
    }

    pub fn config(&self) -> AppConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn replace_config(&self, config: AppConfig) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    pub fn layout(&self) -> OutputLayout {
        OutputLayout::from_settings(&self.config().output)
    }

    pub fn session(&self, kind: SessionKind) -> Option<&RecordingSession> {
        self.sessions.get(&kind)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &RecordingSession> {
        SessionKind::ALL
            .iter()
            .filter_map(|kind| self.sessions.get(kind))
    }

    pub fn record(&self, record: ActivityRecord) {
        if let Ok(mut guard) = self.history.lock() {
            if guard.len() >= HISTORY_LIMIT {
                guard.pop_front();
            }
            guard.push_back(record);
        }
    }

    pub fn history(&self) -> Vec<ActivityRecord> {
        self.history
            .lock()
            .map(|guard| guard.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Best effort on exit: running tests are stopped and collected, streams end.
    pub fn shutdown(&self, trace_id: &str) {
        let layout = self.layout();
        for session in self.sessions() {
            match session.stop(&layout, trace_id) {
                Ok(StopOutcome::NotRunning) | Ok(StopOutcome::Completed(_)) => {}
                Err(err) => {
                    warn!(trace_id = %trace_id, kind = session.kind().label(), error = %err, "session stop on shutdown failed");
                }
            }
        }
        self.logcat.stop_all(trace_id);
        if let Ok(guard) = self.sweep.lock() {
            if let Some(handle) = guard.as_ref() {
                handle.request_stop();
            }
        }
        self.playback.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::fake::ScriptedAdb;
    use crate::app::error::ERR_RESULT;
    use crate::app::events::noop_sink;
    use crate::app::playback::BackendLoader;

    fn unavailable() -> BackendLoader {
        Box::new(|| Err("none".to_string()))
    }

    fn state() -> AppState {
        AppState::new(
            PathBuf::from("/tmp/acoutest-state-test.json"),
            AppConfig::default(),
            Arc::new(ScriptedAdb::new()),
            HostPlayback::new(unavailable()),
            noop_sink(),
        )
    }

    #[test]
    fn every_kind_has_a_session() {
        let state = state();
        for kind in SessionKind::ALL {
            assert_eq!(state.session(kind).map(|session| session.kind()), Some(kind));
        }
        assert_eq!(state.sessions().count(), SessionKind::ALL.len());
    }

    #[test]
    fn history_is_bounded() {
        let state = state();
        let err = AppError::result("Recording is empty", "t");
        for index in 0..(HISTORY_LIMIT + 5) {
            state.record(ActivityRecord::new("mic", "S1", &format!("t{index}"), Err(&err)));
        }
        let history = state.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].trace_id, "t5");
        assert!(history[0].detail.contains(ERR_RESULT));
        assert!(!history[0].ok);
    }

    #[test]
    fn replacing_config_is_visible() {
        let state = state();
        let mut config = state.config();
        config.output.output_root = "/data/out".to_string();
        state.replace_config(config);
        assert_eq!(state.layout().root(), Path::new("/data/out"));
    }

    #[test]
    fn shutdown_with_nothing_running_is_quiet() {
        let state = state();
        state.shutdown("t");
        assert!(state.history().is_empty());
    }
}
