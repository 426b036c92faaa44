use std::sync::Arc;

use serde::Serialize;

use crate::app::error::AppError;
use crate::app::session::{SessionKind, SessionPhase, StopReport};
use crate::app::sweep::SweepItemResult;

/// Everything a presentation layer needs to follow background work. Emitted from
/// whichever thread did the work; the receiver marshals onto its own loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AppEvent {
    SessionPhase {
        kind: SessionKind,
        phase: SessionPhase,
        status: String,
        trace_id: String,
    },
    SessionFailed {
        kind: SessionKind,
        error: AppError,
    },
    SessionCompleted {
        kind: SessionKind,
        report: StopReport,
        trace_id: String,
    },
    LogcatLines {
        serial: String,
        lines: Vec<String>,
    },
    SweepProgress {
        index: usize,
        total: usize,
        file: String,
        trace_id: String,
    },
    SweepItem {
        result: SweepItemResult,
        trace_id: String,
    },
    SweepFinished {
        completed: usize,
        failed: usize,
        cancelled: bool,
        trace_id: String,
    },
}

pub type EventSink = Arc<dyn Fn(AppEvent) + Send + Sync>;

pub fn noop_sink() -> EventSink {
    Arc::new(|_event| {})
}

#[cfg(test)]
pub fn collecting_sink() -> (EventSink, Arc<std::sync::Mutex<Vec<AppEvent>>>) {
    let store = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink_store = Arc::clone(&store);
    let sink: EventSink = Arc::new(move |event| {
        if let Ok(mut guard) = sink_store.lock() {
            guard.push(event);
        }
    });
    (sink, store)
}
