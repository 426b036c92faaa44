use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::app::adb::paths::{sanitize_filename_component, timestamp_now};
use crate::app::config::OutputSettings;
use crate::app::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Logcat,
    Screenshots,
    MicTest,
    Sweep,
    Loopback,
    HalDump,
}

impl OutputKind {
    pub const ALL: [OutputKind; 6] = [
        OutputKind::Logcat,
        OutputKind::Screenshots,
        OutputKind::MicTest,
        OutputKind::Sweep,
        OutputKind::Loopback,
        OutputKind::HalDump,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            OutputKind::Logcat => "logcat",
            OutputKind::Screenshots => "screenshots",
            OutputKind::MicTest => "mic_test",
            OutputKind::Sweep => "sweep",
            OutputKind::Loopback => "loopback",
            OutputKind::HalDump => "hal_dump",
        }
    }
}

/// Local tree that pulled artifacts land in: `<root>/<kind>/<prefix>_<serial>_<timestamp>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

pub fn default_output_root() -> PathBuf {
    dirs::document_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("AcouTest")
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_settings(settings: &OutputSettings) -> Self {
        let configured = settings.output_root.trim();
        if configured.is_empty() {
            Self::new(default_output_root())
        } else {
            Self::new(configured)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, kind: OutputKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    pub fn ensure_dir(&self, kind: OutputKind, trace_id: &str) -> Result<PathBuf, AppError> {
        let dir = self.dir(kind);
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::system(
                format!("Failed to create output dir {}: {err}", dir.display()),
                trace_id,
            )
        })?;
        Ok(dir)
    }

    pub fn timestamped_file(
        &self,
        kind: OutputKind,
        prefix: &str,
        serial: &str,
        extension: &str,
        trace_id: &str,
    ) -> Result<PathBuf, AppError> {
        let dir = self.ensure_dir(kind, trace_id)?;
        let name = format!(
            "{}_{}_{}.{}",
            sanitize_filename_component(prefix),
            sanitize_filename_component(serial),
            timestamp_now(),
            extension.trim_start_matches('.')
        );
        Ok(dir.join(name))
    }

    /// A fresh sub-directory for multi-file artifacts (HAL dumps, sweep batches).
    pub fn timestamped_dir(
        &self,
        kind: OutputKind,
        serial: &str,
        trace_id: &str,
    ) -> Result<PathBuf, AppError> {
        let dir = self.ensure_dir(kind, trace_id)?.join(format!(
            "{}_{}",
            sanitize_filename_component(serial),
            timestamp_now()
        ));
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::system(
                format!("Failed to create output dir {}: {err}", dir.display()),
                trace_id,
            )
        })?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn files_land_under_kind_directory() {
        let tmp = TempDir::new().expect("tmp");
        let layout = OutputLayout::new(tmp.path());
        let path = layout
            .timestamped_file(OutputKind::Loopback, "loopback", "192.168.1.20:5555", "wav", "t")
            .expect("path");
        assert_eq!(path.parent(), Some(tmp.path().join("loopback").as_path()));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("loopback_192.168.1.20_5555_"));
        assert!(name.ends_with(".wav"));
        assert!(tmp.path().join("loopback").is_dir());
    }

    #[test]
    fn empty_setting_uses_default_root() {
        let layout = OutputLayout::from_settings(&OutputSettings {
            output_root: "  ".to_string(),
            delete_remote_after_pull: true,
        });
        assert_eq!(layout.root(), default_output_root().as_path());
    }

    #[test]
    fn directory_names_are_distinct() {
        let mut names: Vec<_> = OutputKind::ALL.iter().map(|kind| kind.dir_name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), OutputKind::ALL.len());
    }
}
