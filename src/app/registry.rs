use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::command::AdbCommand;
use crate::app::adb::executor::AdbExecutor;
use crate::app::adb::parse::{classify_connect_output, parse_adb_devices, ConnectOutcome};
use crate::app::error::AppError;
use crate::app::models::{DeviceSummary, HostCommandResult, RefreshStatus};

/// The attached devices as of the last refresh, plus the one device every command targets.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<DeviceSummary>,
    selected: Option<String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn devices(&self) -> &[DeviceSummary] {
        &self.devices
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Not checked against the last refresh; a stale id simply makes later commands fail.
    pub fn select(&mut self, serial: &str) {
        let serial = serial.trim();
        self.selected = if serial.is_empty() {
            None
        } else {
            Some(serial.to_string())
        };
    }

    /// Runs `adb devices -l`. Tool problems come back as `Unavailable`, never as an error.
    pub fn refresh(
        &mut self,
        executor: &dyn AdbExecutor,
        timeout: Duration,
        trace_id: &str,
    ) -> RefreshStatus {
        let output = match executor.run(&AdbCommand::devices(), timeout, trace_id) {
            Ok(output) => output,
            Err(err) => {
                warn!(trace_id = %trace_id, code = %err.code, error = %err.error, "device refresh unavailable");
                let reason = if err.is_timeout() {
                    "adb did not answer in time".to_string()
                } else {
                    err.error
                };
                return RefreshStatus::Unavailable { reason };
            }
        };
        if !output.success() {
            let reason = format!("adb devices failed: {}", output.error_detail());
            warn!(trace_id = %trace_id, reason = %reason, "device refresh unavailable");
            return RefreshStatus::Unavailable { reason };
        }
        let status = self.apply_listing(&output.stdout);
        if let RefreshStatus::Ok {
            devices,
            excluded,
            selected,
        } = &status
        {
            info!(
                trace_id = %trace_id,
                connected = devices.len(),
                excluded = excluded.len(),
                selected = ?selected,
                "device list refreshed"
            );
        }
        status
    }

    /// Replaces the list wholesale from raw `adb devices` output and re-resolves selection.
    pub fn apply_listing(&mut self, stdout: &str) -> RefreshStatus {
        let (connected, excluded): (Vec<_>, Vec<_>) = parse_adb_devices(stdout)
            .into_iter()
            .partition(|device| device.state.is_connected());
        self.devices = connected;

        let still_present = self
            .selected
            .as_deref()
            .map(|serial| self.devices.iter().any(|device| device.serial == serial))
            .unwrap_or(false);
        if !still_present {
            self.selected = self.devices.first().map(|device| device.serial.clone());
        }

        RefreshStatus::Ok {
            devices: self.devices.clone(),
            excluded,
            selected: self.selected.clone(),
        }
    }

    /// Returns the selected serial, refreshing once if nothing is selected yet.
    pub fn ensure_selected(
        &mut self,
        executor: &dyn AdbExecutor,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<String, AppError> {
        if let Some(selected) = self.selected.clone() {
            return Ok(selected);
        }
        match self.refresh(executor, timeout, trace_id) {
            RefreshStatus::Ok { .. } => self
                .selected
                .clone()
                .ok_or_else(|| AppError::validation("No device connected", trace_id)),
            RefreshStatus::Unavailable { reason } => Err(AppError::environment(
                format!("No device: {reason}"),
                trace_id,
            )),
        }
    }

    /// `adb connect host:port`. Only emptiness of the address is checked; adb judges the rest.
    pub fn connect_network(
        &mut self,
        executor: &dyn AdbExecutor,
        address: &str,
        timeout: Duration,
        list_timeout: Duration,
        trace_id: &str,
    ) -> Result<HostCommandResult, AppError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(AppError::validation("address is required", trace_id));
        }
        let output = executor.run(&AdbCommand::connect(address), timeout, trace_id)?;
        match classify_connect_output(&output.stdout, &output.stderr) {
            ConnectOutcome::Connected => {
                info!(trace_id = %trace_id, address = %address, "network device connected");
                self.refresh(executor, list_timeout, trace_id);
                Ok(HostCommandResult {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.exit_code,
                })
            }
            ConnectOutcome::Failed(detail) => {
                let detail = if detail.is_empty() {
                    output.error_detail()
                } else {
                    detail
                };
                Err(AppError::dependency(
                    format!("adb connect failed: {detail}"),
                    trace_id,
                ))
            }
        }
    }
}
