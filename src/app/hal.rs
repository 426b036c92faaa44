use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::adb::command::AdbCommand;
use crate::app::adb::executor::AdbExecutor;
use crate::app::adb::parse::parse_getprop_map;
use crate::app::config::HalPropertyConfig;
use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HalProperty {
    pub name: String,
    pub value: String,
    pub enabled: bool,
}

/// Vendor properties that switch HAL dumping on. Each is set with its own `setprop`
/// call; there is no atomicity across the set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HalPropertySet {
    properties: Vec<HalProperty>,
}

impl HalPropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(entries: &[HalPropertyConfig]) -> Self {
        let mut set = Self::new();
        for entry in entries {
            set.set(&entry.name, &entry.value, entry.enabled);
        }
        set
    }

    /// Inserts or replaces, keeping first-insertion order.
    pub fn set(&mut self, name: &str, value: &str, enabled: bool) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        match self.properties.iter_mut().find(|prop| prop.name == name) {
            Some(existing) => {
                existing.value = value.trim().to_string();
                existing.enabled = enabled;
            }
            None => self.properties.push(HalProperty {
                name: name.to_string(),
                value: value.trim().to_string(),
                enabled,
            }),
        }
    }

    pub fn properties(&self) -> &[HalProperty] {
        &self.properties
    }

    pub fn enabled(&self) -> impl Iterator<Item = &HalProperty> {
        self.properties.iter().filter(|prop| prop.enabled)
    }

    pub fn is_active(&self) -> bool {
        self.enabled().next().is_some()
    }

    pub fn apply_commands(&self, device: Option<&str>) -> Vec<AdbCommand> {
        self.enabled()
            .map(|prop| AdbCommand::shell(device, ["setprop", prop.name.as_str(), prop.value.as_str()]))
            .collect()
    }

    pub fn clear_commands(&self, device: Option<&str>) -> Vec<AdbCommand> {
        self.enabled()
            .map(|prop| AdbCommand::shell(device, ["setprop", prop.name.as_str(), "0"]))
            .collect()
    }

    /// Stops at the first failing `setprop`; earlier ones stay set.
    pub fn apply(
        &self,
        executor: &dyn AdbExecutor,
        device: Option<&str>,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<usize, AppError> {
        let commands = self.apply_commands(device);
        for command in &commands {
            executor.run_checked(command, timeout, trace_id)?;
        }
        info!(trace_id = %trace_id, count = commands.len(), "hal properties applied");
        Ok(commands.len())
    }

    /// Best effort: every property is attempted, failures are collected.
    pub fn clear(
        &self,
        executor: &dyn AdbExecutor,
        device: Option<&str>,
        timeout: Duration,
        trace_id: &str,
    ) -> Vec<AppError> {
        let mut failures = Vec::new();
        for command in self.clear_commands(device) {
            if let Err(err) = executor.run_checked(&command, timeout, trace_id) {
                warn!(trace_id = %trace_id, error = %err, "failed to clear hal property");
                failures.push(err);
            }
        }
        failures
    }

    /// Current device-side values of the properties in this set.
    pub fn read_back(
        &self,
        executor: &dyn AdbExecutor,
        device: Option<&str>,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<HashMap<String, String>, AppError> {
        let output = executor.run_checked(&AdbCommand::shell(device, ["getprop"]), timeout, trace_id)?;
        let all = parse_getprop_map(&output.stdout);
        Ok(self
            .properties
            .iter()
            .map(|prop| {
                (
                    prop.name.clone(),
                    all.get(&prop.name).cloned().unwrap_or_default(),
                )
            })
            .collect())
    }
}
