use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::app::error::AppError;

/// Serializes state-changing work per device: starting or stopping a test, a sweep,
/// a screenshot. Different devices proceed in parallel.
#[derive(Default)]
pub struct TaskScheduler {
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_lock(&self, serial: &str) -> Arc<Mutex<()>> {
        let mut guard = match self.device_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .entry(serial.trim().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs `work` while holding the device's lock. A panic in an earlier holder does
    /// not block the device forever.
    pub fn with_device<T>(
        &self,
        serial: &str,
        work: impl FnOnce() -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let lock = self.device_lock(serial);
        let _guard: MutexGuard<'_, ()> = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        work()
    }
}
