use serde::Serialize;
use std::fmt;

pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_DEPENDENCY: &str = "ERR_DEPENDENCY";
pub const ERR_ENVIRONMENT: &str = "ERR_ENVIRONMENT";
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
pub const ERR_RESULT: &str = "ERR_RESULT";
pub const ERR_UNAVAILABLE: &str = "ERR_UNAVAILABLE";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    /// Bad or missing user input; raised before any external command runs.
    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    /// An external command ran but failed (non-zero exit or error text).
    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEPENDENCY, message, trace_id)
    }

    /// The tool itself is missing or the device cannot be reached.
    pub fn environment(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_ENVIRONMENT, message, trace_id)
    }

    pub fn timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TIMEOUT, message, trace_id)
    }

    /// Commands succeeded but produced nothing usable.
    pub fn result(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_RESULT, message, trace_id)
    }

    pub fn unavailable(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_UNAVAILABLE, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ERR_TIMEOUT
    }

    /// Environment and timeout failures mean "adb could not be used right now".
    pub fn is_unreachable(&self) -> bool {
        self.code == ERR_ENVIRONMENT || self.code == ERR_TIMEOUT
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
