use serde::Serialize;
use std::fmt;

pub const ERR_TRANSPORT_UNAVAILABLE: &str = "ERR_TRANSPORT_UNAVAILABLE";
pub const ERR_EMPTY_COMMAND: &str = "ERR_EMPTY_COMMAND";
pub const ERR_MISSING_PACKAGE_NAME: &str = "ERR_MISSING_PACKAGE_NAME";
pub const ERR_APK_NOT_FOUND: &str = "ERR_APK_NOT_FOUND";
pub const ERR_PROCESS_FAILURE: &str = "ERR_PROCESS_FAILURE";
pub const ERR_CANCELLED: &str = "ERR_CANCELLED";
pub const ERR_PROBE_FAILURE: &str = "ERR_PROBE_FAILURE";
pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
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

    pub fn transport_unavailable(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TRANSPORT_UNAVAILABLE, message, trace_id)
    }

    pub fn empty_command(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_EMPTY_COMMAND, message, trace_id)
    }

    pub fn missing_package_name(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_MISSING_PACKAGE_NAME, message, trace_id)
    }

    pub fn apk_not_found(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_APK_NOT_FOUND, message, trace_id)
    }

    pub fn process_failure(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_PROCESS_FAILURE, message, trace_id)
    }

    pub fn cancelled(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_CANCELLED, message, trace_id)
    }

    pub fn probe_failure(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_PROBE_FAILURE, message, trace_id)
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    /// True for failures detected before any process was spawned.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self.code.as_str(),
            ERR_EMPTY_COMMAND | ERR_MISSING_PACKAGE_NAME | ERR_APK_NOT_FOUND | ERR_VALIDATION
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
