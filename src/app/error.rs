use serde::{Deserialize, Serialize};
use std::fmt;

pub const ERR_NOT_FOUND: &str = "ERR_NOT_FOUND";
pub const ERR_UNAVAILABLE: &str = "ERR_UNAVAILABLE";
pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_TOOL: &str = "ERR_TOOL";
pub const ERR_TOOL_TIMEOUT: &str = "ERR_TOOL_TIMEOUT";
pub const ERR_TRANSFER: &str = "ERR_TRANSFER";
pub const ERR_INTERNAL: &str = "ERR_INTERNAL";

/// Error shared by the host and the orchestrator. It is serialised as-is over
/// the wire, so a host-side failure keeps its code on the caller side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

    pub fn not_found(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_NOT_FOUND, message, trace_id)
    }

    pub fn unavailable(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_UNAVAILABLE, message, trace_id)
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    pub fn tool(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TOOL, message, trace_id)
    }

    pub fn tool_timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TOOL_TIMEOUT, message, trace_id)
    }

    pub fn transfer(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TRANSFER, message, trace_id)
    }

    pub fn internal(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_INTERNAL, message, trace_id)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ERR_NOT_FOUND
    }

    pub fn is_tool_failure(&self) -> bool {
        self.code == ERR_TOOL || self.code == ERR_TOOL_TIMEOUT
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
