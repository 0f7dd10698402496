//! Worker RPC envelope
//!
//! A [`MethodCall`] travels from the engine to a worker slot, a
//! [`MethodResult`] travels back. Neither is persisted as such: the engine
//! folds the result into the atomic and subtask rows.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AtomicStatus;

/// A single method invocation on a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    /// Name of the handler in the executor's dispatch table
    pub method_name: String,

    /// Positional arguments
    pub args: Vec<Value>,
}

impl MethodCall {
    pub fn new(method_name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method_name: method_name.into(),
            args,
        }
    }
}

/// Failure detail of a method invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Additional error details (for debugging)
    pub details: Option<Value>,
}

impl MethodError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            details: None,
        }
    }

    /// The executor has no handler under this name
    pub fn unknown_method(method_name: &str) -> Self {
        Self::new(format!("unknown method: {}", method_name)).with_type("UNKNOWN_METHOD")
    }

    /// Arguments could not be decoded into the handler's parameter type
    pub fn invalid_arguments(method_name: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(format!("invalid arguments for {}: {}", method_name, reason))
            .with_type("INVALID_ARGUMENTS")
    }

    /// The worker went away before replying
    pub fn worker_crashed(method_name: &str) -> Self {
        Self::new(format!("worker crashed while running {}", method_name))
            .with_type("WORKER_CRASHED")
    }

    /// The worker did not reply within the configured call timeout
    pub fn timed_out(method_name: &str, timeout: std::time::Duration) -> Self {
        Self::new(format!(
            "{} did not finish within {}ms",
            method_name,
            timeout.as_millis()
        ))
        .with_type("TIMED_OUT")
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Raw detail stored on a failed atomic
    pub fn to_detail(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}

impl std::fmt::Display for MethodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MethodError {}

impl From<serde_json::Error> for MethodError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_type("SERIALIZATION")
    }
}

impl From<std::io::Error> for MethodError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string()).with_type("IO")
    }
}

/// Reply to a [`MethodCall`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodResult {
    pub method_name: String,
    pub result: Value,

    /// Present iff the call failed
    pub error: Option<MethodError>,

    /// Human readable error message, empty on success
    pub error_message: String,
}

impl MethodResult {
    pub fn success(method_name: impl Into<String>, result: Value) -> Self {
        Self {
            method_name: method_name.into(),
            result,
            error: None,
            error_message: String::new(),
        }
    }

    pub fn failure(method_name: impl Into<String>, error: MethodError) -> Self {
        Self {
            method_name: method_name.into(),
            result: Value::Null,
            error_message: error.message.clone(),
            error: Some(error),
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn status(&self) -> AtomicStatus {
        if self.failed() {
            AtomicStatus::Failed
        } else {
            AtomicStatus::Done
        }
    }
}
