use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AmiError {
    #[error("connection error: {message}")]
    Connection { message: String },
    #[error("authentication failed: {message}")]
    Authentication { message: String },
    #[error("action {action} timed out after {}ms", .timeout.as_millis())]
    ActionTimeout { action: String, timeout: Duration },
    #[error("action {action} rejected: {message}")]
    ActionRejected { action: String, message: String },
    #[error("call not found: {call_id}")]
    CallNotFound { call_id: String },
    #[error("not connected to manager interface")]
    NotConnected,
    #[error("{operation} is not implemented")]
    NotImplemented { operation: String },
}

impl AmiError {
    pub fn connection(message: impl ToString) -> Self {
        AmiError::Connection {
            message: message.to_string(),
        }
    }

    pub fn call_not_found(call_id: &str) -> Self {
        AmiError::CallNotFound {
            call_id: call_id.to_string(),
        }
    }
}

impl From<std::io::Error> for AmiError {
    fn from(e: std::io::Error) -> Self {
        AmiError::connection(e)
    }
}

pub type AmiResult<T> = std::result::Result<T, AmiError>;
