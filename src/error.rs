use std::time::Duration;
use thiserror::Error;

/// Errors raised while orchestrating embedded services
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("failed to launch `{program}`: {reason}")]
    ProcessLaunch { program: String, reason: String },

    #[error("`{process}` did not report `{token}` within {waited:?}{detail}")]
    ReadinessTimeout {
        process: String,
        token: String,
        waited: Duration,
        detail: String,
    },

    #[error("provisioning script failed (exit code {code:?}): {output}")]
    Provisioning { code: Option<i32>, output: String },

    #[error("failed to register collection `{collection}`: {reason}")]
    IndexRegistration { collection: String, reason: String },

    #[error("search in `{collection}` failed: {reason}")]
    Search { collection: String, reason: String },

    #[error("{service} is {state}, cannot {operation}")]
    InvalidState {
        service: String,
        state: String,
        operation: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serde_yaml::Error> for HarnessError {
    fn from(e: serde_yaml::Error) -> Self {
        HarnessError::Config(e.to_string())
    }
}

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;
