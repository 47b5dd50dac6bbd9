use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("timed out after {timeout_sec}s while running `{command}`")]
    Timeout { command: String, timeout_sec: u64 },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}

impl SolverError {
    /// Structured failure details for `--json` output, when the error carries any.
    pub fn process_details(&self) -> Option<ProcessErrorDetails> {
        match self {
            SolverError::ProcessDetailed { details, .. } => Some(details.clone()),
            SolverError::Timeout {
                command,
                timeout_sec,
            } => Some(ProcessErrorDetails {
                error_code: "docker_wait_timeout".to_string(),
                hint: Some(format!(
                    "The container did not exit within {timeout_sec}s. Retry with a larger --timeout-sec."
                )),
                command: Some(command.clone()),
                raw_stderr: None,
            }),
            _ => None,
        }
    }
}
