use std::io;
use std::path::PathBuf;

use thiserror::Error as ThisError;

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("invalid grid label '{label}': {reason}")]
    InvalidLabel { label: String, reason: String },

    #[error("invalid grid: {0}")]
    InvalidGrid(String),
}

impl GridError {
    pub(crate) fn label(label: &str, reason: impl Into<String>) -> Self {
        GridError::InvalidLabel {
            label: label.to_string(),
            reason: reason.into(),
        }
    }
}

/// Validation failures for a decision returned by the model.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("unknown action type '{0}'")]
    UnknownActionType(String),

    #[error("{action} action requires '{field}' field")]
    MissingField { action: String, field: String },

    #[error("SCROLL value must be 'up' or 'down', got '{0}'")]
    InvalidScrollDirection(String),

    #[error(transparent)]
    InvalidLabel(#[from] GridError),
}

#[derive(ThisError, Debug)]
pub enum DeviceError {
    #[error("screenshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("device command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("device command `{0}` timed out")]
    Timeout(String),

    #[error("adb not found, install Android SDK platform tools")]
    NotFound,

    #[error("no device connected")]
    NoDevice,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(ThisError, Debug)]
pub enum DecisionError {
    #[error("ANTHROPIC_API_KEY is not set")]
    MissingApiKey,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("no text content in response")]
    EmptyResponse,
}

#[derive(ThisError, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),

    #[error(transparent)]
    Grid(#[from] GridError),
}
