//! Error types for the camera client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CamError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Protocol: {0}")]
    Protocol(String),

    #[error("Camera command {name} failed: {message}")]
    Command { name: String, message: String },

    #[error("Transfer of {file} failed: {reason}")]
    Transfer { file: String, reason: String },

    #[error("{failed} of {total} files could not be copied")]
    Batch { failed: usize, total: usize },

    #[error("Config: {0}")]
    Config(String),

    #[error("Not supported by this camera backend: {0}")]
    Unsupported(&'static str),

    #[error("No camera found")]
    NoDevice,

    #[error("Camera not connected")]
    NotConnected,
}

impl From<nix::Error> for CamError {
    fn from(e: nix::Error) -> Self {
        Self::Io(std::io::Error::from(e))
    }
}

pub type Result<T> = std::result::Result<T, CamError>;
