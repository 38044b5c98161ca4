use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source error [{camera}]: {reason}")]
    Source { camera: String, reason: String },

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Negotiation error [{client}]: {reason}")]
    Negotiation { client: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Shorthand for a source failure scoped to one camera.
    pub fn source(camera: impl Into<String>, reason: impl ToString) -> Self {
        AppError::Source {
            camera: camera.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a negotiation failure scoped to one client.
    pub fn negotiation(client: impl Into<String>, reason: impl ToString) -> Self {
        AppError::Negotiation {
            client: client.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, AppError>;
