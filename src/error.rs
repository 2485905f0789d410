//! Error types for the comparison pipeline

use crate::ArtifactRole;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Message returned to callers for any rejected request
pub const VALIDATION_MESSAGE: &str = "Both urlA and urlB are required.";

/// Message returned to callers for any failure after validation
pub const FAILURE_MESSAGE: &str = "Failed to compare screenshots.";

/// Errors that can occur while capturing and comparing pages
#[derive(Error, Debug)]
pub enum Error {
    /// The request is missing a field or carries a malformed one
    #[error("Invalid request: {0}")]
    ValidationError(String),

    /// The page could not be loaded (DNS, connection, or timeout)
    #[error("Navigation failed: {0}")]
    NavigationError(String),

    /// The browser failed while scrolling, evaluating, or capturing
    #[error("Rendering failed: {0}")]
    RenderError(String),

    /// Rendering one of the two pages failed
    #[error("Capture of page {role} failed: {source}")]
    CaptureFailed {
        role: ArtifactRole,
        #[source]
        source: Box<Error>,
    },

    /// Normalization produced a region without pixels
    #[error("Normalized region is empty ({width}x{height})")]
    EmptyRegion { width: u32, height: u32 },

    /// The browser process or a browsing context could not be created
    #[error("Browser initialization failed: {0}")]
    InitializationError(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// No artifact is stored under the given reference
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// Artifact storage I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected failure (image decode, diff preconditions, task panics)
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl Error {
    /// Wrap a render failure with the page it belongs to.
    pub fn capture(role: ArtifactRole, source: Error) -> Self {
        Error::CaptureFailed {
            role,
            source: Box::new(source),
        }
    }

    /// Whether the caller is at fault (400-class) rather than the pipeline.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::ValidationError(_))
    }

    /// Whether this failure (or the capture failure it wraps) is a navigation failure.
    pub fn is_navigation(&self) -> bool {
        match self {
            Error::NavigationError(_) => true,
            Error::CaptureFailed { source, .. } => source.is_navigation(),
            _ => false,
        }
    }

    /// The only text that may reach a remote caller. Details stay in the logs.
    pub fn public_message(&self) -> &'static str {
        if self.is_client_error() {
            VALIDATION_MESSAGE
        } else {
            FAILURE_MESSAGE
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::InternalError(format!("Image codec failure: {}", err))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::InternalError(format!("Background task failed: {}", err))
    }
}
