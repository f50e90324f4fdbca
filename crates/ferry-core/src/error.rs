use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Why the receiver could not be brought up.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("Server executable not found at {}", .0.display())]
    ExecutableMissing(PathBuf),

    #[error("Server failed to start: {diagnostics}")]
    Exited { port: u16, diagnostics: String },

    #[error("Could not find available port in range {first}-{last}")]
    PortsExhausted { first: u16, last: u16 },

    #[error("Failed to spawn server: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Output directory {} unusable: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a transfer did not complete.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Invalid {field}: {value}. Must be between {min} and {max}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Invalid {field} parameter")]
    Malformed { field: &'static str },

    #[error("Server is not running and failed to start: {0}")]
    NotRunning(#[source] StartError),

    #[error("Server stopped running before transfer could begin")]
    SessionLost,

    #[error("Transfer timed out after {}s - the file may be too large or the server may be busy", .0.as_secs())]
    Timeout(Duration),

    #[error("Transfer failed: {0}")]
    SenderFailure(String),

    #[error("Client executable not found at {}", .0.display())]
    SenderMissing(PathBuf),

    #[error("Transfer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// True for errors raised before anything was staged or spawned.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::OutOfRange { .. } | Self::Malformed { .. })
    }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("File '{0}' not found")]
    NotFound(String),

    #[error("Artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
}
