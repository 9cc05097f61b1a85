use thiserror::Error;

use crate::types::PhotoSlot;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera configuration failed: {0}")]
    DeviceConfiguration(String),

    #[error("failed to persist {slot}: {source}")]
    Persistence {
        slot: PhotoSlot,
        #[source]
        source: StoreError,
    },

    #[error("capture was cancelled")]
    Cancelled,
}

impl CaptureError {
    /// Keeps the whole cause chain of `anyhow` errors.
    pub fn device(err: impl std::fmt::Display) -> Self {
        CaptureError::DeviceConfiguration(format!("{err:#}"))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upload rejected with status {status}")]
    Rejected { status: u16 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
