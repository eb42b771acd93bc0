//! Error types for the voice core

use thiserror::Error;

use crate::audio::{BusOwner, BusRole};

/// Result type alias for voice core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice core
#[derive(Debug, Error)]
pub enum Error {
    /// The bus is held by another role
    #[error("audio bus busy: held by {0:?}")]
    BusBusy(BusOwner),

    /// A read or write was attempted without holding the bus
    #[error("audio bus not owned by {0:?}")]
    NotOwner(BusRole),

    /// Hardware read/write/configure failure
    #[error("peripheral error: {0}")]
    Peripheral(String),

    /// Bounded queue is at capacity, the message was dropped
    #[error("queue full")]
    QueueFull,

    /// The other side of a queue is gone
    #[error("queue closed")]
    QueueClosed,

    /// Remote service returned an unusable answer
    #[error("service error: {0}")]
    Service(String),

    /// A bounded wait expired
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// WAV container error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<alsa::Error> for Error {
    fn from(e: alsa::Error) -> Self {
        Self::Peripheral(e.to_string())
    }
}
