//! Error types for the crawler binary

use std::path::PathBuf;

use thiserror::Error;

use crate::lock::LockError;
use crate::source::TransportError;

/// Result type alias for crawler operations
pub type Result<T> = std::result::Result<T, CrawlerError>;

#[derive(Error, Debug)]
pub enum CrawlerError {
    /// Invalid command-line argument or crawler properties
    #[error("Configuration error: {0}")]
    Config(String),

    /// A supplied properties file is missing or unreadable
    #[error("The supplied properties file '{0}' is not a readable file")]
    UnreadableProperties(PathBuf),

    /// Single-instance lock could not be acquired
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Tracker store failure
    #[error(transparent)]
    Tracker(#[from] phenodcc_tracker::TrackerError),

    /// Remote transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Crawler properties parse failure
    #[error("Failed to parse crawler properties: {0}")]
    Properties(#[from] toml::de::Error),

    /// Generic anyhow error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrawlerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
