use std::path::PathBuf;

use soundcard_io::BackendError;
use soundcard_rt::{PresetsError, RingError, TimingError, TransportError};
use thiserror::Error;

/// Invalid settings, rejected before anything is opened or changed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Presets(#[from] PresetsError),
    #[error(transparent)]
    Timing(#[from] TimingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("ring must have 4 or 8 slots, got {0}")]
    RingSlots(usize),
    #[error("invalid ring layout: {0}")]
    Layout(String),
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SoundcardError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("device error: {0}")]
    Device(#[from] BackendError),
    #[error("soundcard is {0}")]
    State(&'static str),
    #[error("thread error: {0}")]
    Thread(String),
    #[error("transport command queue is full")]
    TransportQueueFull,
}

impl From<PresetsError> for SoundcardError {
    fn from(err: PresetsError) -> Self {
        SoundcardError::Configuration(err.into())
    }
}

impl From<TimingError> for SoundcardError {
    fn from(err: TimingError) -> Self {
        SoundcardError::Configuration(err.into())
    }
}

impl From<TransportError> for SoundcardError {
    fn from(err: TransportError) -> Self {
        SoundcardError::Configuration(err.into())
    }
}

impl From<RingError> for SoundcardError {
    fn from(err: RingError) -> Self {
        match err {
            RingError::InvalidLayout(reason) => {
                SoundcardError::Configuration(ConfigError::Layout(reason))
            }
            other => SoundcardError::Device(other.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SoundcardError>;
