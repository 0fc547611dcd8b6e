//! Error types for the railvox speech engine

use thiserror::Error;

/// Result type alias for engine operations
pub type VoxResult<T> = Result<T, VoxError>;

/// Errors that can occur while fetching, decoding or playing speech
#[derive(Error, Debug)]
pub enum VoxError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Asset not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine is shut down")]
    EngineClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

impl From<cpal::DefaultStreamConfigError> for VoxError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoxError::AudioDevice(err.to_string())
    }
}

impl From<rodio::StreamError> for VoxError {
    fn from(err: rodio::StreamError) -> Self {
        VoxError::AudioStream(err.to_string())
    }
}

impl From<rodio::PlayError> for VoxError {
    fn from(err: rodio::PlayError) -> Self {
        VoxError::Playback(err.to_string())
    }
}

impl From<rodio::decoder::DecoderError> for VoxError {
    fn from(err: rodio::decoder::DecoderError) -> Self {
        VoxError::Decode(err.to_string())
    }
}

impl From<config::ConfigError> for VoxError {
    fn from(err: config::ConfigError) -> Self {
        VoxError::Config(err.to_string())
    }
}
