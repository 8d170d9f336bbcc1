//! Error types for orbitgate-eye

use orbitgate_core::Error as CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EyeError {
    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl From<EyeError> for CoreError {
    fn from(err: EyeError) -> Self {
        match err {
            EyeError::Core(inner) => inner,
            EyeError::Config(msg) => CoreError::Configuration(msg),
            other => CoreError::Detector(other.to_string()),
        }
    }
}
