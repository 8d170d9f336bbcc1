use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Ephemeral store unavailable or failed
    #[error("Store error: {0}")]
    Store(String),

    /// Durable store unavailable or failed
    #[error("Durable store error: {0}")]
    Durable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Concurrency error: {0}")]
    Concurrency(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Configuration(err.to_string())
    }
}
