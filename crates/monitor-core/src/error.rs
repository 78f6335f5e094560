use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Record source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Invalid granularity: {0}")]
    InvalidGranularity(String),

    #[error("Aggregation error: {0}")]
    Aggregation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
