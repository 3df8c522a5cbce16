use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad or empty input lists. Fatal, nothing has been processed yet.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing credentials or unusable settings. Fatal, raised before any network call.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A batch submit was rejected. Recovered per batch by the orchestrator.
    #[error("submission error: {0}")]
    Submission(String),

    /// A single task fetch failed. Recovered per job by the orchestrator.
    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("excel error: {0}")]
    Excel(#[from] calamine::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}
