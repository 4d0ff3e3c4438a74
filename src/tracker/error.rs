use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker returned error: {0}")]
    TrackerRejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request timed out")]
    Timeout,

    #[error("could not connect to tracker")]
    ConnectionFailed,

    #[error("dns lookup failed: {0}")]
    Dns(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),
}

impl TrackerError {
    /// Whether the failure was a dead-air timeout (drives the tier's
    /// `last_timed_out` flag).
    pub fn is_timeout(&self) -> bool {
        matches!(self, TrackerError::Timeout)
    }
}
