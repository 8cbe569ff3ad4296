use thiserror::Error;

/// Errors raised while fetching a single blocklist source.
///
/// `download_all` demotes these to log entries; only `download` surfaces them.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),
    #[error("download canceled")]
    Canceled,
}

/// Errors raised while compiling block patterns.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid pattern at index {index}: {source}")]
    InvalidPattern {
        index: usize,
        #[source]
        source: regex::Error,
    },
}

/// Configuration errors surfaced by `FilterConfig::from_env` and validation.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Invalid rate limit: {0}")]
    InvalidRateLimit(String),
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),
    #[error("Configuration parse error: {0}")]
    ParseError(String),
}
