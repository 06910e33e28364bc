use std::io;

pub type AppResult<T> = Result<T, AppError>;

/// Failure kinds surfaced by the node runtime.
///
/// Corruption detected by the wire codec is split in two: `InvalidMessageFormat`
/// covers the fixed header (sync preamble, header checksum, unparsable fields)
/// and `InvalidMessagePayload` covers everything after it (size mismatch,
/// payload checksum, base64 or application decode).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("address is empty")]
    AddressEmpty,

    #[error("address does not match a known format")]
    AddressFormatUnknown,

    #[error("node is already running")]
    NodeAlreadyRunning,

    #[error("could not connect within timeout period")]
    ConnectTimeout,

    #[error("connection attempt aborted: {0}")]
    ConnectAborted(String),

    #[error("connection limit reached")]
    ConnectionLimitReached,

    #[error("failed to set linger timeout: {0}")]
    SetLingerTimeout(String),

    #[error("message could not be instantiated from bytes")]
    InvalidMessageFormat,

    #[error("message payload is missing or corrupt")]
    InvalidMessagePayload,

    #[error("connection is closed")]
    Closed,

    #[error("function/feature not implemented")]
    NotImplemented,

    #[error("accept error: {0}")]
    Accept(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid provided {0} value = {1}")]
    InvalidValue(&'static str, String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("payload encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("tracing setup error: {0}")]
    Tracing(#[from] tracing::dispatcher::SetGlobalDefaultError),
}
