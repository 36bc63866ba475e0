use thiserror::Error;

/// Errors produced across the gsc crates.
#[derive(Debug, Error)]
pub enum GscError {
    #[error("server already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error("failed to spawn server process: {0}")]
    SpawnFailure(String),

    #[error("console input unavailable: {0}")]
    IoFailure(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("reconnect attempts exhausted after {0} tries")]
    MaxReconnectAttemptsExceeded(u32),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type GscResult<T> = Result<T, GscError>;
