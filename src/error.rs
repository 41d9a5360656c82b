//! Error taxonomy for the transfer engine.
//!
//! Every variant maps to one of the process exit codes documented in the
//! CLI surface; the orchestrator is the only place that performs that
//! mapping (see `cli::exit_code_for`).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("failed to parse endpoint {0:?}")]
    ParseError(String),

    #[error("SSH authentication failed for {host}: {reason}")]
    AuthError { host: String, reason: String },

    #[error("failed to connect to {host}:{port}: {source}")]
    ConnectError {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("operation timed out after {0}s")]
    Timeout(u64),

    #[error("chunk {index} failed after {attempts} attempt(s): {cause}")]
    ChunkFailed {
        index: usize,
        attempts: u32,
        cause: String,
    },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityError { expected: String, actual: String },

    #[error("manifest is stale for the current source: {0}")]
    StaleManifest(String),

    #[error("another transfer already holds the lock for task {0}")]
    ConcurrentTransfer(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SSH/SFTP error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransferError>;

impl TransferError {
    /// Process exit code for this error, per the CLI surface's contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            TransferError::ParseError(_) => 3,
            TransferError::AuthError { .. } => 4,
            TransferError::IntegrityError { .. } => 5,
            TransferError::Cancelled => 6,
            TransferError::ConcurrentTransfer(_) => 1,
            _ => 1,
        }
    }
}
