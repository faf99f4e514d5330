//! Error types for the ledger node

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// A staged block or receipt file could not be read or parsed. The file is
    /// left in place; the caller decides whether to skip or abort its pass.
    #[error("Staging corruption in {}: {reason}", path.display())]
    StagingCorruption { path: PathBuf, reason: String },

    /// A single peer send failed. Only ever logged by the propagation layer.
    #[error("Peer unreachable at {url}: {reason}")]
    PeerUnreachable { url: String, reason: String },

    /// The state-transition function rejected a retained transaction while
    /// replaying. The whole revert is rolled back.
    #[error("Replay failed at transaction {transaction_code} (block {block_index}): {reason}")]
    ReplayFailure {
        transaction_code: String,
        block_index: u64,
        reason: String,
    },

    #[error("Ledger is busy with another finalization or revert")]
    LedgerConcurrency,

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    pub(crate) fn corruption(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        LedgerError::StagingCorruption {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, LedgerError>;
