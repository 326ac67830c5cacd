//! Error types for checkpoint and channel operations

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint and channel operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Checkpoint not found
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// A checkpoint with this id was already saved; checkpoints are write-once
    #[error("Checkpoint {checkpoint_id} already exists for thread {thread_id}")]
    AlreadyExists {
        thread_id: String,
        checkpoint_id: String,
    },

    /// Channel read before its first write
    #[error("Channel is empty: {0}")]
    EmptyChannel(String),

    /// A channel rejected a batch of writes
    #[error("Invalid update for channel {channel}: {reason}")]
    InvalidUpdate { channel: String, reason: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Encryption or decryption failure
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid checkpoint or configuration
    #[error("Invalid checkpoint: {0}")]
    Invalid(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQL backend error
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
