/// Error types for koru-chain operations.
///
/// Every fallible operation on a model returns `Result<T, ChainError>`.
/// Errors are scoped to the single operation that produced them: a model
/// actor keeps running after any of these except `CorruptState`, which stops
/// the model from starting at all.
use std::path::PathBuf;
use thiserror::Error;

use crate::types::{Context, Token};

/// The main error type for koru-chain operations.
#[derive(Error, Debug)]
pub enum ChainError {
    /// Attempt to change an option that is fixed once the model exists
    #[error("Option '{option}' cannot be changed (current: {current}, requested: {requested})")]
    ConfigurationConflict {
        /// Name of the immutable option
        option: &'static str,
        /// Value stored in the model
        current: String,
        /// Value the caller asked for
        requested: String,
    },

    /// Reading or writing a file failed
    #[error("Storage I/O error at '{}': {source}", path.display())]
    StorageIo {
        /// File or directory involved
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Generation reached a context with no stored transitions
    #[error("No transitions stored for context {context}")]
    NoMatchingState {
        /// The context that had no edges
        context: Context,
    },

    /// A tag query is malformed
    #[error("Invalid tag query: {reason}")]
    InvalidQuery {
        /// Why the query was rejected
        reason: String,
    },

    /// A training sequence contains the `Start` or `End` padding token
    #[error("Token {0} is reserved and cannot be trained")]
    ReservedToken(Token),

    /// Creation options are unusable
    #[error("Invalid options: {reason}")]
    InvalidOptions {
        /// Which constraint was violated
        reason: String,
    },

    /// The persisted control state could not be decoded
    #[error("Corrupt model state at '{}': {reason}", path.display())]
    CorruptState {
        /// Path to the control-state file
        path: PathBuf,
        /// What went wrong while decoding it
        reason: String,
    },

    /// Encoding or decoding a value failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A partition id outside the current ring was requested
    #[error("Partition {0} does not exist")]
    UnknownPartition(u32),

    /// The model actor is no longer running
    #[error("Model actor has stopped")]
    ActorStopped,
}

impl ChainError {
    /// Wrap an I/O error together with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ChainError::StorageIo {
            path: path.into(),
            source,
        }
    }
}

impl From<bincode::Error> for ChainError {
    fn from(err: bincode::Error) -> Self {
        ChainError::Serialization(err.to_string())
    }
}

/// Result type alias for koru-chain operations.
pub type ChainResult<T> = Result<T, ChainError>;
