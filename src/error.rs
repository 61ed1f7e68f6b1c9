/// Error types for meshdb operations.
///
/// This module provides the error hierarchy covering every failure mode in
/// the store, the replication layer, and the network transport. All errors
/// are well-typed and can be pattern-matched for precise handling.
use thiserror::Error;

/// The main error type for meshdb operations.
///
/// All fallible operations in meshdb return `Result<T, MeshError>`.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Document or index not found in the specified collection.
    #[error("'{key}' not found in collection '{collection}'")]
    NotFound {
        /// The collection that was queried
        collection: String,
        /// The document id or index name that was not found
        key: String,
    },

    /// Creating an index whose (collection, name) is already taken.
    #[error("Index '{name}' already exists on collection '{collection}'")]
    AlreadyExists {
        /// The collection the index belongs to
        collection: String,
        /// The index name
        name: String,
    },

    /// Malformed query, missing id on insert, unknown entry type, and similar
    /// caller mistakes.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of what was wrong with the input
        reason: String,
    },

    /// Replication operation requires the collection to be attached to a network.
    #[error("Collection '{collection}' is not attached to a network")]
    NotAttached {
        /// The collection in question
        collection: String,
    },

    /// Attach called on a collection that is already attached.
    #[error("Collection '{collection}' is already attached to network '{network_id}'")]
    AlreadyAttached {
        /// The collection in question
        collection: String,
        /// The network it is currently attached to
        network_id: String,
    },

    /// `send_to_peer` with no established connection.
    #[error("No connection to peer '{peer_id}'")]
    PeerUnavailable {
        /// The peer that was addressed
        peer_id: String,
    },

    /// Durable storage failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope parse failure, signature verification failure, or use of an
    /// inactive key id.
    #[error("Crypto error: {reason}")]
    Crypto {
        /// Description of the cryptographic failure
        reason: String,
    },

    /// Serialization error when converting data to/from JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MeshError {
    /// Shorthand for an [`MeshError::InvalidArgument`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`MeshError::Crypto`].
    pub fn crypto(reason: impl Into<String>) -> Self {
        Self::Crypto {
            reason: reason.into(),
        }
    }
}

/// Result type alias for meshdb operations.
pub type MeshResult<T> = Result<T, MeshError>;
