//! Real-time collaborative editing engine.
//!
//! This module implements the operational-transformation core and the
//! plumbing that routes edits between connected clients:
//! - Linear text operations and the transform engine that rebases them
//! - Conflict detection and resolution for overlapping edits
//! - Session registry and per-document presence
//! - Room fan-out over a pub/sub bus so several processes can host one room
//! - The document coordinator that owns the authoritative version counter

pub mod broadcast;
pub mod bus;
pub mod conflict;
pub mod coordinator;
pub mod oplog;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transform;

pub use coordinator::{DocumentCoordinator, DocumentState};
pub use operation::{CursorPosition, Operation, OperationKind};
pub use server::{CollabServer, CollabServerConfig};

/// Unique identifier for a document ("room")
pub type DocumentId = String;

/// Unique identifier for a verified user
pub type UserId = String;

/// Unique identifier for one client connection
pub type ConnectionId = String;

/// Unique identifier for an operation
pub type OperationId = String;

/// Identifier of the server process that produced a bus message
pub type NodeId = String;

/// Result type for collaboration operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced to a single caller of the collaboration engine.
///
/// None of these mutate document state; they terminate the one request that
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Bad credential or no grant on the document
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// A coordinator dependency is temporarily down; resubmit with backoff
    #[error("Temporarily unavailable: {0}")]
    RetryableUnavailable(String),

    /// The operation is out of any sane bound and was rejected locally
    #[error("Malformed operation: {0}")]
    MalformedOperation(String),

    /// The client's base version fell out of the replay window
    #[error(
        "Resync required: base version {base_version} is older than the replay window \
         (current {current_version})"
    )]
    ResyncRequired {
        base_version: u64,
        current_version: u64,
    },

    /// The connection has not joined the document it is addressing
    #[error("Not joined to document: {0}")]
    NotJoined(DocumentId),

    /// The connection already joined a document
    #[error("Already joined to document: {0}")]
    AlreadyJoined(DocumentId),

    /// Unknown connection
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Conflict resolution misconfiguration
    #[error("Unsupported conflict resolution strategy: {0}")]
    UnsupportedStrategy(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<conflict::ConflictError> for SyncError {
    fn from(err: conflict::ConflictError) -> Self {
        match err {
            conflict::ConflictError::UnsupportedStrategy(name) => {
                SyncError::UnsupportedStrategy(name)
            }
        }
    }
}

impl From<oplog::LogError> for SyncError {
    fn from(err: oplog::LogError) -> Self {
        SyncError::RetryableUnavailable(err.to_string())
    }
}

/// Current wall-clock time in milliseconds since the epoch
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
