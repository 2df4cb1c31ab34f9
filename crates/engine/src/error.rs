//! Engine error types.

use std::path::PathBuf;
use std::sync::Arc;

use nimbus_protocol::NodeId;
use nimbus_transfer::{TaskPanic, TransferError};

/// Errors produced by the upload and download pipelines.
///
/// Cloneable so that every waiter on a transfer observes the same terminal
/// error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("cannot classify transfer state of {node}: {reason}")]
    ClassificationFailed { node: NodeId, reason: String },

    #[error("local content of {node} is gone: {path}")]
    ContentLost { node: NodeId, path: PathBuf },

    #[error("block metadata missing for {node}: {reason}")]
    BlockMetadataMissing { node: NodeId, reason: String },

    #[error("cannot seal revision of {node}: {uploaded} of {total} blocks uploaded")]
    RevisionSealFailedInvalidState {
        node: NodeId,
        uploaded: usize,
        total: usize,
    },

    #[error("{} subtree scan(s) failed: {}", .0.len(), join_errors(.0))]
    CompoundScanFailure(Vec<SyncError>),

    #[error("operation not supported for this content class: {0}")]
    InvalidStateForClass(String),

    #[error("invalid transfer state: {0}")]
    InvalidState(String),

    #[error("cancelled")]
    Cancelled,

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("remote API error: {0}")]
    Api(String),

    #[error("metadata store error: {0}")]
    Store(String),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("config error: {0}")]
    Config(String),

    #[error("transfer error: {0}")]
    Transfer(Arc<TransferError>),

    #[error(transparent)]
    TaskPanicked(#[from] TaskPanic),
}

fn join_errors(errors: &[SyncError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<TransferError> for SyncError {
    fn from(e: TransferError) -> Self {
        Self::Transfer(Arc::new(e))
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Io(Arc::new(std::io::Error::other(e.to_string())))
        }
    }
}
