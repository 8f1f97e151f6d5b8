//! Error types for the coordination engine.

use std::io;

use super::node::ProcessState;
use crate::config::ConfigError;

/// A received body that does not parse into a protocol message.
///
/// Always handled by discarding the body; never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// Not three colon-separated fields.
    #[error("malformed message framing: {body:?}")]
    BadFraming { body: String },

    /// Unrecognized message tag.
    #[error("unknown message kind: {tag:?}")]
    UnknownKind { tag: String },

    /// A numeric field failed to parse.
    #[error("invalid {field}: {value:?}")]
    BadField { field: &'static str, value: String },

    /// Sender id outside the cluster, or a remote message claiming our id.
    #[error("sender {sender} is not a peer in a cluster of {process_count}")]
    UnknownSender { sender: u32, process_count: u32 },
}

/// Errors raised by the coordination engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum DmxError {
    /// Application request that is not valid in the current state
    /// (EXIT without access, ENTER while already requesting).
    #[error("{request} is not allowed while {state:?}")]
    InvalidRequest {
        request: &'static str,
        state: ProcessState,
    },

    /// Inbound message rejected at the transport boundary.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// Transport describes a cluster the engine cannot run.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The actor has shut down.
    #[error("node {node_id} is not running")]
    NodeStopped { node_id: u32 },

    /// Persisting a snapshot failed.
    #[error("snapshot {snapshot_id} persist failed: {source}")]
    Persist {
        snapshot_id: u64,
        #[source]
        source: io::Error,
    },

    /// Encoding a snapshot record failed.
    #[error("snapshot encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for engine operations.
pub type DmxResult<T> = Result<T, DmxError>;
