//! Distributed mutual exclusion with global snapshots.
//!
//! Each process runs one [`DmxNode`]:
//! - Ricart-Agrawala grants exclusive access: a process broadcasts a
//!   timestamped `reqEntry` and enters once every peer answered `respOK`
//! - Chandy-Lamport markers (`TAKE_SNAPSHOT`) capture a consistent global
//!   state on the same message stream
//!
//! # Invariants
//!
//! 1. **Single Writer per Node**: all node state is mutated by one thread.
//! 2. **Monotonic Clock**: the Lamport clock never decreases and advances on
//!    every local event and every received message.
//! 3. **Mutual Exclusion**: at most one process is `IN_ACCESS` at any instant.
//! 4. **Priority**: requests are served in `(timestamp, id)` order.
//! 5. **Deferred Grants**: a deferred peer receives exactly one `respOK`, on EXIT.
//! 6. **Snapshot Completion**: a record completes iff all N channels are closed.

pub mod clock;
pub mod error;
pub mod message;
pub mod mutex_ops;
pub mod node;
pub mod peers;
pub mod snapshot;
pub mod snapshot_ops;
pub mod store;

#[cfg(test)]
mod tests;

pub use clock::{LamportClock, RequestRecord};
pub use error::{DmxError, DmxResult, MessageError};
pub use message::{DmxMessage, MAX_WIRE_VALUE};
pub use node::{DmxNode, DmxRequest, Grant, NodeStatus, ProcessState};
pub use peers::{PeerSet, MAX_PROCESSES};
pub use snapshot::{compose_snapshot_id, snapshot_initiator, RecordedMessage, SnapshotRecord};
pub use store::{
    snapshot_file_name, FileSnapshotStore, MemorySnapshotStore, NullSnapshotSink, SnapshotSink,
};
