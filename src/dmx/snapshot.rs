//! Snapshot records.
//!
//! A [`SnapshotRecord`] is a point-in-time copy of one process's live state
//! plus the messages that were in flight on its incoming channels. Records
//! are owned by the node's snapshot map and never shared.

use serde::{Deserialize, Serialize};

use super::clock::RequestRecord;
use super::message::DmxMessage;
use super::node::ProcessState;
use super::peers::PeerSet;

/// Compose a snapshot id from a round and the initiator.
///
/// The initiator residue keeps ids from different initiators disjoint; the
/// round keeps a new id above every id the initiator has seen.
#[inline]
pub fn compose_snapshot_id(round: u64, initiator: u32, process_count: u32) -> u64 {
    round * process_count as u64 + initiator as u64
}

/// Initiator encoded in a snapshot id.
#[inline]
pub fn snapshot_initiator(snapshot_id: u64, process_count: u32) -> u32 {
    (snapshot_id % process_count as u64) as u32
}

/// An ordinary message caught in flight on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedMessage {
    /// Channel the message arrived on (the sender).
    pub from: u32,
    /// The message itself.
    pub message: DmxMessage,
}

/// One process's share of a global snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: u64,
    /// Process that recorded this state.
    pub process_id: u32,
    pub process_count: u32,

    // Live state at capture time.
    pub state: ProcessState,
    pub clock: u64,
    pub request: RequestRecord,
    pub waiting: PeerSet,
    pub responses: u32,

    /// Channels whose marker has arrived. The self channel is closed at capture.
    pub closed: PeerSet,
    /// Messages recorded on open channels, in arrival order.
    pub messages: Vec<RecordedMessage>,
    /// Set once every channel is closed.
    pub completed: bool,
}

impl SnapshotRecord {
    /// Create a record for a capture. All channels start open.
    #[allow(clippy::too_many_arguments)]
    pub fn capture(
        snapshot_id: u64,
        process_id: u32,
        process_count: u32,
        state: ProcessState,
        clock: u64,
        request: RequestRecord,
        waiting: PeerSet,
        responses: u32,
    ) -> Self {
        SnapshotRecord {
            snapshot_id,
            process_id,
            process_count,
            state,
            clock,
            request,
            waiting,
            responses,
            closed: PeerSet::new(process_count),
            messages: Vec::new(),
            completed: false,
        }
    }

    /// Close the channel from `from`. Returns false if it was already closed.
    pub fn close_channel(&mut self, from: u32) -> bool {
        self.closed.insert(from)
    }

    pub fn is_channel_open(&self, from: u32) -> bool {
        !self.closed.contains(from)
    }

    /// Record a message if its channel is still open. Returns true if recorded.
    pub fn intercept(&mut self, message: DmxMessage) -> bool {
        let from = message.sender();
        if self.completed || !self.is_channel_open(from) {
            return false;
        }
        self.messages.push(RecordedMessage { from, message });
        true
    }

    /// True once every channel has delivered its marker.
    pub fn all_channels_closed(&self) -> bool {
        self.closed.is_full()
    }

    /// Messages recorded on one channel, in arrival order.
    pub fn channel_messages(&self, from: u32) -> impl Iterator<Item = &DmxMessage> + '_ {
        self.messages
            .iter()
            .filter(move |m| m.from == from)
            .map(|m| &m.message)
    }

    /// Process that started this snapshot.
    pub fn initiator(&self) -> u32 {
        snapshot_initiator(self.snapshot_id, self.process_count)
    }
}
