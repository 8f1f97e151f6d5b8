//! Chandy-Lamport global snapshots over the mutual-exclusion message stream.
//!
//! Every process keeps one [`SnapshotRecord`] per snapshot id. The first
//! marker for an id (from a peer, or the initiator's own request) captures
//! the live state and forwards markers; every later marker closes its
//! channel. Ordinary messages arriving on open channels are recorded before
//! the mutual-exclusion engine sees them.

use std::collections::btree_map::Entry;

use tracing::{debug, error, info};

use crate::net::Transport;

use super::error::DmxResult;
use super::message::DmxMessage;
use super::node::DmxNode;
use super::snapshot::{compose_snapshot_id, SnapshotRecord};

impl<T: Transport> DmxNode<T> {
    /// Next snapshot id for this process as initiator.
    ///
    /// Above every id observed so far and never equal to an id another
    /// initiator can produce.
    pub fn next_snapshot_id(&self) -> u64 {
        let n = self.process_count as u64;
        let round = self.highest_snapshot_id / n + 1;
        compose_snapshot_id(round, self.node_id, self.process_count)
    }

    /// SNAPSHOT: start a new global snapshot. Returns its id.
    pub fn start_snapshot(&mut self) -> DmxResult<u64> {
        let snapshot_id = self.next_snapshot_id();
        info!(
            target: "dimex::snapshot",
            node = self.node_id,
            snapshot = snapshot_id,
            clock = self.clock.now(),
            "Starting snapshot"
        );
        // The initiator takes the first-marker path on its own channel.
        self.handle_marker(self.node_id, snapshot_id);
        Ok(snapshot_id)
    }

    /// Marker for `snapshot_id` arrived on the channel from `sender`.
    pub(crate) fn handle_marker(&mut self, sender: u32, snapshot_id: u64) {
        self.highest_snapshot_id = self.highest_snapshot_id.max(snapshot_id);

        match self.snapshots.entry(snapshot_id) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.completed {
                    debug!(
                        target: "dimex::snapshot",
                        node = self.node_id,
                        snapshot = snapshot_id,
                        from = sender,
                        "Marker for completed snapshot ignored"
                    );
                    return;
                }
                if !record.close_channel(sender) {
                    debug!(
                        target: "dimex::snapshot",
                        node = self.node_id,
                        snapshot = snapshot_id,
                        from = sender,
                        "Duplicate marker"
                    );
                    return;
                }
                debug!(
                    target: "dimex::snapshot",
                    node = self.node_id,
                    snapshot = snapshot_id,
                    from = sender,
                    closed = record.closed.count(),
                    "Channel closed"
                );
            }
            Entry::Vacant(slot) => {
                let mut record = SnapshotRecord::capture(
                    snapshot_id,
                    self.node_id,
                    self.process_count,
                    self.state,
                    self.clock.now(),
                    self.request,
                    self.waiting,
                    self.responses,
                );
                record.close_channel(self.node_id);
                record.close_channel(sender);
                slot.insert(record);

                info!(
                    target: "dimex::snapshot",
                    node = self.node_id,
                    snapshot = snapshot_id,
                    from = sender,
                    state = %self.state,
                    clock = self.clock.now(),
                    "State recorded"
                );
                self.broadcast(DmxMessage::Marker {
                    sender: self.node_id,
                    snapshot_id,
                });
            }
        }

        self.try_complete(snapshot_id);
    }

    /// Record an ordinary message in every snapshot still listening on its
    /// channel.
    pub(crate) fn intercept(&mut self, msg: DmxMessage) {
        for record in self.snapshots.values_mut() {
            if record.intercept(msg) {
                debug!(
                    target: "dimex::snapshot",
                    node = self.node_id,
                    snapshot = record.snapshot_id,
                    msg = %msg,
                    "Recorded in-flight message"
                );
            }
        }
    }

    /// Complete and persist a record once every channel is closed.
    fn try_complete(&mut self, snapshot_id: u64) {
        let Some(record) = self.snapshots.get_mut(&snapshot_id) else {
            return;
        };
        if record.completed || !record.all_channels_closed() {
            return;
        }

        record.completed = true;
        info!(
            target: "dimex::snapshot",
            node = self.node_id,
            snapshot = snapshot_id,
            recorded = record.messages.len(),
            "Snapshot complete"
        );
        if let Err(e) = self.sink.persist(record) {
            error!(
                target: "dimex::snapshot",
                node = self.node_id,
                snapshot = snapshot_id,
                error = %e,
                "Failed to persist snapshot"
            );
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn snapshot(&self, snapshot_id: u64) -> Option<&SnapshotRecord> {
        self.snapshots.get(&snapshot_id)
    }

    /// All records, ordered by snapshot id.
    pub fn snapshots(&self) -> impl Iterator<Item = &SnapshotRecord> + '_ {
        self.snapshots.values()
    }

    /// True while any snapshot is still collecting channel state.
    pub fn is_snapshot_active(&self) -> bool {
        self.snapshots.values().any(|r| !r.completed)
    }

    /// Highest snapshot id seen so far (0 if none).
    pub fn highest_snapshot_id(&self) -> u64 {
        self.highest_snapshot_id
    }
}
