//! The per-process coordination engine.
//!
//! [`DmxNode`] owns the live state (process state, clock, request, waiting
//! set, response counter) and the snapshot map. It is driven by exactly one
//! caller at a time: local requests through [`DmxNode::handle_request`] and
//! peer messages through [`DmxNode::handle_inbound`]. The mutual-exclusion
//! handlers live in `mutex_ops.rs`, the snapshot handlers in
//! `snapshot_ops.rs`.

use std::collections::BTreeMap;
use std::fmt;

use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::net::{NetworkEndpoint, Transport};

use super::clock::{LamportClock, RequestRecord};
use super::error::{DmxResult, MessageError};
use super::message::DmxMessage;
use super::peers::{PeerSet, MAX_PROCESSES};
use super::snapshot::SnapshotRecord;
use super::store::{NullSnapshotSink, SnapshotSink};

/// Mutual-exclusion state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    /// Not requesting access.
    NotInterested,
    /// Request broadcast, waiting for grants.
    WantsAccess,
    /// Holding access.
    InAccess,
}

impl ProcessState {
    /// Numeric code (0, 1, 2) used in reports.
    pub fn code(&self) -> u8 {
        match self {
            ProcessState::NotInterested => 0,
            ProcessState::WantsAccess => 1,
            ProcessState::InAccess => 2,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::NotInterested => "NOT_INTERESTED",
            ProcessState::WantsAccess => "WANTS_ACCESS",
            ProcessState::InAccess => "IN_ACCESS",
        };
        f.write_str(name)
    }
}

/// Requests the application submits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmxRequest {
    Enter,
    Exit,
    Snapshot,
}

impl DmxRequest {
    pub fn name(&self) -> &'static str {
        match self {
            DmxRequest::Enter => "ENTER",
            DmxRequest::Exit => "EXIT",
            DmxRequest::Snapshot => "SNAPSHOT",
        }
    }
}

/// Signal handed to the application once access is granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant;

/// Point-in-time view of a node, for observers outside the actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: u32,
    pub state: ProcessState,
    pub clock: u64,
    pub request: RequestRecord,
    pub waiting: PeerSet,
    pub responses: u32,
    pub grants: u64,
    pub active_snapshots: usize,
    pub completed_snapshots: usize,
    pub discarded_messages: u64,
}

/// Coordination engine of one process.
pub struct DmxNode<T: Transport> {
    /// This process's id (index in the address list).
    pub(crate) node_id: u32,
    /// Number of processes, fixed for the lifetime of the cluster.
    pub(crate) process_count: u32,
    /// Outbound link to the peers.
    pub(crate) transport: T,

    // =========================================================================
    // LIVE STATE
    // =========================================================================
    pub(crate) state: ProcessState,
    pub(crate) clock: LamportClock,
    /// Current or most recent request of this process.
    pub(crate) request: RequestRecord,
    /// Peers whose grant is deferred until our EXIT.
    pub(crate) waiting: PeerSet,
    /// Grants received for the outstanding request.
    pub(crate) responses: u32,

    // =========================================================================
    // SNAPSHOTS
    // =========================================================================
    /// Every snapshot this process took part in, keyed by id.
    pub(crate) snapshots: BTreeMap<u64, SnapshotRecord>,
    /// Highest snapshot id seen, local or remote. 0 = none.
    pub(crate) highest_snapshot_id: u64,
    pub(crate) sink: Box<dyn SnapshotSink>,

    /// One-slot handoff to the application.
    pub(crate) grant_tx: Option<Sender<Grant>>,
    pub(crate) grants: u64,
    pub(crate) discarded: u64,
}

impl<T: Transport> DmxNode<T> {
    /// Create a node with no snapshot persistence and no grant channel.
    pub fn new(transport: T) -> DmxResult<Self> {
        Self::with_sink(transport, Box::new(NullSnapshotSink))
    }

    /// Create a node that persists completed snapshots to `sink`.
    ///
    /// Fails if the transport's cluster is empty, larger than
    /// [`MAX_PROCESSES`], or does not contain this process.
    pub fn with_sink(transport: T, sink: Box<dyn SnapshotSink>) -> DmxResult<Self> {
        let node_id = transport.self_id();
        let process_count = transport.process_count();
        if process_count == 0 {
            return Err(ConfigError::NoProcesses.into());
        }
        if process_count > MAX_PROCESSES {
            return Err(ConfigError::TooManyProcesses {
                count: process_count as usize,
                max: MAX_PROCESSES,
            }
            .into());
        }
        if node_id >= process_count {
            return Err(ConfigError::NodeIdOutOfRange {
                node_id,
                process_count,
            }
            .into());
        }

        Ok(DmxNode {
            node_id,
            process_count,
            transport,
            state: ProcessState::NotInterested,
            clock: LamportClock::new(),
            request: RequestRecord::default(),
            waiting: PeerSet::new(process_count),
            responses: 0,
            snapshots: BTreeMap::new(),
            highest_snapshot_id: 0,
            sink,
            grant_tx: None,
            grants: 0,
            discarded: 0,
        })
    }

    /// Deliver grants through `tx` (normally a `bounded(1)` channel).
    pub fn set_grant_channel(&mut self, tx: Sender<Grant>) {
        self.grant_tx = Some(tx);
    }

    // =========================================================================
    // EVENT DISPATCH
    // =========================================================================

    /// Handle a request from the local application.
    ///
    /// Requests that do not fit the current state are rejected with no state
    /// change.
    pub fn handle_request(&mut self, request: DmxRequest) -> DmxResult<()> {
        match request {
            DmxRequest::Enter => self.enter(),
            DmxRequest::Exit => self.exit(),
            DmxRequest::Snapshot => self.start_snapshot().map(|_| ()),
        }
    }

    /// Handle a raw body from the transport.
    ///
    /// Malformed bodies are discarded; the node's state is left untouched.
    pub fn handle_inbound(&mut self, body: &str) {
        match self.decode(body) {
            Ok(msg) => self.dispatch(msg),
            Err(e) => {
                self.discarded += 1;
                warn!(target: "dimex::mx", node = self.node_id, error = %e, "Discarding message");
            }
        }
    }

    /// Parse a body and check that it came from a peer.
    pub fn decode(&self, body: &str) -> Result<DmxMessage, MessageError> {
        let msg = DmxMessage::parse(body)?;
        let sender = msg.sender();
        // Only markers may arrive on the self channel.
        let bad_sender =
            sender >= self.process_count || (sender == self.node_id && !msg.is_marker());
        if bad_sender {
            return Err(MessageError::UnknownSender {
                sender,
                process_count: self.process_count,
            });
        }
        Ok(msg)
    }

    /// Route a parsed message to the snapshot or mutual-exclusion engine.
    pub fn dispatch(&mut self, msg: DmxMessage) {
        match msg {
            DmxMessage::Marker { sender, snapshot_id } => {
                self.handle_marker(sender, snapshot_id);
            }
            DmxMessage::ReqEntry { sender, timestamp } => {
                self.intercept(msg);
                self.handle_req_entry(sender, timestamp);
            }
            DmxMessage::RespOk { sender, timestamp } => {
                self.intercept(msg);
                self.handle_resp_ok(sender, timestamp);
            }
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    /// Send one message to one peer.
    pub(crate) fn send(&self, target: u32, msg: DmxMessage) {
        debug!(target: "dimex::mx", node = self.node_id, to = target, msg = %msg, "Send");
        if !self.transport.send_to(target, msg.encode()) {
            warn!(target: "dimex::mx", node = self.node_id, to = target, msg = %msg, "Link refused message");
        }
    }

    /// Send one message to every peer.
    pub(crate) fn broadcast(&self, msg: DmxMessage) {
        debug!(target: "dimex::mx", node = self.node_id, msg = %msg, "Broadcast");
        self.transport.broadcast(&msg.encode());
    }

    /// Hand a grant to the application.
    pub(crate) fn signal_grant(&mut self) {
        self.grants += 1;
        if let Some(tx) = &self.grant_tx {
            match tx.try_send(Grant) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(target: "dimex::mx", node = self.node_id, "Previous grant not consumed");
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!(target: "dimex::mx", node = self.node_id, "Application dropped the grant channel");
                }
            }
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn process_count(&self) -> u32 {
        self.process_count
    }

    pub fn process_state(&self) -> ProcessState {
        self.state
    }

    pub fn clock(&self) -> u64 {
        self.clock.now()
    }

    pub fn request(&self) -> RequestRecord {
        self.request
    }

    pub fn waiting(&self) -> PeerSet {
        self.waiting
    }

    pub fn responses(&self) -> u32 {
        self.responses
    }

    /// Number of grants issued to the application so far.
    pub fn grants(&self) -> u64 {
        self.grants
    }

    /// Number of inbound bodies discarded as malformed.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node_id,
            state: self.state,
            clock: self.clock.now(),
            request: self.request,
            waiting: self.waiting,
            responses: self.responses,
            grants: self.grants,
            active_snapshots: self.snapshots.values().filter(|r| !r.completed).count(),
            completed_snapshots: self.snapshots.values().filter(|r| r.completed).count(),
            discarded_messages: self.discarded,
        }
    }
}

impl DmxNode<NetworkEndpoint> {
    /// Process one message waiting in the endpoint's inbox.
    ///
    /// Returns true if a message was processed.
    pub fn process_one(&mut self) -> bool {
        match self.transport.try_recv() {
            Some(body) => {
                self.handle_inbound(&body);
                true
            }
            None => false,
        }
    }

    /// Process every message currently in the inbox.
    pub fn process_all(&mut self) -> usize {
        let mut processed = 0;
        while self.process_one() {
            processed += 1;
        }
        processed
    }
}
