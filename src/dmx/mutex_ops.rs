//! Ricart-Agrawala mutual exclusion.
//!
//! ```text
//! NOT_INTERESTED --ENTER--> WANTS_ACCESS --(N-1 grants)--> IN_ACCESS --EXIT--> NOT_INTERESTED
//! ```
//!
//! A request `(ts, id)` is granted immediately unless this process holds
//! access, or wants it with a request that precedes `(ts, id)`. Deferred
//! grants are sent on EXIT, exactly once per deferred peer.

use tracing::{debug, info, warn};

use crate::net::Transport;

use super::clock::RequestRecord;
use super::error::{DmxError, DmxResult};
use super::message::DmxMessage;
use super::node::{DmxNode, ProcessState};

impl<T: Transport> DmxNode<T> {
    /// ENTER: timestamp a new request and ask every peer for permission.
    pub fn enter(&mut self) -> DmxResult<()> {
        if self.state != ProcessState::NotInterested {
            return Err(DmxError::InvalidRequest {
                request: "ENTER",
                state: self.state,
            });
        }

        let ts = self.clock.tick();
        self.request = RequestRecord::new(self.node_id, ts);
        self.responses = 0;
        self.state = ProcessState::WantsAccess;

        info!(target: "dimex::mx", node = self.node_id, ts, "Requesting access");
        self.broadcast(DmxMessage::ReqEntry {
            sender: self.node_id,
            timestamp: ts,
        });

        // Alone in the cluster: nobody to ask.
        self.maybe_enter_access();
        Ok(())
    }

    /// EXIT: release access and send every deferred grant.
    pub fn exit(&mut self) -> DmxResult<()> {
        if self.state != ProcessState::InAccess {
            return Err(DmxError::InvalidRequest {
                request: "EXIT",
                state: self.state,
            });
        }

        self.state = ProcessState::NotInterested;
        self.responses = 0;

        let deferred = self.waiting.drain();
        info!(target: "dimex::mx", node = self.node_id, deferred = ?deferred, "Releasing access");
        for peer in deferred {
            self.send(
                peer,
                DmxMessage::RespOk {
                    sender: self.node_id,
                    timestamp: self.clock.now(),
                },
            );
        }
        Ok(())
    }

    /// Peer `sender` asks for access with request timestamp `ts`.
    pub(crate) fn handle_req_entry(&mut self, sender: u32, ts: u64) {
        self.clock.observe(ts);

        let theirs = RequestRecord::new(sender, ts);
        let defer = match self.state {
            ProcessState::InAccess => true,
            ProcessState::NotInterested => false,
            ProcessState::WantsAccess => self.request.precedes(&theirs),
        };

        if defer {
            self.waiting.insert(sender);
            debug!(
                target: "dimex::mx",
                node = self.node_id,
                from = sender,
                ts,
                state = %self.state,
                "Deferring grant"
            );
        } else {
            self.send(
                sender,
                DmxMessage::RespOk {
                    sender: self.node_id,
                    timestamp: self.clock.now(),
                },
            );
        }
    }

    /// Peer `sender` grants our outstanding request.
    pub(crate) fn handle_resp_ok(&mut self, sender: u32, ts: u64) {
        self.clock.observe(ts);

        if self.state != ProcessState::WantsAccess {
            warn!(
                target: "dimex::mx",
                node = self.node_id,
                from = sender,
                state = %self.state,
                "Ignoring grant with no outstanding request"
            );
            return;
        }

        self.responses += 1;
        debug!(
            target: "dimex::mx",
            node = self.node_id,
            from = sender,
            responses = self.responses,
            "Grant received"
        );
        self.maybe_enter_access();
    }

    /// Move to IN_ACCESS once every peer has granted.
    fn maybe_enter_access(&mut self) {
        if self.state == ProcessState::WantsAccess && self.responses + 1 >= self.process_count {
            self.state = ProcessState::InAccess;
            info!(
                target: "dimex::mx",
                node = self.node_id,
                ts = self.request.timestamp,
                clock = self.clock.now(),
                "Access granted"
            );
            self.signal_grant();
        }
    }
}
