//! Threaded node runner.
//!
//! Runs each [`DmxNode`] in its own thread. The thread owns the node and is
//! the only place its state is touched: it selects over the application's
//! command queue and the transport's inbox, one event at a time, with no
//! priority between the two.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::dmx::{DmxError, DmxNode, DmxRequest, DmxResult, Grant, NodeStatus};
use crate::net::Transport;

/// How long [`DmxHandle::state`] waits for the actor to answer.
pub const STATE_TIMEOUT: Duration = Duration::from_secs(1);

/// Commands that can be sent to a node thread.
#[derive(Debug)]
pub enum NodeCommand {
    /// Application request (ENTER, EXIT, SNAPSHOT).
    Request(DmxRequest),
    /// Get current state for observation.
    GetState(Sender<NodeStatus>),
    /// Stop the node thread.
    Stop,
}

/// Handle to a running node thread.
pub struct DmxHandle {
    pub node_id: u32,
    command_tx: Sender<NodeCommand>,
    grant_rx: Receiver<Grant>,
    thread_handle: Option<JoinHandle<()>>,
}

impl DmxHandle {
    fn submit(&self, request: DmxRequest) -> DmxResult<()> {
        self.command_tx
            .send(NodeCommand::Request(request))
            .map_err(|_| DmxError::NodeStopped {
                node_id: self.node_id,
            })
    }

    /// Ask for access. The grant arrives through [`DmxHandle::wait_grant`].
    pub fn enter(&self) -> DmxResult<()> {
        self.submit(DmxRequest::Enter)
    }

    /// Block until access is granted.
    pub fn wait_grant(&self) -> DmxResult<Grant> {
        self.grant_rx.recv().map_err(|_| DmxError::NodeStopped {
            node_id: self.node_id,
        })
    }

    /// Wait for the grant at most `timeout`.
    pub fn wait_grant_timeout(&self, timeout: Duration) -> Option<Grant> {
        self.grant_rx.recv_timeout(timeout).ok()
    }

    /// ENTER and block until granted.
    pub fn acquire(&self) -> DmxResult<Grant> {
        self.enter()?;
        self.wait_grant()
    }

    /// Release access.
    pub fn exit(&self) -> DmxResult<()> {
        self.submit(DmxRequest::Exit)
    }

    /// Start a global snapshot.
    pub fn snapshot(&self) -> DmxResult<()> {
        self.submit(DmxRequest::Snapshot)
    }

    /// Get current node state.
    pub fn state(&self) -> Option<NodeStatus> {
        let (resp_tx, resp_rx) = bounded(1);
        if self.command_tx.send(NodeCommand::GetState(resp_tx)).is_ok() {
            resp_rx.recv_timeout(STATE_TIMEOUT).ok()
        } else {
            None
        }
    }

    /// Stop the node thread and wait for it.
    pub fn stop(&mut self) {
        let _ = self.command_tx.send(NodeCommand::Stop);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    /// True while the node thread is running.
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for DmxHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the actor thread for `node`, fed by `inbound`.
pub fn spawn_node<T>(mut node: DmxNode<T>, inbound: Receiver<String>) -> io::Result<DmxHandle>
where
    T: Transport + 'static,
{
    let node_id = node.node_id();
    let (command_tx, command_rx) = unbounded();
    let (grant_tx, grant_rx) = bounded(1);
    node.set_grant_channel(grant_tx);

    let thread_handle = thread::Builder::new()
        .name(format!("dimex-node-{}", node_id))
        .spawn(move || run(node, command_rx, inbound))?;

    Ok(DmxHandle {
        node_id,
        command_tx,
        grant_rx,
        thread_handle: Some(thread_handle),
    })
}

fn run<T: Transport>(
    mut node: DmxNode<T>,
    command_rx: Receiver<NodeCommand>,
    inbound: Receiver<String>,
) {
    let closed: Receiver<String> = never();
    let mut inbound_open = true;

    info!(
        target: "dimex::runner",
        node = node.node_id(),
        processes = node.process_count(),
        "Node started"
    );

    loop {
        let inbox = if inbound_open { &inbound } else { &closed };
        select! {
            recv(command_rx) -> cmd => match cmd {
                Ok(NodeCommand::Request(request)) => {
                    if let Err(e) = node.handle_request(request) {
                        warn!(
                            target: "dimex::runner",
                            node = node.node_id(),
                            request = request.name(),
                            error = %e,
                            "Request rejected"
                        );
                    }
                }
                Ok(NodeCommand::GetState(resp_tx)) => {
                    let _ = resp_tx.send(node.status());
                }
                Ok(NodeCommand::Stop) | Err(_) => break,
            },
            recv(inbox) -> body => match body {
                Ok(body) => node.handle_inbound(&body),
                Err(_) => {
                    warn!(target: "dimex::runner", node = node.node_id(), "Inbound link closed");
                    inbound_open = false;
                }
            },
        }
    }

    debug!(target: "dimex::runner", node = node.node_id(), status = ?node.status(), "Final state");
    info!(target: "dimex::runner", node = node.node_id(), "Node stopped");
}
