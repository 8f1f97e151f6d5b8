//! In-process mock network.
//!
//! Uses crossbeam channels to simulate the point-to-point links between
//! processes. Each endpoint has one inbox; since every sender pushes into it
//! in send order, delivery is FIFO per (sender, receiver) pair.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;

use super::Transport;

/// A network endpoint for a single process.
pub struct NetworkEndpoint {
    /// This process's id.
    pub node_id: u32,
    /// Number of processes in the network.
    pub process_count: u32,
    /// Receiver for incoming message bodies.
    pub rx: Receiver<String>,
    /// Senders to every process (keyed by id, including ourselves).
    tx_map: HashMap<u32, Sender<String>>,
}

impl NetworkEndpoint {
    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// Clone of the inbox receiver, for actors that select over it.
    pub fn inbox(&self) -> Receiver<String> {
        self.rx.clone()
    }
}

impl Transport for NetworkEndpoint {
    fn self_id(&self) -> u32 {
        self.node_id
    }

    fn process_count(&self) -> u32 {
        self.process_count
    }

    fn send_to(&self, target_id: u32, body: String) -> bool {
        match self.tx_map.get(&target_id) {
            Some(tx) => tx.send(body).is_ok(),
            None => false,
        }
    }
}

/// Mock network that connects a fixed set of processes via channels.
pub struct MockNetwork {
    /// Number of processes in the network.
    process_count: u32,
    /// Senders for each process's inbox.
    node_senders: HashMap<u32, Sender<String>>,
    /// Receivers for each inbox (taken when the endpoint is created).
    node_receivers: HashMap<u32, Receiver<String>>,
}

impl MockNetwork {
    /// Create a new mock network with the specified number of processes.
    pub fn new(process_count: u32) -> Self {
        let mut node_senders = HashMap::new();
        let mut node_receivers = HashMap::new();

        for node_id in 0..process_count {
            let (tx, rx) = unbounded();
            node_senders.insert(node_id, tx);
            node_receivers.insert(node_id, rx);
        }

        MockNetwork {
            process_count,
            node_senders,
            node_receivers,
        }
    }

    /// Create the endpoint for a process.
    ///
    /// Consumes the inbox receiver, so can only be called once per process.
    pub fn create_endpoint(&mut self, node_id: u32) -> Option<NetworkEndpoint> {
        let rx = self.node_receivers.remove(&node_id)?;

        let tx_map = self.node_senders.clone();

        Some(NetworkEndpoint {
            node_id,
            process_count: self.process_count,
            rx,
            tx_map,
        })
    }

    /// Inject a raw body into a process's inbox, bypassing any sender.
    pub fn inject(&self, node_id: u32, body: &str) -> bool {
        self.node_senders
            .get(&node_id)
            .map(|tx| tx.send(body.to_string()).is_ok())
            .unwrap_or(false)
    }

    pub fn process_count(&self) -> u32 {
        self.process_count
    }
}
