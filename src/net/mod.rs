//! Point-to-point transport between processes.
//!
//! The coordination engine only sees the outbound side through
//! [`Transport`]; inbound bodies are handed to the node by whoever owns the
//! receiving end. Three implementations live here:
//!
//! - [`MockNetwork`]: in-process channels, delivery in send order.
//! - [`SimNetwork`]: per-channel queues with scripted or random delivery,
//!   FIFO per (sender, receiver) but no ordering across channels.
//! - [`TcpLink`]: newline-framed TCP, one outbound connection per peer.

pub mod link;
pub mod network;
pub mod sim;

pub use link::TcpLink;
pub use network::{MockNetwork, NetworkEndpoint};
pub use sim::{Delivery, SimEndpoint, SimNetwork};

/// Outbound side of a reliable, per-destination FIFO link.
///
/// Sends are fire-and-forget: the return value only reports whether the body
/// was handed to the link.
pub trait Transport: Send {
    /// Id of the process owning this endpoint.
    fn self_id(&self) -> u32;

    /// Number of processes in the cluster (fixed for its lifetime).
    fn process_count(&self) -> u32;

    /// Send a body to one process.
    fn send_to(&self, target_id: u32, body: String) -> bool;

    /// Send a body to every other process. Returns how many accepted it.
    fn broadcast(&self, body: &str) -> usize {
        let me = self.self_id();
        (0..self.process_count())
            .filter(|&id| id != me)
            .filter(|&id| self.send_to(id, body.to_string()))
            .count()
    }
}
