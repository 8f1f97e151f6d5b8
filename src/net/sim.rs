//! Deterministic network simulator.
//!
//! Every directed channel (from, to) is its own FIFO queue. Tests choose which
//! channel delivers next, either explicitly or at random, which lets them
//! exercise every cross-channel interleaving the protocol must tolerate while
//! keeping the per-channel FIFO guarantee.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;

use super::Transport;

/// A body taken off a channel, ready to hand to the receiving node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: u32,
    pub to: u32,
    pub body: String,
}

#[derive(Debug, Default)]
struct Channels {
    queues: BTreeMap<(u32, u32), VecDeque<String>>,
    sent: u64,
}

/// Simulated network with one queue per directed channel.
#[derive(Clone)]
pub struct SimNetwork {
    process_count: u32,
    channels: Arc<Mutex<Channels>>,
}

impl SimNetwork {
    pub fn new(process_count: u32) -> Self {
        SimNetwork {
            process_count,
            channels: Arc::new(Mutex::new(Channels::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Channels> {
        // A panicking test thread must not hide the queues from the others.
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Endpoint for one process. May be called more than once per id.
    pub fn endpoint(&self, node_id: u32) -> SimEndpoint {
        SimEndpoint {
            node_id,
            network: self.clone(),
        }
    }

    pub fn process_count(&self) -> u32 {
        self.process_count
    }

    /// Total bodies sent so far.
    pub fn sent_count(&self) -> u64 {
        self.lock().sent
    }

    /// Bodies queued on one channel.
    pub fn queued(&self, from: u32, to: u32) -> usize {
        self.lock().queues.get(&(from, to)).map(VecDeque::len).unwrap_or(0)
    }

    /// Snapshot of the bodies queued on one channel, oldest first.
    pub fn peek_channel(&self, from: u32, to: u32) -> Vec<String> {
        self.lock()
            .queues
            .get(&(from, to))
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total bodies in flight on all channels.
    pub fn in_flight(&self) -> usize {
        self.lock().queues.values().map(VecDeque::len).sum()
    }

    /// True when nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    /// Take the oldest body on a specific channel.
    pub fn deliver(&self, from: u32, to: u32) -> Option<Delivery> {
        let mut channels = self.lock();
        let body = channels.queues.get_mut(&(from, to))?.pop_front()?;
        Some(Delivery { from, to, body })
    }

    /// Take the oldest body on a channel chosen uniformly among non-empty ones.
    pub fn deliver_random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Delivery> {
        let ready: Vec<(u32, u32)> = {
            let channels = self.lock();
            channels
                .queues
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(&key, _)| key)
                .collect()
        };
        if ready.is_empty() {
            return None;
        }
        let (from, to) = ready[rng.gen_range(0..ready.len())];
        self.deliver(from, to)
    }

    /// Put a raw body on a channel, as if `from` had sent it.
    pub fn inject(&self, from: u32, to: u32, body: &str) {
        self.push(from, to, body.to_string());
    }

    fn push(&self, from: u32, to: u32, body: String) {
        let mut channels = self.lock();
        channels.sent += 1;
        channels.queues.entry((from, to)).or_default().push_back(body);
    }
}

/// Outbound endpoint of one process on a [`SimNetwork`].
#[derive(Clone)]
pub struct SimEndpoint {
    node_id: u32,
    network: SimNetwork,
}

impl Transport for SimEndpoint {
    fn self_id(&self) -> u32 {
        self.node_id
    }

    fn process_count(&self) -> u32 {
        self.network.process_count
    }

    fn send_to(&self, target_id: u32, body: String) -> bool {
        if target_id >= self.network.process_count {
            return false;
        }
        self.network.push(self.node_id, target_id, body);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_channels_are_independent_fifo_queues() {
        let net = SimNetwork::new(3);
        let ep0 = net.endpoint(0);
        let ep1 = net.endpoint(1);

        ep0.send_to(2, "a".to_string());
        ep0.send_to(2, "b".to_string());
        ep1.send_to(2, "c".to_string());

        assert_eq!(net.queued(0, 2), 2);
        assert_eq!(net.in_flight(), 3);

        // Channel 1->2 may overtake channel 0->2
        assert_eq!(net.deliver(1, 2).unwrap().body, "c");
        assert_eq!(net.deliver(0, 2).unwrap().body, "a");
        assert_eq!(net.deliver(0, 2).unwrap().body, "b");
        assert!(net.deliver(0, 2).is_none());
        assert!(net.is_idle());
    }

    #[test]
    fn test_random_delivery_keeps_channel_order() {
        let net = SimNetwork::new(2);
        let ep0 = net.endpoint(0);
        let ep1 = net.endpoint(1);
        for i in 0..20 {
            ep0.send_to(1, format!("x{}", i));
            ep1.send_to(0, format!("y{}", i));
        }

        let mut rng = StdRng::seed_from_u64(7);
        let mut next_x = 0;
        let mut next_y = 0;
        while let Some(d) = net.deliver_random(&mut rng) {
            if d.from == 0 {
                assert_eq!(d.body, format!("x{}", next_x));
                next_x += 1;
            } else {
                assert_eq!(d.body, format!("y{}", next_y));
                next_y += 1;
            }
        }
        assert_eq!((next_x, next_y), (20, 20));
        assert_eq!(net.sent_count(), 40);
    }
}
