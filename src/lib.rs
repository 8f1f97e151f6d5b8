//! dimex: distributed mutual exclusion with global snapshots.
//!
//! - [`dmx`]: the per-process coordination engine (Ricart-Agrawala over
//!   Lamport clocks, Chandy-Lamport snapshots on the same message stream)
//! - [`net`]: point-to-point transports (in-process, simulated, TCP)
//! - [`runner`]: the actor thread serializing requests and peer messages
//! - [`checker`]: offline invariant checks over persisted snapshots

pub mod checker;
pub mod config;
pub mod dmx;
pub mod net;
pub mod runner;
