//! Process configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::dmx::MAX_PROCESSES;

/// Default directory for persisted snapshots.
pub const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";

/// Configuration errors, raised before any thread starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one process address is required")]
    NoProcesses,

    #[error("process id {node_id} out of range for {process_count} addresses")]
    NodeIdOutOfRange { node_id: u32, process_count: u32 },

    #[error("{count} processes configured, at most {max} supported")]
    TooManyProcesses { count: usize, max: u32 },

    #[error("address {address} is listed for both process {first} and process {second}")]
    DuplicateAddress {
        address: String,
        first: u32,
        second: u32,
    },
}

/// Configuration of one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// This process's id: its index in `addresses`.
    pub node_id: u32,
    /// Addresses of every process, in id order.
    pub addresses: Vec<String>,
    /// Where completed snapshots are persisted.
    pub snapshot_dir: PathBuf,
}

impl NodeConfig {
    /// Build and validate a configuration.
    pub fn new(
        node_id: u32,
        addresses: Vec<String>,
        snapshot_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let config = NodeConfig {
            node_id,
            addresses,
            snapshot_dir: snapshot_dir.into(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addresses.is_empty() {
            return Err(ConfigError::NoProcesses);
        }
        if self.addresses.len() > MAX_PROCESSES as usize {
            return Err(ConfigError::TooManyProcesses {
                count: self.addresses.len(),
                max: MAX_PROCESSES,
            });
        }
        if self.node_id >= self.process_count() {
            return Err(ConfigError::NodeIdOutOfRange {
                node_id: self.node_id,
                process_count: self.process_count(),
            });
        }

        let mut seen: HashMap<&str, u32> = HashMap::new();
        for (id, addr) in self.addresses.iter().enumerate() {
            if let Some(&first) = seen.get(addr.as_str()) {
                return Err(ConfigError::DuplicateAddress {
                    address: addr.clone(),
                    first,
                    second: id as u32,
                });
            }
            seen.insert(addr, id as u32);
        }
        Ok(())
    }

    pub fn process_count(&self) -> u32 {
        self.addresses.len() as u32
    }

    /// This process's own listen address.
    pub fn own_address(&self) -> &str {
        &self.addresses[self.node_id as usize]
    }
}
