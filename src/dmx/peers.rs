//! Fixed-size set of process ids.
//!
//! Backs both the WaitingSet (deferred grants) and the per-snapshot
//! channel-closed flags. A single `u64` covers every supported cluster.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum supported number of processes.
pub const MAX_PROCESSES: u32 = 64;

/// A compact bitset over process ids `0..len`.
///
/// Bit N is set if process N is a member.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerSet {
    bits: u64,
    len: u32,
}

impl PeerSet {
    /// Create an empty set sized for `len` processes.
    pub fn new(len: u32) -> Self {
        debug_assert!(len <= MAX_PROCESSES, "len exceeds MAX_PROCESSES");
        PeerSet { bits: 0, len }
    }

    /// Build a set from a flag vector (index = process id).
    pub fn from_flags(flags: &[bool]) -> Self {
        let mut set = PeerSet::new(flags.len() as u32);
        for (id, &flag) in flags.iter().enumerate() {
            if flag {
                set.insert(id as u32);
            }
        }
        set
    }

    /// Number of processes this set is sized for.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.len
    }

    /// Add a process. Returns false if it was already present.
    #[inline]
    pub fn insert(&mut self, id: u32) -> bool {
        debug_assert!(id < self.len, "id exceeds set capacity");
        let was_set = self.contains(id);
        self.bits |= 1u64 << id;
        !was_set
    }

    /// Remove a process. Returns true if it was present.
    #[inline]
    pub fn remove(&mut self, id: u32) -> bool {
        let was_set = self.contains(id);
        self.bits &= !(1u64 << id);
        was_set
    }

    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        id < self.len && (self.bits & (1u64 << id)) != 0
    }

    /// Number of members.
    #[inline]
    pub fn count(&self) -> u32 {
        self.bits.count_ones()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// True when every id in `0..capacity` is a member.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }

    /// Iterate members in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |&id| self.contains(id))
    }

    /// Remove and return all members, leaving the set empty.
    pub fn drain(&mut self) -> Vec<u32> {
        let members: Vec<u32> = self.iter().collect();
        self.bits = 0;
        members
    }

    /// Flag vector view (index = process id).
    pub fn to_flags(&self) -> Vec<bool> {
        (0..self.len).map(|id| self.contains(id)).collect()
    }
}

impl fmt::Debug for PeerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.to_flags()).finish()
    }
}

// Persisted as a plain flag vector so the files stay readable.
impl Serialize for PeerSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_flags().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PeerSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let flags = Vec::<bool>::deserialize(deserializer)?;
        if flags.len() > MAX_PROCESSES as usize {
            return Err(serde::de::Error::custom(format!(
                "peer set of {} entries exceeds maximum {}",
                flags.len(),
                MAX_PROCESSES
            )));
        }
        Ok(PeerSet::from_flags(&flags))
    }
}
