//! Offline analyzer of persisted global snapshots.
//!
//! Groups the per-process records of every snapshot id into one
//! [`GlobalSnapshot`] and verifies the mutual-exclusion invariants on the
//! recorded cut:
//! 1. At most one process is IN_ACCESS.
//! 2. If every process is NOT_INTERESTED, nobody is deferring and no message
//!    is in flight.
//! 3. A process deferring a peer wants or holds access.
//! 4. Every grant owed to a WANTS_ACCESS process is accounted for exactly once:
//!    received, in flight, deferred, or its request still in flight.
//! 5. Nobody defers the process holding access.
//! 6. A WANTS_ACCESS process's request follows the last request of every
//!    NOT_INTERESTED process.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::dmx::{
    DmxError, DmxMessage, FileSnapshotStore, ProcessState, SnapshotRecord,
};

/// Errors raised while loading snapshot files.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("cannot read snapshot directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: DmxError,
    },

    /// Two records for the same process and snapshot.
    #[error("snapshot {snapshot_id} has two records for process {process_id}")]
    DuplicateRecord { snapshot_id: u64, process_id: u32 },

    /// Records of one snapshot disagree on the cluster size.
    #[error("snapshot {snapshot_id}: process {process_id} reports {found} processes, expected {expected}")]
    ProcessCountMismatch {
        snapshot_id: u64,
        process_id: u32,
        expected: u32,
        found: u32,
    },
}

/// The records of every process for one snapshot id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSnapshot {
    pub snapshot_id: u64,
    pub process_count: u32,
    /// Records keyed by process id.
    pub records: BTreeMap<u32, SnapshotRecord>,
}

impl GlobalSnapshot {
    pub fn new(snapshot_id: u64, process_count: u32) -> Self {
        GlobalSnapshot {
            snapshot_id,
            process_count,
            records: BTreeMap::new(),
        }
    }

    /// Add one process's record.
    pub fn insert(&mut self, record: SnapshotRecord) -> Result<(), CheckError> {
        if record.process_count != self.process_count {
            return Err(CheckError::ProcessCountMismatch {
                snapshot_id: self.snapshot_id,
                process_id: record.process_id,
                expected: self.process_count,
                found: record.process_count,
            });
        }
        if self.records.contains_key(&record.process_id) {
            return Err(CheckError::DuplicateRecord {
                snapshot_id: self.snapshot_id,
                process_id: record.process_id,
            });
        }
        self.records.insert(record.process_id, record);
        Ok(())
    }

    /// True once every process contributed a record.
    pub fn is_complete(&self) -> bool {
        self.records.len() as u32 == self.process_count
    }

    pub fn record(&self, process_id: u32) -> Option<&SnapshotRecord> {
        self.records.get(&process_id)
    }

    /// Messages in flight towards `process_id` at the cut.
    fn in_flight_to(&self, process_id: u32) -> impl Iterator<Item = &DmxMessage> + '_ {
        self.records
            .get(&process_id)
            .into_iter()
            .flat_map(|r| r.messages.iter().map(|m| &m.message))
    }

    fn count_in_state(&self, state: ProcessState) -> usize {
        self.records.values().filter(|r| r.state == state).count()
    }
}

/// Group records by snapshot id, in id order.
pub fn group_records(
    records: impl IntoIterator<Item = SnapshotRecord>,
) -> Result<Vec<GlobalSnapshot>, CheckError> {
    let mut by_id: BTreeMap<u64, GlobalSnapshot> = BTreeMap::new();
    for record in records {
        by_id
            .entry(record.snapshot_id)
            .or_insert_with(|| GlobalSnapshot::new(record.snapshot_id, record.process_count))
            .insert(record)?;
    }
    Ok(by_id.into_values().collect())
}

/// Load every `process_<id>.jsonl` file in `dir` and group the records.
pub fn load_snapshot_dir(dir: &Path) -> Result<Vec<GlobalSnapshot>, CheckError> {
    let entries = fs::read_dir(dir).map_err(|source| CheckError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_snapshot_file(path))
        .collect();
    paths.sort();

    let mut records = Vec::new();
    for path in paths {
        let loaded = FileSnapshotStore::load(&path).map_err(|source| CheckError::Load {
            path: path.clone(),
            source,
        })?;
        records.extend(loaded);
    }
    group_records(records)
}

fn is_snapshot_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.strip_prefix("process_")
        .and_then(|rest| rest.strip_suffix(".jsonl"))
        .map(|id| id.parse::<u32>().is_ok())
        .unwrap_or(false)
}

/// Result of checking one global snapshot.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub snapshot_id: u64,
    /// False if some process never persisted its record; nothing was checked.
    pub complete: bool,
    /// Whether all checks passed.
    pub passed: bool,
    pub violations: Vec<Violation>,
    pub stats: CheckStats,
}

/// An invariant violation.
#[derive(Debug, Clone)]
pub struct Violation {
    pub kind: ViolationKind,
    pub description: String,
    /// Processes involved.
    pub processes: Vec<u32>,
}

/// Invariants the analyzer verifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// More than one process IN_ACCESS.
    MultipleInAccess,
    /// All processes idle, yet something is deferred or in flight.
    IdleNotQuiet,
    /// NOT_INTERESTED process deferring a peer.
    DeferringWhileIdle,
    /// Grants owed to a requester do not add up to N-1.
    GrantMismatch,
    /// Someone defers the process holding access.
    HolderDeferred,
    /// A waiting request does not follow an idle process's last request.
    RequestOrder,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViolationKind::MultipleInAccess => "multiple-in-access",
            ViolationKind::IdleNotQuiet => "idle-not-quiet",
            ViolationKind::DeferringWhileIdle => "deferring-while-idle",
            ViolationKind::GrantMismatch => "grant-mismatch",
            ViolationKind::HolderDeferred => "holder-deferred",
            ViolationKind::RequestOrder => "request-order",
        };
        f.write_str(name)
    }
}

/// Statistics about one checked snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckStats {
    /// Records present.
    pub processes: usize,
    pub not_interested: usize,
    pub wants_access: usize,
    pub in_access: usize,
    /// Deferred grants across all processes.
    pub deferred: usize,
    /// Messages in flight across all channels.
    pub in_flight: usize,
}

/// Invariant checker for global snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct Checker;

impl Checker {
    pub fn new() -> Self {
        Checker
    }

    /// Check every snapshot, in order.
    pub fn check_all(&self, snapshots: &[GlobalSnapshot]) -> Vec<CheckResult> {
        snapshots.iter().map(|s| self.check(s)).collect()
    }

    /// Verify the invariants on one global snapshot.
    pub fn check(&self, snapshot: &GlobalSnapshot) -> CheckResult {
        let stats = CheckStats {
            processes: snapshot.records.len(),
            not_interested: snapshot.count_in_state(ProcessState::NotInterested),
            wants_access: snapshot.count_in_state(ProcessState::WantsAccess),
            in_access: snapshot.count_in_state(ProcessState::InAccess),
            deferred: snapshot
                .records
                .values()
                .map(|r| r.waiting.count() as usize)
                .sum(),
            in_flight: snapshot.records.values().map(|r| r.messages.len()).sum(),
        };

        if !snapshot.is_complete() {
            return CheckResult {
                snapshot_id: snapshot.snapshot_id,
                complete: false,
                passed: true,
                violations: Vec::new(),
                stats,
            };
        }

        let mut violations = Vec::new();
        check_single_holder(snapshot, &mut violations);
        check_idle_quiet(snapshot, &stats, &mut violations);
        check_deferring_states(snapshot, &mut violations);
        check_grant_accounting(snapshot, &mut violations);
        check_holder_not_deferred(snapshot, &mut violations);
        check_request_order(snapshot, &mut violations);

        CheckResult {
            snapshot_id: snapshot.snapshot_id,
            complete: true,
            passed: violations.is_empty(),
            violations,
            stats,
        }
    }
}

fn check_single_holder(snapshot: &GlobalSnapshot, violations: &mut Vec<Violation>) {
    let holders: Vec<u32> = snapshot
        .records
        .values()
        .filter(|r| r.state == ProcessState::InAccess)
        .map(|r| r.process_id)
        .collect();
    if holders.len() > 1 {
        violations.push(Violation {
            kind: ViolationKind::MultipleInAccess,
            description: format!("processes {:?} are all IN_ACCESS", holders),
            processes: holders,
        });
    }
}

fn check_idle_quiet(snapshot: &GlobalSnapshot, stats: &CheckStats, violations: &mut Vec<Violation>) {
    if stats.not_interested != stats.processes {
        return;
    }
    if stats.deferred > 0 || stats.in_flight > 0 {
        let noisy: Vec<u32> = snapshot
            .records
            .values()
            .filter(|r| !r.waiting.is_empty() || !r.messages.is_empty())
            .map(|r| r.process_id)
            .collect();
        violations.push(Violation {
            kind: ViolationKind::IdleNotQuiet,
            description: format!(
                "all NOT_INTERESTED but {} deferred grants and {} messages in flight",
                stats.deferred, stats.in_flight
            ),
            processes: noisy,
        });
    }
}

fn check_deferring_states(snapshot: &GlobalSnapshot, violations: &mut Vec<Violation>) {
    for r in snapshot.records.values() {
        if !r.waiting.is_empty() && r.state == ProcessState::NotInterested {
            violations.push(Violation {
                kind: ViolationKind::DeferringWhileIdle,
                description: format!(
                    "process {} is NOT_INTERESTED but defers {:?}",
                    r.process_id, r.waiting
                ),
                processes: vec![r.process_id],
            });
        }
    }
}

fn check_grant_accounting(snapshot: &GlobalSnapshot, violations: &mut Vec<Violation>) {
    let expected = snapshot.process_count.saturating_sub(1) as usize;

    for q in snapshot
        .records
        .values()
        .filter(|r| r.state == ProcessState::WantsAccess)
    {
        let q_id = q.process_id;
        let received = q.responses as usize;
        let grants_in_flight = snapshot
            .in_flight_to(q_id)
            .filter(|m| matches!(m, DmxMessage::RespOk { .. }))
            .count();
        let deferred = snapshot
            .records
            .values()
            .filter(|p| p.process_id != q_id && p.waiting.contains(q_id))
            .count();
        let requests_in_flight = snapshot
            .records
            .values()
            .filter(|p| p.process_id != q_id)
            .flat_map(|p| p.messages.iter())
            .filter(|m| matches!(m.message, DmxMessage::ReqEntry { sender, .. } if sender == q_id))
            .count();

        let total = received + grants_in_flight + deferred + requests_in_flight;
        if total != expected {
            violations.push(Violation {
                kind: ViolationKind::GrantMismatch,
                description: format!(
                    "process {} accounts for {} of {} grants (received {}, in flight {}, deferred {}, requests in flight {})",
                    q_id, total, expected, received, grants_in_flight, deferred, requests_in_flight
                ),
                processes: vec![q_id],
            });
        }
    }
}

fn check_holder_not_deferred(snapshot: &GlobalSnapshot, violations: &mut Vec<Violation>) {
    for holder in snapshot
        .records
        .values()
        .filter(|r| r.state == ProcessState::InAccess)
    {
        let deferring: Vec<u32> = snapshot
            .records
            .values()
            .filter(|p| p.waiting.contains(holder.process_id))
            .map(|p| p.process_id)
            .collect();
        if !deferring.is_empty() {
            let mut processes = vec![holder.process_id];
            processes.extend(&deferring);
            violations.push(Violation {
                kind: ViolationKind::HolderDeferred,
                description: format!(
                    "process {} is IN_ACCESS but deferred by {:?}",
                    holder.process_id, deferring
                ),
                processes,
            });
        }
    }
}

fn check_request_order(snapshot: &GlobalSnapshot, violations: &mut Vec<Violation>) {
    let idle: Vec<&SnapshotRecord> = snapshot
        .records
        .values()
        .filter(|r| r.state == ProcessState::NotInterested && r.request.timestamp > 0)
        .collect();

    for q in snapshot
        .records
        .values()
        .filter(|r| r.state == ProcessState::WantsAccess)
    {
        for p in &idle {
            if !p.request.precedes(&q.request) {
                violations.push(Violation {
                    kind: ViolationKind::RequestOrder,
                    description: format!(
                        "process {} waits with request {:?} not after idle process {}'s {:?}",
                        q.process_id, q.request, p.process_id, p.request
                    ),
                    processes: vec![q.process_id, p.process_id],
                });
            }
        }
    }
}
