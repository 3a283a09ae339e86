//! Authoritative record store for one room.
//!
//! The store is only ever mutated by its owning [`Room`](crate::room::Room),
//! one push at a time. Every push that changes anything advances the
//! document clock by exactly one and stamps each touched record (or
//! tombstone) with the new value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::diff::RecordsDiff;
use crate::protocol::{Mutation, MutationOp, RejectedMutation};
use crate::record::{Record, RecordId, Schema};

/// Durable part of a room: what the storage collaborator keeps between
/// room lifetimes. Presence and tombstones are not included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub clock: u64,
    pub records: Vec<Record>,
}

/// Result of applying one batch of mutations.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// Clock after the batch (unchanged if nothing changed).
    pub clock: u64,
    /// Effective changes, stamped with `clock`.
    pub diff: RecordsDiff,
    pub rejected: Vec<RejectedMutation>,
}

pub struct RecordStore {
    clock: u64,
    records: BTreeMap<RecordId, Record>,
    /// Deleted id -> clock of deletion.
    tombstones: BTreeMap<RecordId, u64>,
    /// Oldest clock from which incremental catch-up is still complete.
    tombstone_history_starts_at: u64,
    max_tombstones: usize,
    prune_buffer: usize,
}

impl RecordStore {
    pub fn new(max_tombstones: usize, prune_buffer: usize) -> Self {
        Self {
            clock: 0,
            records: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            tombstone_history_starts_at: 0,
            max_tombstones,
            prune_buffer,
        }
    }

    /// Restore from a snapshot. Deletions before the snapshot are unknown,
    /// so catch-up is only possible from the snapshot clock onward.
    pub fn from_snapshot(snapshot: RoomSnapshot, max_tombstones: usize, prune_buffer: usize) -> Self {
        let mut store = Self::new(max_tombstones, prune_buffer);
        store.clock = snapshot.clock;
        store.tombstone_history_starts_at = snapshot.clock;
        store.records = snapshot
            .records
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        store
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn records(&self) -> &BTreeMap<RecordId, Record> {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn tombstone_history_starts_at(&self) -> u64 {
        self.tombstone_history_starts_at
    }

    /// Advance the clock without touching records (presence-only changes).
    pub fn advance(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Validate and apply a batch.
    ///
    /// Invalid mutations are dropped individually. Because every write
    /// replaces a record wholesale, only the last valid mutation per id
    /// determines the outcome.
    pub fn apply(&mut self, schema: &Schema, mutations: Vec<Mutation>) -> ApplyOutcome {
        let mut accepted: BTreeMap<RecordId, MutationOp> = BTreeMap::new();
        let mut rejected = Vec::new();

        for mutation in mutations {
            if let MutationOp::Upsert { type_name, content } = &mutation.op {
                if let Err(reason) = schema.validate_document(&mutation.record_id, type_name, content) {
                    rejected.push(RejectedMutation {
                        record_id: mutation.record_id,
                        reason,
                        current: None,
                    });
                    continue;
                }
            }
            accepted.insert(mutation.record_id, mutation.op);
        }

        let next = self.clock + 1;
        let mut diff = RecordsDiff::new();
        for (id, op) in accepted {
            match op {
                MutationOp::Upsert { type_name, content } => {
                    if let Some(existing) = self.records.get(&id) {
                        if existing.same_value(&type_name, &content) {
                            continue;
                        }
                    }
                    let record = Record::new(id.clone(), type_name, content, next);
                    self.tombstones.remove(&id);
                    self.records.insert(id, record.clone());
                    diff.put(record);
                }
                MutationOp::Delete => {
                    if self.records.remove(&id).is_some() {
                        self.tombstones.insert(id.clone(), next);
                        diff.remove(id);
                    }
                }
            }
        }

        if !diff.is_empty() {
            self.clock = next;
            self.prune_tombstones();
        }

        for rejection in &mut rejected {
            rejection.current = self.records.get(&rejection.record_id).cloned();
        }

        ApplyOutcome {
            clock: self.clock,
            diff,
            rejected,
        }
    }

    /// Whether a client at `since` can be caught up incrementally.
    pub fn can_catch_up(&self, since: u64) -> bool {
        since >= self.tombstone_history_starts_at && since <= self.clock
    }

    /// Every change after `since`: current records stamped later, and
    /// tombstones recorded later.
    pub fn changes_since(&self, since: u64) -> RecordsDiff {
        let mut diff = RecordsDiff::new();
        for record in self.records.values() {
            if record.last_changed_clock > since {
                diff.put(record.clone());
            }
        }
        for (id, clock) in &self.tombstones {
            if *clock > since {
                diff.remove(id.clone());
            }
        }
        diff
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            clock: self.clock,
            records: self.records.values().cloned().collect(),
        }
    }

    /// Drop the oldest tombstones once over the limit, moving the catch-up
    /// horizon to the newest pruned clock.
    fn prune_tombstones(&mut self) {
        if self.tombstones.len() <= self.max_tombstones {
            return;
        }
        let mut clocks: Vec<u64> = self.tombstones.values().copied().collect();
        clocks.sort_unstable();
        let excess = self.tombstones.len() - self.max_tombstones + self.prune_buffer;
        let cutoff = clocks[excess.min(clocks.len()) - 1];

        self.tombstones.retain(|_, clock| *clock > cutoff);
        self.tombstone_history_starts_at = self.tombstone_history_starts_at.max(cutoff);
        log::debug!(
            "Pruned tombstones up to clock {cutoff}, {} remain",
            self.tombstones.len()
        );
    }
}
