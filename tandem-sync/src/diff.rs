//! Record-level diffs, patches and the client-side replica.
//!
//! A [`RecordsDiff`] maps each touched record id to its final operation:
//! the full new record (`Put`) or its removal (`Remove`). There is no
//! field-level merge; a later operation on the same id replaces the earlier
//! one. A [`Patch`] is a diff bounded by the two room clocks it spans.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::protocol::{Mutation, MutationOp};
use crate::record::{Record, RecordContent, RecordId, PRESENCE_TYPE};

/// Final operation on one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordOp {
    Put(Record),
    Remove,
}

/// Set of record changes keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordsDiff {
    changes: BTreeMap<RecordId, RecordOp>,
}

impl RecordsDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, record: Record) {
        self.changes.insert(record.id.clone(), RecordOp::Put(record));
    }

    pub fn remove(&mut self, id: RecordId) {
        self.changes.insert(id, RecordOp::Remove);
    }

    pub fn get(&self, id: &RecordId) -> Option<&RecordOp> {
        self.changes.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordId, &RecordOp)> {
        self.changes.iter()
    }

    /// Fold a later diff into this one; the later operation wins per id.
    pub fn merge(&mut self, later: RecordsDiff) {
        self.changes.extend(later.changes);
    }

    /// Minimal diff turning `before` into `after`.
    pub fn between(
        before: &BTreeMap<RecordId, Record>,
        after: &BTreeMap<RecordId, Record>,
    ) -> Self {
        let mut diff = Self::new();
        for (id, record) in after {
            match before.get(id) {
                Some(old) if old.same_value(&record.type_name, &record.content) => {}
                _ => diff.put(record.clone()),
            }
        }
        for id in before.keys() {
            if !after.contains_key(id) {
                diff.remove(id.clone());
            }
        }
        diff
    }
}

/// Changes between two room clocks, as broadcast to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Clock the receiver was at before this patch.
    pub from_clock: u64,
    /// Clock the receiver is at after this patch.
    pub to_clock: u64,
    pub changes: RecordsDiff,
}

impl Patch {
    pub fn new(from_clock: u64, to_clock: u64, changes: RecordsDiff) -> Self {
        Self {
            from_clock,
            to_clock,
            changes,
        }
    }

    /// Coalesce a patch that directly follows this one.
    pub fn absorb(&mut self, later: Patch) {
        debug_assert_eq!(self.to_clock, later.from_clock);
        self.to_clock = later.to_clock;
        self.changes.merge(later.changes);
    }
}

/// Errors applying server data to a replica.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error("patch starts at clock {got} but replica is at {expected}")]
    ClockGap { expected: u64, got: u64 },
}

/// Record store derived on the client from snapshots and patches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicaStore {
    clock: u64,
    records: BTreeMap<RecordId, Record>,
}

impl ReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, presence included.
    pub fn records(&self) -> &BTreeMap<RecordId, Record> {
        &self.records
    }

    /// Durable document records only.
    pub fn documents(&self) -> impl Iterator<Item = &Record> {
        self.records.values().filter(|r| r.type_name != PRESENCE_TYPE)
    }

    /// Presence records of other sessions.
    pub fn presence(&self) -> impl Iterator<Item = &Record> {
        self.records.values().filter(|r| r.type_name == PRESENCE_TYPE)
    }

    /// Replace all state with a full snapshot.
    pub fn hydrate(&mut self, clock: u64, records: impl IntoIterator<Item = Record>) {
        self.records = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        self.clock = clock;
    }

    /// Apply a patch from the room.
    ///
    /// Returns `Ok(false)` when the patch is already covered by the replica's
    /// clock, which makes replay idempotent.
    pub fn apply_patch(&mut self, patch: &Patch) -> Result<bool, ReplicaError> {
        if patch.to_clock <= self.clock {
            return Ok(false);
        }
        if patch.from_clock > self.clock {
            return Err(ReplicaError::ClockGap {
                expected: self.clock,
                got: patch.from_clock,
            });
        }
        self.apply_changes(&patch.changes);
        self.clock = patch.to_clock;
        Ok(true)
    }

    /// Apply an incremental hydration after a reconnect.
    ///
    /// Presence is resent in full on every handshake, so stale presence is
    /// dropped before the catch-up changes land.
    pub fn catch_up(&mut self, patch: &Patch) -> Result<(), ReplicaError> {
        if patch.from_clock > self.clock {
            return Err(ReplicaError::ClockGap {
                expected: self.clock,
                got: patch.from_clock,
            });
        }
        self.records.retain(|_, r| r.type_name != PRESENCE_TYPE);
        self.apply_changes(&patch.changes);
        self.clock = patch.to_clock;
        Ok(())
    }

    pub(crate) fn apply_changes(&mut self, changes: &RecordsDiff) {
        for (id, op) in changes.iter() {
            match op {
                RecordOp::Put(record) => {
                    self.records.insert(id.clone(), record.clone());
                }
                RecordOp::Remove => {
                    self.records.remove(id);
                }
            }
        }
    }

    /// Apply local mutations optimistically, before the room has stamped them.
    pub fn apply_local(&mut self, mutations: &[Mutation]) {
        for mutation in mutations {
            match &mutation.op {
                MutationOp::Upsert { type_name, content } => {
                    let clock = self
                        .records
                        .get(&mutation.record_id)
                        .map_or(self.clock, |r| r.last_changed_clock);
                    self.records.insert(
                        mutation.record_id.clone(),
                        Record::new(mutation.record_id.clone(), type_name.clone(), content.clone(), clock),
                    );
                }
                MutationOp::Delete => {
                    self.records.remove(&mutation.record_id);
                }
            }
        }
    }

    /// Settle a local push the room committed at `clock`.
    ///
    /// Accepted upserts take the room's stamp; rejected ids are restored to
    /// the room's authoritative value.
    pub fn commit_local(
        &mut self,
        clock: u64,
        accepted: impl IntoIterator<Item = RecordId>,
        restored: impl IntoIterator<Item = (RecordId, Option<Record>)>,
    ) {
        for id in accepted {
            if let Some(record) = self.records.get_mut(&id) {
                record.last_changed_clock = clock;
            }
        }
        for (id, record) in restored {
            match record {
                Some(record) => {
                    self.records.insert(id, record);
                }
                None => {
                    self.records.remove(&id);
                }
            }
        }
        self.clock = self.clock.max(clock);
    }

    /// Content view used to compare replicas regardless of stamps.
    pub fn values(&self) -> BTreeMap<RecordId, (String, RecordContent)> {
        self.records
            .iter()
            .map(|(id, r)| (id.clone(), (r.type_name.clone(), r.content.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(id: &str, x: i64, clock: u64) -> Record {
        Record::new(id, "shape", json!({ "x": x }), clock)
    }

    fn map(records: &[Record]) -> BTreeMap<RecordId, Record> {
        records.iter().map(|r| (r.id.clone(), r.clone())).collect()
    }

    #[test]
    fn test_between_reports_minimal_changes() {
        let before = map(&[rec("a", 1, 1), rec("b", 1, 1), rec("c", 1, 1)]);
        // `a` unchanged apart from its stamp, `b` updated, `c` removed, `d` added.
        let after = map(&[rec("a", 1, 4), rec("b", 2, 4), rec("d", 9, 4)]);

        let diff = RecordsDiff::between(&before, &after);
        assert_eq!(diff.len(), 3);
        assert!(diff.get(&"a".into()).is_none());
        assert_eq!(diff.get(&"b".into()), Some(&RecordOp::Put(rec("b", 2, 4))));
        assert_eq!(diff.get(&"c".into()), Some(&RecordOp::Remove));
        assert_eq!(diff.get(&"d".into()), Some(&RecordOp::Put(rec("d", 9, 4))));
    }

    #[test]
    fn test_merge_later_wins() {
        let mut first = RecordsDiff::new();
        first.put(rec("a", 1, 1));
        first.put(rec("b", 1, 1));

        let mut second = RecordsDiff::new();
        second.remove("a".into());
        second.put(rec("b", 5, 2));

        first.merge(second);
        assert_eq!(first.get(&"a".into()), Some(&RecordOp::Remove));
        assert_eq!(first.get(&"b".into()), Some(&RecordOp::Put(rec("b", 5, 2))));
    }

    #[test]
    fn test_patch_absorb_spans_both_clocks() {
        let mut a = RecordsDiff::new();
        a.put(rec("a", 1, 3));
        let mut b = RecordsDiff::new();
        b.put(rec("a", 2, 4));

        let mut patch = Patch::new(2, 3, a);
        patch.absorb(Patch::new(3, 4, b));
        assert_eq!(patch.from_clock, 2);
        assert_eq!(patch.to_clock, 4);
        assert_eq!(patch.changes.get(&"a".into()), Some(&RecordOp::Put(rec("a", 2, 4))));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut replica = ReplicaStore::new();
        replica.hydrate(4, vec![rec("a", 1, 2)]);

        let mut changes = RecordsDiff::new();
        changes.put(rec("a", 2, 5));
        changes.put(rec("b", 1, 5));
        let patch = Patch::new(4, 5, changes);

        assert_eq!(replica.apply_patch(&patch), Ok(true));
        let after_first = replica.clone();
        assert_eq!(replica.apply_patch(&patch), Ok(false));
        assert_eq!(replica, after_first);
        assert_eq!(replica.clock(), 5);
    }

    #[test]
    fn test_stale_patch_does_not_regress_newer_state() {
        let mut replica = ReplicaStore::new();
        replica.hydrate(7, vec![rec("a", 3, 7)]);

        let mut changes = RecordsDiff::new();
        changes.put(rec("a", 1, 5));
        assert_eq!(replica.apply_patch(&Patch::new(4, 5, changes)), Ok(false));
        assert_eq!(replica.get(&"a".into()), Some(&rec("a", 3, 7)));
    }

    #[test]
    fn test_gap_is_reported() {
        let mut replica = ReplicaStore::new();
        let patch = Patch::new(3, 4, RecordsDiff::new());
        assert_eq!(
            replica.apply_patch(&patch),
            Err(ReplicaError::ClockGap { expected: 0, got: 3 })
        );
    }

    #[test]
    fn test_local_apply_then_commit() {
        let mut replica = ReplicaStore::new();
        replica.hydrate(2, vec![rec("a", 1, 2), rec("b", 1, 1)]);

        let mutations = vec![
            Mutation::upsert("a", "shape", json!({ "x": 10 })),
            Mutation::upsert("c", "shape", json!({ "bad": true })),
            Mutation::delete("b"),
        ];
        replica.apply_local(&mutations);
        assert_eq!(replica.len(), 2);

        replica.commit_local(3, vec!["a".into(), "b".into()], vec![("c".into(), None)]);
        assert_eq!(replica.clock(), 3);
        assert_eq!(replica.get(&"a".into()), Some(&rec("a", 10, 3)));
        assert!(replica.get(&"b".into()).is_none());
        assert!(replica.get(&"c".into()).is_none());
    }

    #[test]
    fn test_documents_excludes_presence() {
        let mut replica = ReplicaStore::new();
        replica.hydrate(
            1,
            vec![
                rec("a", 1, 1),
                Record::new("presence:p1", PRESENCE_TYPE, json!({ "cursor": [0, 0] }), 1),
            ],
        );
        assert_eq!(replica.documents().count(), 1);
        assert_eq!(replica.presence().count(), 1);
    }
}
