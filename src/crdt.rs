/// CRDT conflict resolution and operation application.
///
/// Reconciliation works pairwise on distributed documents. Causality is read
/// from the vector clocks; ties between concurrent versions are broken by
/// last-writer-wins on `(_timestamp, _peerId)`, which is deterministic on
/// both replicas given the same pair. Tombstones dominate concurrent edits:
/// a live version only survives a tombstone when its clock is strictly
/// after the tombstone's.
use crate::types::{
    ClockOrdering, CrdtOperation, DistributedDocument, Document, OperationKind, VectorClock,
};
use chrono::Utc;

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Produce the distributed form of a freshly handed-off document.
///
/// The clock has the single entry `{peer_id: 1}`; the replica substitutes
/// its own full clock before an operation is logged or broadcast.
pub fn to_distributed(doc: &Document, peer_id: &str) -> DistributedDocument {
    let mut vector = VectorClock::new();
    vector.increment(peer_id);
    DistributedDocument {
        id: doc.id.clone(),
        entry_type: doc.entry_type.clone(),
        vector,
        timestamp: now_ms(),
        peer_id: peer_id.to_string(),
        deleted: false,
        stage: None,
        payload: doc.payload.clone(),
    }
}

/// Strip the distributed metadata, returning the regular form.
pub fn to_regular(doc: &DistributedDocument) -> Document {
    Document {
        id: doc.id.clone(),
        entry_type: doc.entry_type.clone(),
        payload: doc.payload.clone(),
    }
}

/// Deterministic winner among two concurrent versions: greater `_timestamp`,
/// then lexicographically greater `_peerId`.
fn lww_local_wins(local: &DistributedDocument, remote: &DistributedDocument) -> bool {
    match local.timestamp.cmp(&remote.timestamp) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => local.peer_id > remote.peer_id,
    }
}

/// Merge two concurrent versions.
///
/// The winner's scalar fields are kept for conflicting keys; only the keys
/// the winner lacks are copied from the loser. The resulting clock is the
/// componentwise max of both.
pub fn merge_documents(
    winner: &DistributedDocument,
    loser: &DistributedDocument,
) -> DistributedDocument {
    let mut merged = winner.clone();
    for (key, value) in &loser.payload {
        if !merged.payload.contains_key(key) {
            merged.payload.insert(key.clone(), value.clone());
        }
    }
    merged.vector = winner.vector.merge(&loser.vector);
    merged.timestamp = winner.timestamp.max(loser.timestamp);
    merged
}

/// Resolve a pairwise conflict between the local and a remote version.
pub fn resolve_conflict(
    local: &DistributedDocument,
    remote: &DistributedDocument,
) -> DistributedDocument {
    // Tombstone dominance: a live side wins only when strictly after.
    match (local.deleted, remote.deleted) {
        (false, true) => {
            if local.vector.compare(&remote.vector) == ClockOrdering::After {
                return local.clone();
            }
            let mut winner = remote.clone();
            winner.vector = local.vector.merge(&remote.vector);
            winner.timestamp = local.timestamp.max(remote.timestamp);
            return winner;
        }
        (true, false) => {
            if remote.vector.compare(&local.vector) == ClockOrdering::After {
                return remote.clone();
            }
            let mut winner = local.clone();
            winner.vector = local.vector.merge(&remote.vector);
            winner.timestamp = local.timestamp.max(remote.timestamp);
            return winner;
        }
        (true, true) => {
            // Both tombstoned: converge on the merged clock.
            let mut winner = if lww_local_wins(local, remote) {
                local.clone()
            } else {
                remote.clone()
            };
            winner.vector = local.vector.merge(&remote.vector);
            winner.timestamp = local.timestamp.max(remote.timestamp);
            return winner;
        }
        (false, false) => {}
    }

    match local.vector.compare(&remote.vector) {
        ClockOrdering::After => local.clone(),
        ClockOrdering::Before => remote.clone(),
        ClockOrdering::Equal => {
            debug_assert_eq!(
                local.payload, remote.payload,
                "equal clocks must carry equal payloads"
            );
            local.clone()
        }
        ClockOrdering::Concurrent => {
            if lww_local_wins(local, remote) {
                merge_documents(local, remote)
            } else {
                merge_documents(remote, local)
            }
        }
    }
}

/// Apply a replication operation to the (possibly absent) local version.
///
/// Returns the new local version, or `None` when a Delete finds nothing to
/// tombstone. Idempotent: applying the same operation twice to the same
/// state yields the same state.
pub fn apply_operation(
    local: Option<&DistributedDocument>,
    op: &CrdtOperation,
) -> Option<DistributedDocument> {
    match op.kind {
        OperationKind::Insert | OperationKind::Update => {
            let data = op.data.as_ref()?;
            match local {
                None => {
                    // Materialize from the op, stamped with the op's metadata.
                    let mut doc = data.clone();
                    doc.vector = op.vector.clone();
                    doc.timestamp = op.timestamp;
                    doc.peer_id = op.peer_id.clone();
                    Some(doc)
                }
                Some(existing) => match existing.vector.compare(&op.vector) {
                    ClockOrdering::Equal | ClockOrdering::After => Some(existing.clone()),
                    ClockOrdering::Before => {
                        if existing.deleted {
                            // A strictly newer edit revives the tombstone.
                            let mut doc = data.clone();
                            doc.vector = existing.vector.merge(&op.vector);
                            doc.timestamp = existing.timestamp.max(op.timestamp);
                            doc.peer_id = op.peer_id.clone();
                            doc.deleted = false;
                            return Some(doc);
                        }
                        // Union the payloads, op wins on conflicting keys.
                        let mut doc = existing.clone();
                        for (key, value) in &data.payload {
                            doc.payload.insert(key.clone(), value.clone());
                        }
                        doc.vector = existing.vector.merge(&op.vector);
                        doc.timestamp = existing.timestamp.max(op.timestamp);
                        doc.peer_id = op.peer_id.clone();
                        Some(doc)
                    }
                    ClockOrdering::Concurrent => {
                        let mut incoming = data.clone();
                        incoming.vector = op.vector.clone();
                        incoming.timestamp = op.timestamp;
                        incoming.peer_id = op.peer_id.clone();
                        Some(resolve_conflict(existing, &incoming))
                    }
                },
            }
        }
        OperationKind::Delete => {
            let existing = local?;
            if existing.vector.compare(&op.vector) == ClockOrdering::After {
                // The op is strictly before the local version; no effect.
                return Some(existing.clone());
            }
            let mut doc = existing.clone();
            doc.deleted = true;
            doc.vector = existing.vector.merge(&op.vector);
            doc.timestamp = existing.timestamp.max(op.timestamp);
            Some(doc)
        }
    }
}
