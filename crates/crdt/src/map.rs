//! Keyed collection of envelopes with a tombstone set and a three-way merge.
//!
//! The merge output carries three things: the resolved state both sides
//! should converge on, the slice the local store still has to apply, and the
//! slice the remote peer still has to be told about. Applying both slices
//! brings a second merge to a fixed point in one round.

use std::collections::BTreeMap;

use matchlog_primitives::Record;
use serde::{Deserialize, Serialize};

use crate::envelope::{merge_lww, Envelope};
use crate::error::CrdtError;
use crate::growset::GrowSet;

/// A replicated keyed collection: live envelopes plus permanent tombstones.
///
/// Invariant: an id in `deleted` never appears in `values` in any resolved
/// state. Tombstones dominate — a tombstoned id is not re-admitted by any
/// newer envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsistentMap<I: Ord, T> {
    pub values: BTreeMap<I, Envelope<T>>,
    pub deleted: GrowSet<I>,
}

impl<I: Ord, T> Default for ConsistentMap<I, T> {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
            deleted: GrowSet::default(),
        }
    }
}

impl<I: Ord + Clone, T> ConsistentMap<I, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &I) -> Option<&Envelope<T>> {
        self.values.get(id)
    }

    pub fn is_deleted(&self, id: &I) -> bool {
        self.deleted.contains(id)
    }

    /// Insert or replace an envelope. Refused for tombstoned ids.
    pub fn upsert(&mut self, id: I, envelope: Envelope<T>) -> bool {
        if self.deleted.contains(&id) {
            return false;
        }
        let _ = self.values.insert(id, envelope);
        true
    }

    /// Tombstone an id and drop its envelope. Idempotent.
    pub fn delete(&mut self, id: I) -> bool {
        let _ = self.values.remove(&id);
        self.deleted.insert(id)
    }
}

/// Ids one side has to apply, split by kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncSlice<I> {
    pub values: Vec<I>,
    pub deleted: Vec<I>,
}

impl<I> Default for SyncSlice<I> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<I> SyncSlice<I> {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.deleted.is_empty()
    }
}

/// Outcome of [`merge_map`].
#[derive(Clone, Debug)]
pub struct MapMerge<I: Ord, T> {
    pub resolved: ConsistentMap<I, T>,
    /// Apply to the local store: upsert `values`, hard-delete `deleted`.
    pub local: SyncSlice<I>,
    /// Push to the remote peer: add/update `values`, remove `deleted`.
    pub remote: SyncSlice<I>,
}

/// Three-way merge of two consistent maps.
///
/// Shared ids merge per field through [`merge_lww`]; ids only one side
/// knows are carried over and queued towards the other side; tombstones
/// union and dominate the live set on both the resolved state and the push
/// slices.
///
/// # Errors
///
/// Propagates [`CrdtError::ImmutableDivergence`] from envelope merges of
/// shared ids.
pub fn merge_map<I, T>(
    local: &ConsistentMap<I, T>,
    remote: &ConsistentMap<I, T>,
) -> Result<MapMerge<I, T>, CrdtError>
where
    I: Ord + Clone,
    T: Record,
{
    let deleted = local.deleted.merge(&remote.deleted);

    let mut resolved = ConsistentMap {
        values: BTreeMap::new(),
        deleted: deleted.resolved,
    };
    let mut to_local = SyncSlice::default();
    let mut to_remote = SyncSlice::default();

    for (id, local_env) in &local.values {
        if resolved.deleted.contains(id) {
            continue;
        }

        match remote.values.get(id) {
            // Shared id: per-field merge decides both the resolved envelope
            // and which side has to hear about it.
            Some(remote_env) => {
                let merged = merge_lww(Some(local_env), Some(remote_env))?;
                if let Some(env) = merged.resolved {
                    let _ = resolved.values.insert(id.clone(), env);
                }
                if !merged.changed.is_empty() {
                    to_local.values.push(id.clone());
                }
                if !merged.rejected.is_empty() {
                    to_remote.values.push(id.clone());
                }
            }
            // Local-only id: the remote side has never seen it.
            None => {
                let _ = resolved.values.insert(id.clone(), local_env.clone());
                to_remote.values.push(id.clone());
            }
        }
    }

    // Remote-only ids: new to the local store.
    for (id, remote_env) in &remote.values {
        if resolved.deleted.contains(id) || local.values.contains_key(id) {
            continue;
        }
        let _ = resolved.values.insert(id.clone(), remote_env.clone());
        to_local.values.push(id.clone());
    }

    to_local.deleted = deleted.local;
    to_remote.deleted = deleted.remote;

    Ok(MapMerge {
        resolved,
        local: to_local,
        remote: to_remote,
    })
}

#[cfg(test)]
mod tests {
    use matchlog_primitives::{Incident, IncidentId, Outcome, PeerId, Record};
    use serde_json::json;

    use super::*;

    fn incident(id: &str) -> Incident {
        Incident {
            id: IncidentId::from(id.to_owned()),
            sku: "RE-V5RC-25-0000".to_owned(),
            team: "1234A".to_owned(),
            match_ref: None,
            outcome: Outcome::General,
            rules: vec![],
            notes: "a".to_owned(),
            time: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            assets: vec![],
        }
    }

    fn envelope(id: &str, peer: &str) -> Envelope<Incident> {
        Envelope::init(incident(id), &PeerId::new(peer))
    }

    type IncidentMap = ConsistentMap<IncidentId, Incident>;

    #[test]
    fn one_sided_ids_flow_to_the_other_side() {
        let mut local = IncidentMap::new();
        assert!(local.upsert(IncidentId::from("i1".to_owned()), envelope("i1", "AAA")));

        let mut remote = IncidentMap::new();
        assert!(remote.upsert(IncidentId::from("i2".to_owned()), envelope("i2", "BBB")));

        let merged = merge_map(&local, &remote).unwrap();

        assert_eq!(merged.resolved.values.len(), 2);
        assert_eq!(merged.remote.values, vec![IncidentId::from("i1".to_owned())]);
        assert_eq!(merged.local.values, vec![IncidentId::from("i2".to_owned())]);
    }

    #[test]
    fn tombstone_dominates_live_envelope() {
        let id = IncidentId::from("i1".to_owned());

        let mut local = IncidentMap::new();
        assert!(local.upsert(id.clone(), envelope("i1", "AAA")));

        let mut remote = IncidentMap::new();
        assert!(remote.delete(id.clone()));

        let merged = merge_map(&local, &remote).unwrap();

        assert!(merged.resolved.values.is_empty());
        assert!(merged.resolved.deleted.contains(&id));
        // The local side applies the tombstone; nothing is pushed back.
        assert_eq!(merged.local.deleted, vec![id]);
        assert!(merged.local.values.is_empty());
        assert!(merged.remote.values.is_empty());
        assert!(merged.remote.deleted.is_empty());
    }

    #[test]
    fn upsert_refuses_tombstoned_id() {
        let id = IncidentId::from("i1".to_owned());
        let mut map = IncidentMap::new();

        assert!(map.delete(id.clone()));
        assert!(!map.upsert(id.clone(), envelope("i1", "AAA")));
        assert!(map.values.is_empty());
    }

    #[test]
    fn shared_id_field_conflict_reports_both_directions() {
        let id = IncidentId::from("i1".to_owned());
        let base = envelope("i1", "MMM");

        let mut local_env = base.clone();
        local_env
            .update("notes", json!("b"), &PeerId::new("AAA"))
            .unwrap();
        local_env
            .update("notes", json!("b2"), &PeerId::new("AAA"))
            .unwrap();

        let mut remote_env = base;
        remote_env
            .update("team", json!("5678B"), &PeerId::new("ZZZ"))
            .unwrap();
        remote_env
            .update("notes", json!("x"), &PeerId::new("ZZZ"))
            .unwrap();
        remote_env
            .update("notes", json!("c"), &PeerId::new("ZZZ"))
            .unwrap();
        remote_env
            .update("notes", json!("c2"), &PeerId::new("ZZZ"))
            .unwrap();

        let mut local = IncidentMap::new();
        assert!(local.upsert(id.clone(), local_env));
        let mut remote = IncidentMap::new();
        assert!(remote.upsert(id.clone(), remote_env));

        let merged = merge_map(&local, &remote).unwrap();
        let resolved = &merged.resolved.values[&id];

        // notes: remote count 3 beats local count 2; team: remote-only edit.
        assert_eq!(resolved.value.notes, "c2");
        assert_eq!(resolved.value.team, "5678B");
        assert_eq!(merged.local.values, vec![id.clone()]);
        // Remote won every contested field, so nothing flows back.
        assert!(merged.remote.values.is_empty());
    }
}
