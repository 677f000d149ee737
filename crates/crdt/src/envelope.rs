//! Per-field last-writer-wins envelope.
//!
//! The envelope wraps a record with a `consistency` map carrying one
//! [`FieldMeta`] per mutable field. Each local edit bumps the field's count
//! and records the previous value in the field's history; merging picks a
//! winner per field by count, breaking ties by the most recent writer's peer
//! id. Immutable fields (the record id, the event SKU) carry no metadata and
//! must agree byte-for-byte between any two envelopes claiming the same id.

use std::collections::BTreeMap;

use matchlog_primitives::{PeerId, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CrdtError;

/// One historical edit of a field: the value it replaced and the peer that
/// had written that value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldEdit {
    pub prev: Value,
    pub peer: PeerId,
}

/// Versioning metadata for a single field.
///
/// `count` is monotonically non-decreasing on any peer. `history[i].prev` is
/// the field's value before the edit that produced `count == i + 1`; the
/// history may be truncated, but what remains is a contiguous prefix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub count: u32,
    pub peer: PeerId,
    #[serde(default)]
    pub history: Vec<FieldEdit>,
}

impl FieldMeta {
    fn initial(peer: &PeerId) -> Self {
        Self {
            count: 0,
            peer: peer.clone(),
            history: Vec::new(),
        }
    }
}

/// A record wrapped with per-field consistency metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub value: T,
    pub consistency: BTreeMap<String, FieldMeta>,
}

impl<T: Record> Envelope<T> {
    /// Wrap a freshly created record: every mergeable field starts at
    /// `count == 0` with an empty history, attributed to `peer`.
    pub fn init(value: T, peer: &PeerId) -> Self {
        let consistency = T::FIELDS
            .iter()
            .map(|field| ((*field).to_owned(), FieldMeta::initial(peer)))
            .collect();

        Self { value, consistency }
    }

    /// Apply a local edit to `field`.
    ///
    /// A deep-equal value is a no-op and returns `false`. Otherwise the
    /// previous value and its writer are pushed onto the history, the count
    /// is bumped, and the field is attributed to `peer`.
    pub fn update(&mut self, field: &str, value: Value, peer: &PeerId) -> Result<bool, CrdtError> {
        if !T::FIELDS.contains(&field) {
            return Err(CrdtError::NotMergeable(field.to_owned()));
        }

        let current = self.value.field(field).unwrap_or(Value::Null);
        if current == value {
            return Ok(false);
        }

        self.value.set_field(field, value)?;

        let meta = self
            .consistency
            .entry(field.to_owned())
            .or_insert_with(|| FieldMeta::initial(peer));
        meta.history.push(FieldEdit {
            prev: current,
            peer: meta.peer.clone(),
        });
        meta.count = meta.count.saturating_add(1);
        meta.peer = peer.clone();

        Ok(true)
    }

    /// Scalar revision of the whole envelope: the sum of per-field counts.
    /// Monotone under [`Envelope::update`], which is what the server's
    /// staleness check relies on.
    pub fn revision(&self) -> u64 {
        self.consistency.values().map(|meta| u64::from(meta.count)).sum()
    }

    fn meta(&self, field: &str) -> Option<&FieldMeta> {
        self.consistency.get(field)
    }
}

/// Outcome of [`merge_lww`].
///
/// `changed` lists fields where the remote side won (the local store has to
/// apply them); `rejected` lists fields where the local side won against a
/// divergent remote (the remote side has to be told).
#[derive(Clone, Debug)]
pub struct LwwMerge<T> {
    pub resolved: Option<Envelope<T>>,
    pub changed: Vec<String>,
    pub rejected: Vec<String>,
}

impl<T> LwwMerge<T> {
    fn empty(resolved: Option<Envelope<T>>) -> Self {
        Self {
            resolved,
            changed: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

/// True when `remote` carries history entries `local` does not know —
/// i.e. the remote branch diverged rather than merely lagging behind.
fn history_diverges(local: &FieldMeta, remote: &FieldMeta) -> bool {
    if remote.history.len() > local.history.len() {
        return true;
    }

    remote
        .history
        .iter()
        .zip(&local.history)
        .any(|(r, l)| r != l)
}

fn field_count(meta: Option<&FieldMeta>) -> u32 {
    meta.map_or(0, |m| m.count)
}

/// Merge two envelopes field by field.
///
/// Selection per mutable field `k`:
///
/// 1. higher count wins;
/// 2. on a count tie with deep-equal values, nothing is reported; the
///    metadata of the larger writer id is kept so replicas converge on
///    metadata no matter the merge order;
/// 3. on a count tie with differing values, the lexicographically larger
///    peer id of the most recent writer wins; equal writers fall back to
///    comparing the serialized values so the result stays deterministic.
///
/// Null operands: both null resolves to null; a null remote resolves to
/// local with nothing to report; a null local resolves to remote with every
/// field marked changed.
///
/// # Errors
///
/// [`CrdtError::ImmutableDivergence`] when both operands are present but
/// disagree on an immutable field.
pub fn merge_lww<T: Record>(
    local: Option<&Envelope<T>>,
    remote: Option<&Envelope<T>>,
) -> Result<LwwMerge<T>, CrdtError> {
    let (local, remote) = match (local, remote) {
        (None, None) => return Ok(LwwMerge::empty(None)),
        (Some(local), None) => return Ok(LwwMerge::empty(Some(local.clone()))),
        (None, Some(remote)) => {
            return Ok(LwwMerge {
                resolved: Some(remote.clone()),
                changed: T::FIELDS.iter().map(|f| (*f).to_owned()).collect(),
                rejected: Vec::new(),
            })
        }
        (Some(local), Some(remote)) => (local, remote),
    };

    for field in T::IMMUTABLE {
        if local.value.field(field) != remote.value.field(field) {
            return Err(CrdtError::ImmutableDivergence {
                field: (*field).to_owned(),
            });
        }
    }

    let mut resolved = local.clone();
    let mut changed = Vec::new();
    let mut rejected = Vec::new();

    for field in T::FIELDS {
        let local_meta = local.meta(field);
        let remote_meta = remote.meta(field);
        let lc = field_count(local_meta);
        let rc = field_count(remote_meta);

        let remote_wins = if lc > rc {
            if let (Some(lm), Some(rm)) = (local_meta, remote_meta) {
                if history_diverges(lm, rm) {
                    rejected.push((*field).to_owned());
                }
            }
            false
        } else if lc < rc {
            changed.push((*field).to_owned());
            true
        } else {
            let local_value = local.value.field(field).unwrap_or(Value::Null);
            let remote_value = remote.value.field(field).unwrap_or(Value::Null);
            let local_peer = local_meta.map_or_else(|| PeerId::new(""), |m| m.peer.clone());
            let remote_peer = remote_meta.map_or_else(|| PeerId::new(""), |m| m.peer.clone());

            if local_value == remote_value {
                // Nothing observable to resolve. The recorded writer is
                // still canonicalized to the larger id so that replicas
                // agree on future tie-breaks regardless of merge order;
                // neither side is notified.
                remote_peer > local_peer
            } else {
                let wins = match remote_peer.cmp(&local_peer) {
                    core::cmp::Ordering::Greater => true,
                    core::cmp::Ordering::Less => false,
                    // Same writer on both branches: fall back to the value
                    // bytes so both sides pick the same winner.
                    core::cmp::Ordering::Equal => {
                        remote_value.to_string() > local_value.to_string()
                    }
                };

                if wins {
                    changed.push((*field).to_owned());
                } else {
                    rejected.push((*field).to_owned());
                }
                wins
            }
        };

        if remote_wins {
            let value = remote.value.field(field).unwrap_or(Value::Null);
            resolved.value.set_field(field, value)?;
            if let Some(meta) = remote_meta {
                let _ = resolved.consistency.insert((*field).to_owned(), meta.clone());
            }
        }
    }

    Ok(LwwMerge {
        resolved: Some(resolved),
        changed,
        rejected,
    })
}

#[cfg(test)]
mod tests {
    use matchlog_primitives::{Incident, IncidentId, Outcome};
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

    fn peer(id: &str) -> PeerId {
        PeerId::new(id)
    }

    #[test]
    fn init_starts_every_field_at_zero() {
        let env = Envelope::init(incident("i1"), &peer("AAA"));

        for field in Incident::FIELDS {
            let meta = env.consistency.get(*field).unwrap();
            assert_eq!(meta.count, 0);
            assert!(meta.history.is_empty());
        }
        assert!(!env.consistency.contains_key("id"));
        assert_eq!(env.revision(), 0);
    }

    #[test]
    fn update_is_noop_on_equal_value() {
        let mut env = Envelope::init(incident("i1"), &peer("AAA"));

        assert!(!env.update("notes", json!("a"), &peer("BBB")).unwrap());
        assert_eq!(env.consistency["notes"].count, 0);
    }

    #[test]
    fn update_records_previous_writer() {
        let mut env = Envelope::init(incident("i1"), &peer("AAA"));

        assert!(env.update("notes", json!("b"), &peer("BBB")).unwrap());

        let meta = &env.consistency["notes"];
        assert_eq!(meta.count, 1);
        assert_eq!(meta.peer, peer("BBB"));
        assert_eq!(
            meta.history,
            vec![FieldEdit {
                prev: json!("a"),
                peer: peer("AAA"),
            }]
        );
    }

    #[test]
    fn update_rejects_immutable_fields() {
        let mut env = Envelope::init(incident("i1"), &peer("AAA"));
        assert!(env.update("sku", json!("other"), &peer("AAA")).is_err());
    }

    #[test]
    fn edit_leaves_other_fields_untouched() {
        let mut env = Envelope::init(incident("i1"), &peer("AAA"));
        let rules_before = env.consistency["rules"].clone();

        env.update("notes", json!("b"), &peer("BBB")).unwrap();

        assert_eq!(env.consistency["rules"], rules_before);
    }

    #[test]
    fn higher_count_dominates_regardless_of_peer() {
        let base = Envelope::init(incident("i1"), &peer("AAA"));

        let mut p = base.clone();
        p.update("notes", json!("b"), &peer("AAA")).unwrap();
        p.update("notes", json!("b2"), &peer("AAA")).unwrap();

        let mut q = base;
        q.update("notes", json!("c"), &peer("ZZZ")).unwrap();

        let merged = merge_lww(Some(&p), Some(&q)).unwrap();
        let resolved = merged.resolved.unwrap();
        assert_eq!(resolved.value.notes, "b2");
        // q's history is a clean prefix of p's, so nothing is pushed back;
        // q catches up on its own reconcile.
        assert!(merged.rejected.is_empty());
        assert!(merged.changed.is_empty());
    }

    #[test]
    fn divergent_lower_count_branch_is_rejected() {
        let base = Envelope::init(incident("i1"), &peer("MMM"));

        let mut p = base.clone();
        p.update("notes", json!("b"), &peer("AAA")).unwrap();
        p.update("notes", json!("b2"), &peer("AAA")).unwrap();
        p.update("notes", json!("b3"), &peer("AAA")).unwrap();

        let mut q = base;
        q.update("notes", json!("x"), &peer("QQQ")).unwrap();
        q.update("notes", json!("c"), &peer("ZZZ")).unwrap();

        // q's second history entry records an edit p never saw, so p's win
        // has to be pushed back to q.
        let merged = merge_lww(Some(&p), Some(&q)).unwrap();
        assert_eq!(merged.resolved.unwrap().value.notes, "b3");
        assert_eq!(merged.rejected, vec!["notes".to_owned()]);
        assert!(merged.changed.is_empty());
    }

    #[test]
    fn count_tie_breaks_on_larger_peer_id() {
        let base = Envelope::init(incident("i1"), &peer("MMM"));

        let mut p = base.clone();
        p.update("notes", json!("b"), &peer("AAA")).unwrap();

        let mut q = base;
        q.update("notes", json!("c"), &peer("ZZZ")).unwrap();

        let from_p = merge_lww(Some(&p), Some(&q)).unwrap();
        assert_eq!(from_p.resolved.unwrap().value.notes, "c");
        assert_eq!(from_p.changed, vec!["notes".to_owned()]);

        let from_q = merge_lww(Some(&q), Some(&p)).unwrap();
        assert_eq!(from_q.resolved.unwrap().value.notes, "c");
        assert_eq!(from_q.rejected, vec!["notes".to_owned()]);
    }

    #[test]
    fn null_rules() {
        let env = Envelope::init(incident("i1"), &peer("AAA"));

        let both_null = merge_lww::<Incident>(None, None).unwrap();
        assert!(both_null.resolved.is_none());

        let remote_null = merge_lww(Some(&env), None).unwrap();
        assert_eq!(remote_null.resolved.unwrap(), env);
        assert!(remote_null.changed.is_empty());

        let local_null = merge_lww(None, Some(&env)).unwrap();
        assert_eq!(local_null.resolved.unwrap(), env);
        assert_eq!(local_null.changed.len(), Incident::FIELDS.len());
    }

    #[test]
    fn immutable_divergence_is_an_error() {
        let a = Envelope::init(incident("i1"), &peer("AAA"));
        let b = Envelope::init(incident("i2"), &peer("AAA"));

        assert!(matches!(
            merge_lww(Some(&a), Some(&b)),
            Err(CrdtError::ImmutableDivergence { .. })
        ));
    }

    #[test]
    fn disjoint_field_edits_both_survive() {
        let base = Envelope::init(incident("i1"), &peer("MMM"));

        let mut p = base.clone();
        p.update("notes", json!("b"), &peer("AAA")).unwrap();

        let mut q = base;
        q.update("rules", json!(["<SG2>"]), &peer("ZZZ")).unwrap();

        let merged = merge_lww(Some(&p), Some(&q)).unwrap();
        let resolved = merged.resolved.unwrap();
        assert_eq!(resolved.value.notes, "b");
        assert_eq!(resolved.value.rules, vec!["<SG2>".to_owned()]);
        assert_eq!(resolved.consistency["notes"].count, 1);
        assert_eq!(resolved.consistency["rules"].count, 1);
    }
}
