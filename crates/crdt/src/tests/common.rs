//! Shared builders for the merge test suites.

use std::collections::BTreeMap;

use matchlog_primitives::{Incident, IncidentId, Outcome, PeerId};
use serde_json::{json, Value};

use crate::{ConsistentMap, Envelope};

pub const SKU: &str = "RE-V5RC-25-0000";

pub type IncidentMap = ConsistentMap<IncidentId, Incident>;

pub fn peer(id: &str) -> PeerId {
    PeerId::new(id)
}

pub fn incident(id: &str) -> Incident {
    Incident {
        id: IncidentId::from(id.to_owned()),
        sku: SKU.to_owned(),
        team: "1234A".to_owned(),
        match_ref: None,
        outcome: Outcome::General,
        rules: vec!["<SG1>".to_owned()],
        notes: "a".to_owned(),
        time: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        assets: vec![],
    }
}

pub fn envelope(id: &str, by: &str) -> Envelope<Incident> {
    Envelope::init(incident(id), &peer(by))
}

/// Resolved-state view used for algebraic equivalence: record value plus
/// per-field count. The recorded writer is deliberately left out — on a
/// deep-equal count tie either side's writer is a valid pick.
pub fn normalize(map: &IncidentMap) -> Value {
    let values: BTreeMap<&str, Value> = map
        .values
        .iter()
        .map(|(id, env)| {
            let counts: BTreeMap<&str, u32> = env
                .consistency
                .iter()
                .map(|(field, meta)| (field.as_str(), meta.count))
                .collect();
            (
                id.as_str(),
                json!({ "record": env.value, "counts": counts }),
            )
        })
        .collect();
    let deleted: Vec<&str> = map.deleted.iter().map(IncidentId::as_str).collect();

    json!({ "values": values, "deleted": deleted })
}
