//! Local-first persistence and the mutation API.
//!
//! Every mutation lands in the device store and acknowledges synchronously;
//! pushing it to the server is someone else's job (the share connection or
//! the outbound queue). Reconciliation on join repairs whatever diverged
//! while offline.

use std::collections::BTreeMap;

use matchlog_crdt::{merge_lww, merge_map, ConsistentMap, Envelope};
use matchlog_identity::Keypair;
use matchlog_primitives::{
    Incident, IncidentId, Invitation, Record, Scratchpad, ScratchpadId,
};
use matchlog_server_primitives::{ClientFrame, ShareInfo};
use matchlog_store::Store;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ClientError;
use crate::events::{ClientEvent, Notifier};

/// Per-event admission state as the device knows it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MembershipState {
    pub invitation: Option<Invitation>,
    pub accepted: bool,
    pub admin: bool,
    pub instance_secret: Option<String>,
}

/// An operation produced while offline, waiting for a connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueuedOp {
    AddIncident { incident: Envelope<Incident> },
    EditIncident { incident: Envelope<Incident> },
    RemoveIncident { id: IncidentId },
    ScratchpadUpdate {
        id: ScratchpadId,
        scratchpad: Envelope<Scratchpad>,
    },
}

type IncidentMap = ConsistentMap<IncidentId, Incident>;
type ScratchpadMap = BTreeMap<ScratchpadId, Envelope<Scratchpad>>;

/// The device-local replica across every event this device has touched.
#[derive(Clone)]
pub struct Replica {
    store: Store,
    keypair: Keypair,
    notifier: Notifier,
}

fn map_key(sku: &str) -> String {
    format!("incidents:{sku}")
}

fn scratchpad_key(sku: &str) -> String {
    format!("scratchpads:{sku}")
}

fn membership_key(sku: &str) -> String {
    format!("membership:{sku}")
}

fn queue_key(sku: &str) -> String {
    format!("queue:{sku}")
}

impl Replica {
    pub fn new(store: Store, keypair: Keypair, notifier: Notifier) -> Self {
        Self {
            store,
            keypair,
            notifier,
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    // ---- reads -----------------------------------------------------------

    pub fn incidents(&self, sku: &str) -> Result<IncidentMap, ClientError> {
        Ok(self.store.get(&map_key(sku))?.unwrap_or_default())
    }

    pub fn scratchpads(&self, sku: &str) -> Result<ScratchpadMap, ClientError> {
        Ok(self.store.get(&scratchpad_key(sku))?.unwrap_or_default())
    }

    pub fn membership(&self, sku: &str) -> Result<MembershipState, ClientError> {
        Ok(self.store.get(&membership_key(sku))?.unwrap_or_default())
    }

    pub fn set_membership(&self, sku: &str, state: &MembershipState) -> Result<(), ClientError> {
        self.store.set(&membership_key(sku), state)?;
        Ok(())
    }

    // ---- mutations (local-first, synchronous) ----------------------------

    /// Record a new incident. Returns the envelope to push.
    pub fn add(&self, incident: Incident) -> Result<Envelope<Incident>, ClientError> {
        let sku = incident.sku.clone();
        let id = incident.id.clone();
        let mut map = self.incidents(&sku)?;

        if map.is_deleted(&id) {
            return Err(ClientError::Tombstoned);
        }

        let envelope = Envelope::init(incident, &self.keypair.peer_id());
        let _ = map.upsert(id, envelope.clone());
        self.store.set(&map_key(&sku), &map)?;

        Ok(envelope)
    }

    /// Apply a field patch to an incident. Unchanged values are no-ops and
    /// do not bump counts. Returns the envelope to push.
    pub fn edit(
        &self,
        sku: &str,
        id: &IncidentId,
        changes: &[(&str, Value)],
    ) -> Result<Envelope<Incident>, ClientError> {
        let mut map = self.incidents(sku)?;

        if map.is_deleted(id) {
            return Err(ClientError::Tombstoned);
        }
        let Some(envelope) = map.values.get_mut(id) else {
            return Err(ClientError::Malformed(format!("unknown incident {id}")));
        };

        let peer = self.keypair.peer_id();
        for (field, value) in changes {
            let _ = envelope.update(field, value.clone(), &peer)?;
        }

        let envelope = envelope.clone();
        self.store.set(&map_key(sku), &map)?;

        Ok(envelope)
    }

    /// Tombstone an incident locally. Returns whether it was newly deleted.
    pub fn delete(&self, sku: &str, id: &IncidentId) -> Result<bool, ClientError> {
        let mut map = self.incidents(sku)?;
        let newly = map.delete(id.clone());
        self.store.set(&map_key(sku), &map)?;
        Ok(newly)
    }

    /// Write scratchpad fields, bumping only what actually changed. Returns
    /// the envelope to push.
    pub fn update_scratchpad(
        &self,
        scratchpad: Scratchpad,
    ) -> Result<Envelope<Scratchpad>, ClientError> {
        let sku = scratchpad.sku.clone();
        let id = scratchpad.id.clone();
        let mut pads = self.scratchpads(&sku)?;
        let peer = self.keypair.peer_id();

        let envelope = match pads.entry(id) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(Envelope::init(scratchpad, &peer)).clone()
            }
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                let current = entry.get_mut();
                for field in Scratchpad::FIELDS {
                    if let Some(value) = scratchpad.field(field) {
                        let _ = current.update(field, value, &peer)?;
                    }
                }
                current.clone()
            }
        };

        self.store.set(&scratchpad_key(&sku), &pads)?;
        Ok(envelope)
    }

    // ---- outbound queue --------------------------------------------------

    pub fn enqueue(&self, sku: &str, op: QueuedOp) -> Result<(), ClientError> {
        let _ = self.store.update(&queue_key(sku), |queue: Option<Vec<QueuedOp>>| {
            let mut queue = queue.unwrap_or_default();
            queue.push(op.clone());
            queue
        })?;
        Ok(())
    }

    pub fn queued(&self, sku: &str) -> Result<Vec<QueuedOp>, ClientError> {
        Ok(self.store.get(&queue_key(sku))?.unwrap_or_default())
    }

    /// Take the whole queue, leaving it empty. Ops that fail to send get
    /// re-enqueued by the caller.
    pub fn drain_queue(&self, sku: &str) -> Result<Vec<QueuedOp>, ClientError> {
        let queue = self.queued(sku)?;
        self.store.del(&queue_key(sku))?;
        Ok(queue)
    }

    // ---- remote applications ---------------------------------------------

    /// Merge an incident envelope that arrived over the socket.
    pub fn apply_remote_incident(
        &self,
        sku: &str,
        incoming: Envelope<Incident>,
    ) -> Result<(), ClientError> {
        let mut map = self.incidents(sku)?;
        let id = incoming.value.id.clone();

        if map.is_deleted(&id) {
            debug!(%sku, %id, "ignoring envelope for tombstoned incident");
            return Ok(());
        }

        let merged = merge_lww(map.values.get(&id), Some(&incoming))?;
        if let Some(resolved) = merged.resolved {
            let _ = map.upsert(id, resolved);
        }
        self.store.set(&map_key(sku), &map)?;
        Ok(())
    }

    /// Apply a remote deletion; surfaces a toast-worthy event when it
    /// expunged something we still had.
    pub fn apply_remote_delete(&self, sku: &str, id: IncidentId) -> Result<(), ClientError> {
        let had_value = self.incidents(sku)?.values.contains_key(&id);
        if self.delete(sku, &id)? && had_value {
            self.notifier.notify(ClientEvent::IncidentDeleted {
                sku: sku.to_owned(),
                id,
            });
        }
        Ok(())
    }

    /// Merge a scratchpad envelope that arrived over the socket.
    pub fn apply_remote_scratchpad(
        &self,
        sku: &str,
        id: ScratchpadId,
        incoming: Envelope<Scratchpad>,
    ) -> Result<(), ClientError> {
        let mut pads = self.scratchpads(sku)?;
        let merged = merge_lww(pads.get(&id), Some(&incoming))?;
        if let Some(resolved) = merged.resolved {
            let _ = pads.insert(id, resolved);
        }
        self.store.set(&scratchpad_key(sku), &pads)?;
        Ok(())
    }

    // ---- join reconciliation ---------------------------------------------

    /// Run the full three-way merge against a server snapshot. The local
    /// store adopts the resolved state; the returned frames are what the
    /// server still has to hear.
    pub fn reconcile(
        &self,
        sku: &str,
        info: &ShareInfo,
    ) -> Result<Vec<ClientFrame>, ClientError> {
        let local = self.incidents(sku)?;
        let merged = merge_map(&local, &info.data)?;

        for id in &merged.local.deleted {
            if local.values.contains_key(id) {
                self.notifier.notify(ClientEvent::IncidentDeleted {
                    sku: sku.to_owned(),
                    id: id.clone(),
                });
            }
        }

        let mut frames = Vec::new();
        for id in &merged.remote.values {
            let Some(envelope) = merged.resolved.values.get(id) else {
                continue;
            };
            let frame = if info.data.values.contains_key(id) {
                ClientFrame::UpdateIncident {
                    incident: envelope.clone(),
                }
            } else {
                ClientFrame::AddIncident {
                    incident: envelope.clone(),
                }
            };
            frames.push(frame);
        }
        for id in &merged.remote.deleted {
            frames.push(ClientFrame::RemoveIncident { id: id.clone() });
        }

        self.store.set(&map_key(sku), &merged.resolved)?;

        // Scratchpads follow the same discipline, without tombstones.
        let mut pads = self.scratchpads(sku)?;
        for (id, remote) in &info.scratchpads {
            let merged = merge_lww(pads.get(id), Some(remote))?;
            if let Some(resolved) = merged.resolved {
                if !merged.rejected.is_empty() {
                    frames.push(ClientFrame::ScratchpadUpdate {
                        id: id.clone(),
                        scratchpad: resolved.clone(),
                    });
                }
                let _ = pads.insert(id.clone(), resolved);
            }
        }
        for (id, local_pad) in &pads {
            if !info.scratchpads.contains_key(id) {
                frames.push(ClientFrame::ScratchpadUpdate {
                    id: id.clone(),
                    scratchpad: local_pad.clone(),
                });
            }
        }
        self.store.set(&scratchpad_key(sku), &pads)?;

        self.notifier.notify(ClientEvent::SyncCompleted {
            sku: sku.to_owned(),
        });

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use matchlog_identity::Keypair;
    use matchlog_primitives::Outcome;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    const SKU: &str = "RE-V5RC-25-0000";

    fn replica() -> (Replica, UnboundedReceiver<ClientEvent>) {
        let (notifier, events) = Notifier::channel();
        let replica = Replica::new(Store::memory(), Keypair::generate(), notifier);
        (replica, events)
    }

    fn incident(id: &str) -> Incident {
        Incident {
            id: IncidentId::from(id.to_owned()),
            sku: SKU.to_owned(),
            team: "1234A".to_owned(),
            match_ref: None,
            outcome: Outcome::Minor,
            rules: vec!["<SG1>".to_owned()],
            notes: "a".to_owned(),
            time: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            assets: vec![],
        }
    }

    fn empty_share_info() -> ShareInfo {
        ShareInfo {
            active_users: vec![],
            invitations: vec![],
            data: ConsistentMap::new(),
            scratchpads: BTreeMap::new(),
        }
    }

    #[test]
    fn add_applies_locally_before_any_network() {
        let (replica, _events) = replica();

        let envelope = replica.add(incident("i1")).unwrap();
        assert_eq!(envelope.revision(), 0);

        let map = replica.incidents(SKU).unwrap();
        assert!(map.values.contains_key(&IncidentId::from("i1".to_owned())));
    }

    #[test]
    fn edit_bumps_only_the_named_fields() {
        let (replica, _events) = replica();
        let id = IncidentId::from("i1".to_owned());

        let _ = replica.add(incident("i1")).unwrap();
        let envelope = replica
            .edit(SKU, &id, &[("notes", json!("contact in the zone"))])
            .unwrap();

        assert_eq!(envelope.consistency["notes"].count, 1);
        assert_eq!(envelope.consistency["team"].count, 0);
        assert_eq!(envelope.consistency["rules"].count, 0);
        assert_eq!(envelope.value.notes, "contact in the zone");
    }

    #[test]
    fn add_after_delete_is_refused_locally() {
        let (replica, _events) = replica();
        let id = IncidentId::from("i1".to_owned());

        let _ = replica.add(incident("i1")).unwrap();
        assert!(replica.delete(SKU, &id).unwrap());

        assert!(matches!(
            replica.add(incident("i1")),
            Err(ClientError::Tombstoned)
        ));
    }

    #[test]
    fn queue_round_trips_and_drains() {
        let (replica, _events) = replica();

        replica
            .enqueue(
                SKU,
                QueuedOp::RemoveIncident {
                    id: IncidentId::from("i1".to_owned()),
                },
            )
            .unwrap();
        assert_eq!(replica.queued(SKU).unwrap().len(), 1);

        let drained = replica.drain_queue(SKU).unwrap();
        assert_eq!(drained.len(), 1);
        assert!(replica.queued(SKU).unwrap().is_empty());
    }

    #[test]
    fn reconcile_applies_remote_tombstone_and_notifies() {
        let (replica, mut events) = replica();
        let id = IncidentId::from("i1".to_owned());

        let _ = replica.add(incident("i1")).unwrap();

        let mut info = empty_share_info();
        assert!(info.data.delete(id.clone()));

        let frames = replica.reconcile(SKU, &info).unwrap();
        assert!(frames.is_empty());

        let map = replica.incidents(SKU).unwrap();
        assert!(map.values.is_empty());
        assert!(map.is_deleted(&id));

        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::IncidentDeleted { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::SyncCompleted { .. }
        ));
    }

    #[test]
    fn reconcile_pushes_offline_delete_only() {
        let (replica, _events) = replica();
        let id = IncidentId::from("i1".to_owned());

        // The full offline story: add, edit, delete before ever connecting.
        let _ = replica.add(incident("i1")).unwrap();
        let _ = replica
            .edit(SKU, &id, &[("notes", json!("edited offline"))])
            .unwrap();
        assert!(replica.delete(SKU, &id).unwrap());

        let frames = replica.reconcile(SKU, &empty_share_info()).unwrap();

        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ClientFrame::RemoveIncident { id: deleted } if *deleted == id
        ));
    }

    #[test]
    fn reconcile_pulls_server_only_incidents() {
        let (replica, _events) = replica();
        let id = IncidentId::from("i9".to_owned());

        let mut info = empty_share_info();
        let envelope = Envelope::init(incident("i9"), &matchlog_primitives::PeerId::new("SRV"));
        assert!(info.data.upsert(id.clone(), envelope));

        let frames = replica.reconcile(SKU, &info).unwrap();
        assert!(frames.is_empty());

        let map = replica.incidents(SKU).unwrap();
        assert!(map.values.contains_key(&id));
    }

    #[test]
    fn reconcile_pushes_local_only_incidents_as_adds() {
        let (replica, _events) = replica();

        let _ = replica.add(incident("i1")).unwrap();
        let frames = replica.reconcile(SKU, &empty_share_info()).unwrap();

        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], ClientFrame::AddIncident { .. }));
    }

    #[test]
    fn scratchpad_updates_touch_only_changed_fields() {
        let (replica, _events) = replica();
        let id = ScratchpadId::derive(SKU, 1, "Q12");

        let pad = Scratchpad {
            id: id.clone(),
            sku: SKU.to_owned(),
            game: "High Stakes".to_owned(),
            awp: Default::default(),
            auto: Default::default(),
            notes: String::new(),
        };
        let first = replica.update_scratchpad(pad.clone()).unwrap();
        assert_eq!(first.revision(), 0);

        let mut changed = pad;
        changed.notes = "red AWP confirmed".to_owned();
        let second = replica.update_scratchpad(changed).unwrap();

        assert_eq!(second.consistency["notes"].count, 1);
        assert_eq!(second.consistency["game"].count, 0);
        assert_eq!(second.consistency["awp"].count, 0);
    }
}
