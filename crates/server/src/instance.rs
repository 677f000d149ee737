//! Per-SKU authoritative event instance.
//!
//! One instance owns the canonical incident map, the scratchpads, the
//! membership records, and the list of live sockets for a single event. All
//! state-touching work is serialized behind one async mutex; persistence is
//! write-through to the store, and every mutation is broadcast to the active
//! sockets after it is durable.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use matchlog_crdt::{merge_lww, ConsistentMap, Envelope};
use matchlog_primitives::{
    Incident, IncidentId, Invitation, InvitationId, Peer, PeerId, Scratchpad, ScratchpadId,
};
use matchlog_server_primitives::{ClientFrame, ControlFrame, Frame, FrameSender, ServerFrame, ShareInfo};
use matchlog_store::{Store, StoreError};
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::ServiceState;

/// Characters used for human-readable join-request codes. Ambiguous glyphs
/// (`0/O`, `1/I`) are left out.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;

/// Commands the instance can issue to one socket's writer task.
#[derive(Debug)]
pub enum SessionCommand {
    /// Send a serialized frame.
    Send(String),
    /// Send a keepalive ping.
    Ping,
    /// Close the socket.
    Close,
}

pub(crate) struct Session {
    pub peer: Peer,
    pub active: bool,
    pub commands: mpsc::Sender<SessionCommand>,
}

#[derive(Clone, Debug)]
struct RequestCode {
    peer: PeerId,
    issued_at: DateTime<Utc>,
}

/// The durable part of an instance, as written to the store.
#[derive(Serialize, Deserialize)]
pub(crate) struct PersistedInstance {
    pub secret: String,
    pub admins: BTreeSet<PeerId>,
    pub members: BTreeSet<PeerId>,
    pub invitations: BTreeMap<InvitationId, Invitation>,
    pub incidents: ConsistentMap<IncidentId, Incident>,
    pub scratchpads: BTreeMap<ScratchpadId, Envelope<Scratchpad>>,
}

pub(crate) struct InstanceState {
    pub secret: String,
    pub admins: BTreeSet<PeerId>,
    pub members: BTreeSet<PeerId>,
    pub invitations: BTreeMap<InvitationId, Invitation>,
    pub incidents: ConsistentMap<IncidentId, Incident>,
    pub scratchpads: BTreeMap<ScratchpadId, Envelope<Scratchpad>>,
    request_codes: HashMap<String, RequestCode>,
    sessions: Vec<Session>,
}

impl InstanceState {
    fn fresh(secret: String, creator: &PeerId) -> Self {
        Self {
            secret,
            admins: BTreeSet::from([creator.clone()]),
            members: BTreeSet::from([creator.clone()]),
            invitations: BTreeMap::new(),
            incidents: ConsistentMap::new(),
            scratchpads: BTreeMap::new(),
            request_codes: HashMap::new(),
            sessions: Vec::new(),
        }
    }

    fn from_persisted(persisted: PersistedInstance) -> Self {
        Self {
            secret: persisted.secret,
            admins: persisted.admins,
            members: persisted.members,
            invitations: persisted.invitations,
            incidents: persisted.incidents,
            scratchpads: persisted.scratchpads,
            request_codes: HashMap::new(),
            sessions: Vec::new(),
        }
    }

    fn to_persisted(&self) -> PersistedInstance {
        PersistedInstance {
            secret: self.secret.clone(),
            admins: self.admins.clone(),
            members: self.members.clone(),
            invitations: self.invitations.clone(),
            incidents: self.incidents.clone(),
            scratchpads: self.scratchpads.clone(),
        }
    }

    fn active_users(&self) -> Vec<Peer> {
        self.sessions
            .iter()
            .filter(|session| session.active)
            .map(|session| session.peer.clone())
            .collect()
    }

    fn invitation_views(&self) -> Vec<Invitation> {
        self.invitations
            .values()
            .map(Invitation::pending_view)
            .collect()
    }

    fn share_info(&self) -> ShareInfo {
        ShareInfo {
            active_users: self.active_users(),
            invitations: self.invitation_views(),
            data: self.incidents.clone(),
            scratchpads: self.scratchpads.clone(),
        }
    }
}

pub struct EventInstance {
    pub sku: String,
    store: Store,
    state: Mutex<InstanceState>,
    last_activity: StdMutex<Instant>,
}

fn store_key(sku: &str) -> String {
    format!("instance:{sku}")
}

impl EventInstance {
    /// Create a brand-new instance with `creator` as its sole admin. Returns
    /// the accepted self-invitation carrying the fresh secret.
    pub(crate) fn create(
        sku: &str,
        store: Store,
        creator: &PeerId,
    ) -> Result<(Self, Invitation), ApiError> {
        let secret: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

        let invitation = Invitation::for_creator(sku, creator.clone(), secret.clone());

        let mut state = InstanceState::fresh(secret, creator);
        let _ = state
            .invitations
            .insert(invitation.id.clone(), invitation.clone());

        let instance = Self {
            sku: sku.to_owned(),
            store,
            state: Mutex::new(state),
            last_activity: StdMutex::new(Instant::now()),
        };
        instance.persist_state_blocking()?;

        info!(%sku, %creator, "event instance created");

        Ok((instance, invitation))
    }

    /// Rehydrate an instance from the store, if one was persisted.
    pub(crate) fn load(sku: &str, store: Store) -> Result<Option<Self>, StoreError> {
        let Some(persisted) = store.get::<PersistedInstance>(&store_key(sku))? else {
            return Ok(None);
        };

        Ok(Some(Self {
            sku: sku.to_owned(),
            store,
            state: Mutex::new(InstanceState::from_persisted(persisted)),
            last_activity: StdMutex::new(Instant::now()),
        }))
    }

    /// Reset the idle clock. Called on every request that reaches the
    /// instance.
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    /// Watch for the idle deadline and wipe the instance when it passes.
    pub(crate) fn spawn_idle_watch(
        self: &Arc<Self>,
        idle: std::time::Duration,
        service: Weak<ServiceState>,
    ) {
        let instance = Arc::downgrade(self);
        let sku = self.sku.clone();

        drop(tokio::spawn(async move {
            loop {
                let remaining = {
                    let Some(instance) = instance.upgrade() else {
                        return;
                    };
                    let elapsed = instance
                        .last_activity
                        .lock()
                        .map(|last| last.elapsed())
                        .unwrap_or_default();
                    idle.checked_sub(elapsed)
                };

                match remaining {
                    Some(remaining) => tokio::time::sleep(remaining).await,
                    None => break,
                }
            }

            if let Some(service) = service.upgrade() {
                info!(%sku, "idle window elapsed, wiping instance state");
                service.evict_instance(&sku).await;
            }
        }));
    }

    fn persist_state_blocking(&self) -> Result<(), ApiError> {
        let state = self
            .state
            .try_lock()
            .map_err(|_| ApiError::server_error("instance state contended during create"))?;
        self.store
            .set(&store_key(&self.sku), &state.to_persisted())?;
        Ok(())
    }

    fn persist_locked(&self, state: &InstanceState) -> Result<(), ApiError> {
        self.store
            .set(&store_key(&self.sku), &state.to_persisted())?;
        Ok(())
    }

    /// Remove the durable record. Called on eviction.
    pub(crate) fn wipe(&self) -> Result<(), StoreError> {
        self.store.del(&store_key(&self.sku))
    }

    // ---- queries ---------------------------------------------------------

    pub async fn is_member(&self, peer: &PeerId) -> bool {
        self.state.lock().await.members.contains(peer)
    }

    pub async fn is_admin(&self, peer: &PeerId) -> bool {
        self.state.lock().await.admins.contains(peer)
    }

    pub async fn snapshot(&self) -> ShareInfo {
        self.state.lock().await.share_info()
    }

    pub async fn incidents(&self) -> ConsistentMap<IncidentId, Incident> {
        self.state.lock().await.incidents.clone()
    }

    // ---- incident mutations ---------------------------------------------

    /// Add an incident. Tombstoned ids are always refused.
    pub async fn add_incident(
        &self,
        incident: Envelope<Incident>,
        sender: FrameSender,
    ) -> Result<(), ApiError> {
        self.touch();
        let mut state = self.state.lock().await;

        let id = incident.value.id.clone();
        if state.incidents.is_deleted(&id) {
            return Err(ApiError::tombstoned());
        }

        let resolved = match state.incidents.get(&id) {
            Some(current) => merge_lww(Some(current), Some(&incident))?
                .resolved
                .unwrap_or(incident),
            None => incident,
        };

        let _ = state.incidents.upsert(id, resolved.clone());
        self.persist_locked(&state)?;

        broadcast(
            &mut state,
            &ServerFrame::Echo(ClientFrame::AddIncident { incident: resolved }),
            sender,
        );

        Ok(())
    }

    /// Edit an incident. Rejected as stale when the incoming revision is
    /// behind the stored one; merged per field otherwise.
    pub async fn update_incident(
        &self,
        incident: Envelope<Incident>,
        sender: FrameSender,
    ) -> Result<(), ApiError> {
        self.touch();
        let mut state = self.state.lock().await;

        let id = incident.value.id.clone();
        if state.incidents.is_deleted(&id) {
            return Err(ApiError::tombstoned());
        }

        let resolved = match state.incidents.get(&id) {
            Some(current) => {
                if incident.revision() < current.revision() {
                    return Err(ApiError::stale());
                }
                merge_lww(Some(current), Some(&incident))?
                    .resolved
                    .unwrap_or(incident)
            }
            None => incident,
        };

        let _ = state.incidents.upsert(id, resolved.clone());
        self.persist_locked(&state)?;

        broadcast(
            &mut state,
            &ServerFrame::Echo(ClientFrame::UpdateIncident { incident: resolved }),
            sender,
        );

        Ok(())
    }

    /// Delete an incident. Idempotent: a repeat delete succeeds without a
    /// broadcast.
    pub async fn remove_incident(
        &self,
        id: IncidentId,
        sender: FrameSender,
    ) -> Result<(), ApiError> {
        self.touch();
        let mut state = self.state.lock().await;

        if !state.incidents.delete(id.clone()) {
            return Ok(());
        }
        self.persist_locked(&state)?;

        broadcast(
            &mut state,
            &ServerFrame::Echo(ClientFrame::RemoveIncident { id }),
            sender,
        );

        Ok(())
    }

    /// Merge a scratchpad update and broadcast the resolved envelope.
    pub async fn update_scratchpad(
        &self,
        id: ScratchpadId,
        scratchpad: Envelope<Scratchpad>,
        sender: FrameSender,
    ) -> Result<(), ApiError> {
        self.touch();
        let mut state = self.state.lock().await;

        let resolved = match state.scratchpads.get(&id) {
            Some(current) => merge_lww(Some(current), Some(&scratchpad))?
                .resolved
                .unwrap_or(scratchpad),
            None => scratchpad,
        };

        let _ = state.scratchpads.insert(id.clone(), resolved.clone());
        self.persist_locked(&state)?;

        broadcast(
            &mut state,
            &ServerFrame::Echo(ClientFrame::ScratchpadUpdate {
                id,
                scratchpad: resolved,
            }),
            sender,
        );

        Ok(())
    }

    /// Relay a chat message to every active socket.
    pub async fn broadcast_message(&self, message: String, sender: FrameSender) {
        self.touch();
        let mut state = self.state.lock().await;
        broadcast(
            &mut state,
            &ServerFrame::Echo(ClientFrame::Message { message }),
            sender,
        );
    }

    // ---- membership ------------------------------------------------------

    /// Admin `from` invites `to`. Re-inviting returns the standing pending
    /// invitation.
    pub async fn invite(
        &self,
        from: &PeerId,
        to: PeerId,
        admin: bool,
    ) -> Result<Invitation, ApiError> {
        self.touch();
        let mut state = self.state.lock().await;

        if !state.admins.contains(from) {
            return Err(ApiError::forbidden());
        }

        if let Some(existing) = state
            .invitations
            .values()
            .find(|invitation| invitation.to == to && !invitation.accepted)
        {
            return Ok(existing.pending_view());
        }

        let invitation = Invitation {
            id: InvitationId::random(),
            sku: self.sku.clone(),
            from: from.clone(),
            to,
            admin,
            accepted: false,
            instance_secret: None,
        };
        let _ = state
            .invitations
            .insert(invitation.id.clone(), invitation.clone());
        self.persist_locked(&state)?;

        Ok(invitation.pending_view())
    }

    /// The caller's invitation state: the accepted record (with secret) if
    /// admitted, the pending view if invited, `None` otherwise.
    pub async fn invitation_for(&self, peer: &PeerId) -> Option<Invitation> {
        self.touch();
        let state = self.state.lock().await;

        let invitation = state
            .invitations
            .values()
            .filter(|invitation| invitation.to == *peer)
            .max_by_key(|invitation| invitation.accepted)?;

        if invitation.accepted && state.members.contains(peer) {
            let mut full = invitation.clone();
            full.instance_secret = Some(state.secret.clone());
            Some(full)
        } else {
            Some(invitation.pending_view())
        }
    }

    /// Accept an invitation addressed to `peer`. Consumed exactly once; a
    /// repeat accept by the same peer returns the standing record.
    pub async fn accept(
        &self,
        peer: &PeerId,
        invitation_id: &InvitationId,
    ) -> Result<Invitation, ApiError> {
        self.touch();
        let mut state = self.state.lock().await;

        let Some(invitation) = state.invitations.get(invitation_id).cloned() else {
            return Err(ApiError::bad_request("unknown invitation"));
        };

        if invitation.to != *peer {
            return Err(ApiError::forbidden());
        }

        if !invitation.accepted {
            let _ = state.members.insert(peer.clone());
            if invitation.admin {
                let _ = state.admins.insert(peer.clone());
            }
            if let Some(stored) = state.invitations.get_mut(invitation_id) {
                stored.accepted = true;
            }
            self.persist_locked(&state)?;
        }

        let mut accepted = invitation;
        accepted.accepted = true;
        accepted.instance_secret = Some(state.secret.clone());
        Ok(accepted)
    }

    /// Expunge `target` from the instance. Admins may remove anyone; a peer
    /// may remove itself. Live sockets held by the target are closed.
    pub async fn revoke(&self, caller: &PeerId, target: &PeerId) -> Result<(), ApiError> {
        self.touch();
        let mut state = self.state.lock().await;

        if caller != target && !state.admins.contains(caller) {
            return Err(ApiError::forbidden());
        }

        if state.admins.contains(target) && state.admins.len() == 1 {
            return Err(ApiError::bad_request("cannot remove the last admin"));
        }

        let _ = state.members.remove(target);
        let _ = state.admins.remove(target);
        state
            .invitations
            .retain(|_, invitation| invitation.to != *target);
        self.persist_locked(&state)?;

        let evicted: Vec<Peer> = state
            .sessions
            .iter_mut()
            .filter(|session| session.peer.id == *target && session.active)
            .map(|session| {
                session.active = false;
                let _ = session.commands.try_send(SessionCommand::Close);
                session.peer.clone()
            })
            .collect();
        state.sessions.retain(|session| session.peer.id != *target);

        for peer in evicted {
            broadcast_user_change(&mut state, peer, false);
        }

        Ok(())
    }

    /// Issue a short join-request code bound to `peer`.
    pub async fn issue_request_code(&self, peer: &PeerId) -> String {
        self.touch();
        let mut state = self.state.lock().await;

        let mut rng = rand::thread_rng();
        let code: String = (0..CODE_LEN)
            .filter_map(|_| CODE_ALPHABET.choose(&mut rng).map(|b| char::from(*b)))
            .collect();

        let _ = state.request_codes.insert(
            code.clone(),
            RequestCode {
                peer: peer.clone(),
                issued_at: Utc::now(),
            },
        );

        code
    }

    /// Resolve a join-request code back to its public key. Admin-only;
    /// single use; expired codes read as incorrect.
    pub async fn resolve_request_code(
        &self,
        caller: &PeerId,
        code: &str,
        ttl: chrono::Duration,
    ) -> Result<PeerId, ApiError> {
        self.touch();
        let mut state = self.state.lock().await;

        if !state.admins.contains(caller) {
            return Err(ApiError::forbidden());
        }

        let Some(request) = state.request_codes.remove(code) else {
            return Err(ApiError::incorrect_code());
        };

        if Utc::now() - request.issued_at > ttl {
            debug!(sku = %self.sku, "join-request code expired");
            return Err(ApiError::incorrect_code());
        }

        Ok(request.peer)
    }

    // ---- sessions --------------------------------------------------------

    /// Register a socket session. Any prior socket for the same peer id is
    /// closed first; the caller gets the snapshot to send to the new socket
    /// only.
    pub async fn join(&self, peer: Peer, commands: mpsc::Sender<SessionCommand>) -> ShareInfo {
        self.touch();
        let mut state = self.state.lock().await;

        let mut evicted_prior = false;
        for session in state
            .sessions
            .iter_mut()
            .filter(|session| session.peer.id == peer.id)
        {
            session.active = false;
            let _ = session.commands.try_send(SessionCommand::Close);
            evicted_prior = true;
        }
        if evicted_prior {
            debug!(sku = %self.sku, peer = %peer.id, "evicted prior socket for reconnecting peer");
        }
        state.sessions.retain(|session| session.peer.id != peer.id);

        state.sessions.push(Session {
            peer: peer.clone(),
            active: true,
            commands,
        });

        broadcast_user_change(&mut state, peer, true);

        state.share_info()
    }

    /// Drop a session after its socket closed or errored. The channel
    /// identifies the exact session, so a stale socket evicted by a
    /// reconnect cannot take its successor down with it.
    pub async fn leave(&self, peer_id: &PeerId, commands: &mpsc::Sender<SessionCommand>) {
        self.touch();
        let mut state = self.state.lock().await;

        let Some(index) = state.sessions.iter().position(|session| {
            session.peer.id == *peer_id && session.commands.same_channel(commands)
        }) else {
            return;
        };

        let peer = state.sessions[index].peer.clone();
        state.sessions[index].active = false;
        let _ = state.sessions.remove(index);

        broadcast_user_change(&mut state, peer, false);
    }
}

/// Fan a frame out to every active session. A session whose channel refuses
/// the send is marked inactive and announced with a `server_user_remove`;
/// that removal cascade runs one broadcast deep only.
fn broadcast(state: &mut InstanceState, payload: &ServerFrame, sender: FrameSender) {
    let frame = Frame::new(payload, sender, Utc::now());
    let Ok(text) = serde_json::to_string(&frame) else {
        warn!("dropping unserializable broadcast frame");
        return;
    };

    let failed = send_to_active(state, &text);

    for peer in failed {
        broadcast_user_change(state, peer, false);
    }
}

/// Announce a session joining or leaving. Failures inside this broadcast
/// only mark sessions inactive — no recursive removal storm.
fn broadcast_user_change(state: &mut InstanceState, user: Peer, added: bool) {
    let active_users = state.active_users();
    let invitations = state.invitation_views();

    let payload = if added {
        ServerFrame::Control(ControlFrame::ServerUserAdd {
            user,
            active_users,
            invitations,
        })
    } else {
        ServerFrame::Control(ControlFrame::ServerUserRemove {
            user,
            active_users,
            invitations,
        })
    };

    let frame = Frame::new(&payload, FrameSender::Server, Utc::now());
    let Ok(text) = serde_json::to_string(&frame) else {
        return;
    };

    let _ = send_to_active(state, &text);
}

/// Send `text` to every active session, marking and returning the peers
/// whose channel rejected it.
fn send_to_active(state: &mut InstanceState, text: &str) -> Vec<Peer> {
    let mut failed = Vec::new();

    for session in &mut state.sessions {
        if !session.active {
            continue;
        }
        if session
            .commands
            .try_send(SessionCommand::Send(text.to_owned()))
            .is_err()
        {
            session.active = false;
            failed.push(session.peer.clone());
        }
    }

    state
        .sessions
        .retain(|session| session.active || !failed.iter().any(|peer| peer.id == session.peer.id));

    failed
}
