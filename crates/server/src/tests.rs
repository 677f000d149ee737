//! Instance-level behavior tests: membership, refusals, session handling.

use matchlog_crdt::Envelope;
use matchlog_primitives::{Incident, IncidentId, Outcome, Peer, PeerId};
use matchlog_server_primitives::{ErrorReason, FrameSender};
use matchlog_store::Store;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::instance::SessionCommand;
use crate::ServiceState;

const SKU: &str = "RE-V5RC-25-0000";

fn peer(id: &str) -> PeerId {
    PeerId::new(id)
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

fn sender(id: &str) -> FrameSender {
    FrameSender::Client {
        id: peer(id),
        name: "Ref".to_owned(),
    }
}

fn service() -> std::sync::Arc<ServiceState> {
    ServiceState::new(ServerConfig::default(), Store::memory())
}

/// Drain one command and return the frame JSON it carried.
fn recv_frame(rx: &mut mpsc::Receiver<SessionCommand>) -> serde_json::Value {
    match rx.try_recv().expect("expected a queued command") {
        SessionCommand::Send(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected Send, got {other:?}"),
    }
}

#[tokio::test]
async fn create_invite_accept_flow() {
    let state = service();
    let admin = peer("ADMIN");

    let created = state.create_instance(SKU, &admin).await.unwrap();
    assert!(created.accepted);
    assert!(created.admin);
    let secret = created.instance_secret.clone().unwrap();

    let instance = state.instance(SKU).await.unwrap();
    assert!(instance.is_admin(&admin).await);

    let invitee = peer("GUEST");
    let pending = instance.invite(&admin, invitee.clone(), false).await.unwrap();
    assert!(!pending.accepted);
    assert_eq!(pending.instance_secret, None);
    assert!(!instance.is_member(&invitee).await);

    // The invitee sees a pending record without the secret.
    let seen = instance.invitation_for(&invitee).await.unwrap();
    assert_eq!(seen.instance_secret, None);

    let accepted = instance.accept(&invitee, &pending.id).await.unwrap();
    assert!(accepted.accepted);
    assert_eq!(accepted.instance_secret.as_deref(), Some(secret.as_str()));
    assert!(instance.is_member(&invitee).await);
    assert!(!instance.is_admin(&invitee).await);
}

#[tokio::test]
async fn non_admin_cannot_invite() {
    let state = service();
    let instance = {
        let _ = state.create_instance(SKU, &peer("ADMIN")).await.unwrap();
        state.instance(SKU).await.unwrap()
    };

    let err = instance
        .invite(&peer("GUEST"), peer("OTHER"), false)
        .await
        .unwrap_err();
    assert_eq!(err.reason, ErrorReason::Forbidden);
}

#[tokio::test]
async fn tombstoned_add_is_always_refused() {
    let state = service();
    let _ = state.create_instance(SKU, &peer("ADMIN")).await.unwrap();
    let instance = state.instance(SKU).await.unwrap();

    let envelope = Envelope::init(incident("i1"), &peer("ADMIN"));
    instance
        .add_incident(envelope.clone(), sender("ADMIN"))
        .await
        .unwrap();
    instance
        .remove_incident(IncidentId::from("i1".to_owned()), sender("ADMIN"))
        .await
        .unwrap();

    let err = instance
        .add_incident(envelope, sender("ADMIN"))
        .await
        .unwrap_err();
    assert_eq!(err.reason, ErrorReason::Stale);
    assert_eq!(err.details.as_deref(), Some("deleted"));
}

#[tokio::test]
async fn stale_edit_is_rejected() {
    let state = service();
    let _ = state.create_instance(SKU, &peer("ADMIN")).await.unwrap();
    let instance = state.instance(SKU).await.unwrap();

    let stale = Envelope::init(incident("i1"), &peer("ADMIN"));

    let mut fresh = stale.clone();
    fresh
        .update("notes", json!("edited"), &peer("ADMIN"))
        .unwrap();
    instance
        .add_incident(fresh, sender("ADMIN"))
        .await
        .unwrap();

    let err = instance
        .update_incident(stale, sender("ADMIN"))
        .await
        .unwrap_err();
    assert_eq!(err.reason, ErrorReason::Stale);
    assert_eq!(err.details, None);
}

#[tokio::test]
async fn repeat_delete_is_idempotent_and_silent() {
    let state = service();
    let _ = state.create_instance(SKU, &peer("ADMIN")).await.unwrap();
    let instance = state.instance(SKU).await.unwrap();

    let (tx, mut rx) = mpsc::channel(32);
    let _ = instance
        .join(
            Peer {
                id: peer("WATCHER"),
                name: "Watcher".to_owned(),
            },
            tx,
        )
        .await;
    // Skip our own join announcement.
    let _ = recv_frame(&mut rx);

    instance
        .add_incident(Envelope::init(incident("i1"), &peer("ADMIN")), sender("ADMIN"))
        .await
        .unwrap();
    let _ = recv_frame(&mut rx);

    instance
        .remove_incident(IncidentId::from("i1".to_owned()), sender("ADMIN"))
        .await
        .unwrap();
    let frame = recv_frame(&mut rx);
    assert_eq!(frame["type"], json!("remove_incident"));

    instance
        .remove_incident(IncidentId::from("i1".to_owned()), sender("ADMIN"))
        .await
        .unwrap();
    assert!(rx.try_recv().is_err(), "second delete must not broadcast");
}

#[tokio::test]
async fn reconnect_evicts_prior_socket_before_snapshot() {
    let state = service();
    let _ = state.create_instance(SKU, &peer("ADMIN")).await.unwrap();
    let instance = state.instance(SKU).await.unwrap();

    let ref_peer = Peer {
        id: peer("ADMIN"),
        name: "Ref".to_owned(),
    };

    let (tx1, mut rx1) = mpsc::channel(32);
    let info = instance.join(ref_peer.clone(), tx1).await;
    assert_eq!(info.active_users.len(), 1);
    let frame = recv_frame(&mut rx1);
    assert_eq!(frame["type"], json!("server_user_add"));

    let (tx2, mut rx2) = mpsc::channel(32);
    let info = instance.join(ref_peer, tx2).await;

    // The prior socket got a close; the roster holds a single session.
    assert!(matches!(
        rx1.try_recv().unwrap(),
        SessionCommand::Close
    ));
    assert_eq!(info.active_users.len(), 1);

    let frame = recv_frame(&mut rx2);
    assert_eq!(frame["type"], json!("server_user_add"));
}

#[tokio::test]
async fn revoke_expels_peer_and_closes_its_socket() {
    let state = service();
    let admin = peer("ADMIN");
    let _ = state.create_instance(SKU, &admin).await.unwrap();
    let instance = state.instance(SKU).await.unwrap();

    let guest = peer("GUEST");
    let invitation = instance.invite(&admin, guest.clone(), false).await.unwrap();
    let _ = instance.accept(&guest, &invitation.id).await.unwrap();

    let (tx, mut rx) = mpsc::channel(32);
    let _ = instance
        .join(
            Peer {
                id: guest.clone(),
                name: "Guest".to_owned(),
            },
            tx,
        )
        .await;
    let _ = recv_frame(&mut rx);

    instance.revoke(&admin, &guest).await.unwrap();

    assert!(!instance.is_member(&guest).await);
    assert!(matches!(rx.try_recv().unwrap(), SessionCommand::Close));

    // A revoked peer's invitation is gone too.
    assert!(instance.invitation_for(&guest).await.is_none());
}

#[tokio::test]
async fn last_admin_cannot_be_removed() {
    let state = service();
    let admin = peer("ADMIN");
    let _ = state.create_instance(SKU, &admin).await.unwrap();
    let instance = state.instance(SKU).await.unwrap();

    let err = instance.revoke(&admin, &admin).await.unwrap_err();
    assert_eq!(err.reason, ErrorReason::BadRequest);
}

#[tokio::test]
async fn dead_socket_is_dropped_with_a_single_removal_announcement() {
    let state = service();
    let _ = state.create_instance(SKU, &peer("ADMIN")).await.unwrap();
    let instance = state.instance(SKU).await.unwrap();

    let (tx1, mut rx1) = mpsc::channel(32);
    let _ = instance
        .join(
            Peer {
                id: peer("ALIVE"),
                name: "Alive".to_owned(),
            },
            tx1,
        )
        .await;
    let _ = recv_frame(&mut rx1);

    let (tx2, rx2) = mpsc::channel(32);
    let _ = instance
        .join(
            Peer {
                id: peer("DEAD"),
                name: "Dead".to_owned(),
            },
            tx2,
        )
        .await;
    let _ = recv_frame(&mut rx1);
    drop(rx2);

    instance
        .add_incident(Envelope::init(incident("i1"), &peer("ADMIN")), sender("ADMIN"))
        .await
        .unwrap();

    let frame = recv_frame(&mut rx1);
    assert_eq!(frame["type"], json!("add_incident"));
    let frame = recv_frame(&mut rx1);
    assert_eq!(frame["type"], json!("server_user_remove"));
    assert_eq!(frame["user"]["id"], json!("DEAD"));
    assert!(rx1.try_recv().is_err());
}

#[tokio::test]
async fn request_codes_resolve_once_for_admins_only() {
    let state = service();
    let admin = peer("ADMIN");
    let _ = state.create_instance(SKU, &admin).await.unwrap();
    let instance = state.instance(SKU).await.unwrap();

    let outsider = peer("OUTSIDER");
    let code = instance.issue_request_code(&outsider).await;
    let ttl = state.config.request_code_ttl();

    let err = instance
        .resolve_request_code(&outsider, &code, ttl)
        .await
        .unwrap_err();
    assert_eq!(err.reason, ErrorReason::Forbidden);

    let resolved = instance
        .resolve_request_code(&admin, &code, ttl)
        .await
        .unwrap();
    assert_eq!(resolved, outsider);

    // Codes are single use.
    let err = instance
        .resolve_request_code(&admin, &code, ttl)
        .await
        .unwrap_err();
    assert_eq!(err.reason, ErrorReason::IncorrectCode);
}
