//! Invitation and admission endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::Extension;
use matchlog_primitives::{Invitation, InvitationId, PeerId};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResponse};
use crate::middleware::auth::VerifiedPeer;
use crate::ServiceState;

/// `POST /:sku/create` — create the event instance; the caller becomes its
/// sole admin and receives an accepted self-invitation, so no second step is
/// needed.
pub async fn create(
    Extension(state): Extension<Arc<ServiceState>>,
    Extension(VerifiedPeer(peer)): Extension<VerifiedPeer>,
    Path(sku): Path<String>,
) -> Result<ApiResponse<Invitation>, ApiError> {
    let invitation = state.create_instance(&sku, &peer).await?;
    Ok(ApiResponse {
        payload: invitation,
    })
}

/// `GET /:sku/invitation` — the caller's invitation state for this event.
pub async fn invitation(
    Extension(state): Extension<Arc<ServiceState>>,
    Extension(VerifiedPeer(peer)): Extension<VerifiedPeer>,
    Path(sku): Path<String>,
) -> Result<ApiResponse<Option<Invitation>>, ApiError> {
    let instance = state.instance(&sku).await?;
    Ok(ApiResponse {
        payload: instance.invitation_for(&peer).await,
    })
}

#[derive(Debug, Deserialize)]
pub struct AcceptQuery {
    pub invitation: String,
}

/// `PUT /:sku/accept?invitation=<id>` — consume an invitation addressed to
/// the caller. The response carries the instance secret.
pub async fn accept(
    Extension(state): Extension<Arc<ServiceState>>,
    Extension(VerifiedPeer(peer)): Extension<VerifiedPeer>,
    Path(sku): Path<String>,
    Query(query): Query<AcceptQuery>,
) -> Result<ApiResponse<Invitation>, ApiError> {
    let instance = state.instance(&sku).await?;
    let invitation = instance
        .accept(&peer, &InvitationId::from(query.invitation))
        .await?;
    Ok(ApiResponse {
        payload: invitation,
    })
}

#[derive(Debug, Deserialize)]
pub struct InviteQuery {
    pub user: String,
    #[serde(default)]
    pub admin: bool,
}

/// `PUT /:sku/invite?user=<peerId>` — admin invites a peer.
pub async fn invite(
    Extension(state): Extension<Arc<ServiceState>>,
    Extension(VerifiedPeer(peer)): Extension<VerifiedPeer>,
    Path(sku): Path<String>,
    Query(query): Query<InviteQuery>,
) -> Result<ApiResponse<Invitation>, ApiError> {
    let instance = state.instance(&sku).await?;
    let invitation = instance
        .invite(&peer, PeerId::new(query.user), query.admin)
        .await?;
    Ok(ApiResponse {
        payload: invitation,
    })
}

#[derive(Debug, Deserialize)]
pub struct RevokeQuery {
    pub user: String,
}

/// `DELETE /:sku/invite?user=<peerId>` — admin revokes a peer, or a peer
/// removes itself. Any live socket the target holds is closed.
pub async fn revoke(
    Extension(state): Extension<Arc<ServiceState>>,
    Extension(VerifiedPeer(peer)): Extension<VerifiedPeer>,
    Path(sku): Path<String>,
    Query(query): Query<RevokeQuery>,
) -> Result<ApiResponse<()>, ApiError> {
    let instance = state.instance(&sku).await?;
    instance.revoke(&peer, &PeerId::new(query.user)).await?;
    Ok(ApiResponse { payload: () })
}

#[derive(Debug, Serialize)]
pub struct RequestCodeResponse {
    pub code: String,
}

/// `PUT /:sku/request` — produce a short human-readable code bound to the
/// caller's public key, for an admin to read off the requester's screen.
pub async fn request_code(
    Extension(state): Extension<Arc<ServiceState>>,
    Extension(VerifiedPeer(peer)): Extension<VerifiedPeer>,
    Path(sku): Path<String>,
) -> Result<ApiResponse<RequestCodeResponse>, ApiError> {
    let instance = state.instance(&sku).await?;
    let code = instance.issue_request_code(&peer).await;
    Ok(ApiResponse {
        payload: RequestCodeResponse { code },
    })
}

#[derive(Debug, Deserialize)]
pub struct ResolveCodeQuery {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct ResolveCodeResponse {
    pub user: PeerId,
}

/// `GET /:sku/request?code=<c>` — resolve a code back to its public key.
pub async fn resolve_code(
    Extension(state): Extension<Arc<ServiceState>>,
    Extension(VerifiedPeer(peer)): Extension<VerifiedPeer>,
    Path(sku): Path<String>,
    Query(query): Query<ResolveCodeQuery>,
) -> Result<ApiResponse<ResolveCodeResponse>, ApiError> {
    let instance = state.instance(&sku).await?;
    let user = instance
        .resolve_request_code(&peer, &query.code, state.config.request_code_ttl())
        .await?;
    Ok(ApiResponse {
        payload: ResolveCodeResponse { user },
    })
}
