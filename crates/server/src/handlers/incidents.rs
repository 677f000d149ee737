//! Incident mutation and snapshot endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::{Extension, Json};
use matchlog_crdt::Envelope;
use matchlog_primitives::{Incident, IncidentId, PeerId};
use matchlog_server_primitives::ShareInfo;
use serde::Deserialize;

use crate::error::{ApiError, ApiResponse};
use crate::instance::EventInstance;
use crate::middleware::auth::VerifiedPeer;
use crate::ServiceState;

/// Look up the instance and require the caller to be admitted to it.
async fn admitted_instance(
    state: &Arc<ServiceState>,
    sku: &str,
    peer: &PeerId,
) -> Result<Arc<EventInstance>, ApiError> {
    let instance = state.instance(sku).await?;
    if !instance.is_member(peer).await {
        return Err(ApiError::forbidden());
    }
    Ok(instance)
}

fn check_sku(envelope: &Envelope<Incident>, sku: &str) -> Result<(), ApiError> {
    if envelope.value.sku != sku {
        return Err(ApiError::bad_request("incident SKU does not match route"));
    }
    Ok(())
}

/// `PUT /:sku/incident` — add an incident. Tombstoned ids are refused.
pub async fn add(
    Extension(state): Extension<Arc<ServiceState>>,
    Extension(VerifiedPeer(peer)): Extension<VerifiedPeer>,
    Path(sku): Path<String>,
    Json(incident): Json<Envelope<Incident>>,
) -> Result<ApiResponse<()>, ApiError> {
    let instance = admitted_instance(&state, &sku, &peer).await?;
    check_sku(&incident, &sku)?;

    let sender = state.client_sender(&peer)?;
    instance.add_incident(incident, sender).await?;
    Ok(ApiResponse { payload: () })
}

/// `PATCH /:sku/incident` — edit an incident. Behind-the-server revisions
/// are answered `stale`; everything else merges per field.
pub async fn edit(
    Extension(state): Extension<Arc<ServiceState>>,
    Extension(VerifiedPeer(peer)): Extension<VerifiedPeer>,
    Path(sku): Path<String>,
    Json(incident): Json<Envelope<Incident>>,
) -> Result<ApiResponse<()>, ApiError> {
    let instance = admitted_instance(&state, &sku, &peer).await?;
    check_sku(&incident, &sku)?;

    let sender = state.client_sender(&peer)?;
    instance.update_incident(incident, sender).await?;
    Ok(ApiResponse { payload: () })
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    pub id: String,
}

/// `DELETE /:sku/incident?id=<id>` — tombstone an incident. Idempotent.
pub async fn remove(
    Extension(state): Extension<Arc<ServiceState>>,
    Extension(VerifiedPeer(peer)): Extension<VerifiedPeer>,
    Path(sku): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<ApiResponse<()>, ApiError> {
    let instance = admitted_instance(&state, &sku, &peer).await?;

    let sender = state.client_sender(&peer)?;
    instance
        .remove_incident(IncidentId::from(query.id), sender)
        .await?;
    Ok(ApiResponse { payload: () })
}

/// `GET /:sku/get` — the full share-info payload, also used by clients as an
/// out-of-band force-sync.
pub async fn snapshot(
    Extension(state): Extension<Arc<ServiceState>>,
    Extension(VerifiedPeer(peer)): Extension<VerifiedPeer>,
    Path(sku): Path<String>,
) -> Result<ApiResponse<ShareInfo>, ApiError> {
    let instance = admitted_instance(&state, &sku, &peer).await?;
    Ok(ApiResponse {
        payload: instance.snapshot().await,
    })
}
