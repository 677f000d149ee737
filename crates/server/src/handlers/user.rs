use std::sync::Arc;

use axum::{Extension, Json};
use matchlog_primitives::Peer;
use serde::Deserialize;

use crate::error::{ApiError, ApiResponse};
use crate::middleware::auth::VerifiedPeer;
use crate::ServiceState;

#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    pub name: String,
}

/// Register or update the display name attached to the caller's public key.
pub async fn register(
    Extension(state): Extension<Arc<ServiceState>>,
    Extension(VerifiedPeer(peer)): Extension<VerifiedPeer>,
    Json(request): Json<RegisterUserRequest>,
) -> Result<ApiResponse<Peer>, ApiError> {
    state.set_display_name(&peer, &request.name)?;

    Ok(ApiResponse {
        payload: Peer {
            id: peer,
            name: request.name,
        },
    })
}
