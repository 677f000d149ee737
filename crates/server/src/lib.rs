//! The matchlog server: per-event authoritative instances behind an HTTP
//! mutation surface and a bidirectional socket with live fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::Method;
use axum::routing::{get, post, put};
use axum::{Extension, Router};
use eyre::Result as EyreResult;
use matchlog_primitives::{Invitation, PeerId};
use matchlog_store::Store;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub mod config;
pub mod error;
pub mod handlers;
pub mod instance;
pub mod middleware;
pub mod ws;

#[cfg(test)]
mod tests;

use config::ServerConfig;
use error::ApiError;
use instance::EventInstance;
use middleware::auth::AuthSignatureLayer;

/// Shared service state: the store, the config, and the live instances.
pub struct ServiceState {
    pub config: ServerConfig,
    pub store: Store,
    instances: RwLock<HashMap<String, Arc<EventInstance>>>,
}

impl ServiceState {
    pub fn new(config: ServerConfig, store: Store) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            instances: RwLock::new(HashMap::new()),
        })
    }

    /// Fetch the live instance for `sku`, rehydrating a persisted one if the
    /// process restarted since it was created.
    pub async fn instance(self: &Arc<Self>, sku: &str) -> Result<Arc<EventInstance>, ApiError> {
        if let Some(instance) = self.instances.read().await.get(sku) {
            instance.touch();
            return Ok(instance.clone());
        }

        let mut instances = self.instances.write().await;
        // Raced another loader while upgrading the lock.
        if let Some(instance) = instances.get(sku) {
            instance.touch();
            return Ok(instance.clone());
        }

        let Some(instance) = EventInstance::load(sku, self.store.clone())? else {
            return Err(ApiError::bad_request("no such event instance"));
        };
        let instance = Arc::new(instance);
        instance.spawn_idle_watch(self.config.idle_eviction(), Arc::downgrade(self));
        let _ = instances.insert(sku.to_owned(), instance.clone());

        Ok(instance)
    }

    /// Create the instance for `sku` with `creator` as sole admin. Calling
    /// again as an existing admin returns the standing accepted invitation;
    /// anyone else is refused.
    pub async fn create_instance(
        self: &Arc<Self>,
        sku: &str,
        creator: &PeerId,
    ) -> Result<Invitation, ApiError> {
        let mut instances = self.instances.write().await;

        let existing = match instances.get(sku) {
            Some(instance) => Some(instance.clone()),
            None => EventInstance::load(sku, self.store.clone())?.map(Arc::new),
        };
        if let Some(existing) = existing {
            if !instances.contains_key(sku) {
                existing.spawn_idle_watch(self.config.idle_eviction(), Arc::downgrade(self));
                let _ = instances.insert(sku.to_owned(), existing.clone());
            }
            if existing.is_admin(creator).await {
                return existing
                    .invitation_for(creator)
                    .await
                    .ok_or_else(|| ApiError::server_error("admin without invitation record"));
            }
            return Err(ApiError::forbidden());
        }

        let (instance, invitation) = EventInstance::create(sku, self.store.clone(), creator)?;
        let instance = Arc::new(instance);
        instance.spawn_idle_watch(self.config.idle_eviction(), Arc::downgrade(self));
        let _ = instances.insert(sku.to_owned(), instance);

        Ok(invitation)
    }

    /// Drop an instance and its durable record. Fired by the idle alarm.
    pub async fn evict_instance(&self, sku: &str) {
        let removed = self.instances.write().await.remove(sku);
        if let Some(instance) = removed {
            if let Err(err) = instance.wipe() {
                tracing::warn!(%sku, %err, "failed to wipe evicted instance");
            }
        }
    }

    pub fn display_name(&self, peer: &PeerId) -> Result<String, ApiError> {
        Ok(self
            .store
            .get::<String>(&format!("user:{peer}"))?
            .unwrap_or_default())
    }

    pub fn set_display_name(&self, peer: &PeerId, name: &str) -> Result<(), ApiError> {
        self.store.set(&format!("user:{peer}"), &name)?;
        Ok(())
    }

    pub(crate) fn client_sender(
        &self,
        peer: &PeerId,
    ) -> Result<matchlog_server_primitives::FrameSender, ApiError> {
        Ok(matchlog_server_primitives::FrameSender::Client {
            id: peer.clone(),
            name: self.display_name(peer)?,
        })
    }
}

/// Assemble the full `/api` router.
pub fn app(state: Arc<ServiceState>) -> Router {
    let signed = Router::new()
        .route("/user", post(handlers::user::register))
        .route("/:sku/create", post(handlers::membership::create))
        .route("/:sku/invitation", get(handlers::membership::invitation))
        .route("/:sku/accept", put(handlers::membership::accept))
        .route(
            "/:sku/invite",
            put(handlers::membership::invite).delete(handlers::membership::revoke),
        )
        .route(
            "/:sku/request",
            put(handlers::membership::request_code).get(handlers::membership::resolve_code),
        )
        .route(
            "/:sku/incident",
            put(handlers::incidents::add)
                .patch(handlers::incidents::edit)
                .delete(handlers::incidents::remove),
        )
        .route("/:sku/get", get(handlers::incidents::snapshot))
        .layer(AuthSignatureLayer::new(state.config.signature_skew()));

    // The socket handshake authenticates through query parameters and the
    // exports are public, so neither goes through the header middleware.
    let public = Router::new()
        .route("/:sku/join", get(ws::join))
        .route("/:sku/csv", get(handlers::export::csv))
        .route("/:sku/json", get(handlers::export::json));

    Router::new()
        .nest("/api", signed.merge(public))
        .layer(Extension(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods([
                    Method::POST,
                    Method::GET,
                    Method::DELETE,
                    Method::PUT,
                    Method::PATCH,
                    Method::OPTIONS,
                ]),
        )
}

/// Bind and serve until the process is stopped.
pub async fn start(config: ServerConfig, store: Store) -> EyreResult<()> {
    let state = ServiceState::new(config, store);
    let router = app(state);

    let listener = TcpListener::bind(config.listen).await?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router).await?;

    Ok(())
}
