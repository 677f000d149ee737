//! Signed HTTP transport.
//!
//! Every request carries the signature headers; transient failures retry
//! with exponential backoff and jitter. Refusals come back as typed
//! [`ClientError`]s mapped from the wire envelope.

use std::time::Duration;

use chrono::Utc;
use matchlog_crdt::Envelope;
use matchlog_identity::{
    Keypair, RequestSignature, DATE_HEADER, PEER_HEADER, SESSION_HEADER, SIGNATURE_HEADER,
};
use matchlog_primitives::{Incident, IncidentId, Invitation, Peer, PeerId};
use matchlog_server_primitives::{ApiEnvelope, ShareInfo};
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::error::ClientError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_START_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 30_000;
const MAX_ATTEMPTS: u32 = 5;

/// Exponential backoff with ±20% jitter.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_START_MS
        .saturating_mul(1_u64 << attempt.min(16))
        .min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((base as f64 * jitter) as u64)
}

/// A signed HTTP connection to one matchlog server.
#[derive(Clone, Debug)]
pub struct Connection {
    base: Url,
    http: reqwest::Client,
    keypair: Keypair,
    /// Process-stable session id, for server-side rate limiting and log
    /// correlation.
    session: String,
}

impl Connection {
    pub fn new(base: Url, keypair: Keypair) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| ClientError::Network(err.to_string()))?;

        Ok(Self {
            base,
            http,
            keypair,
            session: Uuid::new_v4().to_string(),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    async fn send<T, B>(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<&B>,
    ) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let body = match body {
            Some(body) => {
                serde_json::to_vec(body).map_err(|err| ClientError::Malformed(err.to_string()))?
            }
            None => Vec::new(),
        };

        let mut attempt = 0;
        loop {
            match self.send_once(&method, path_and_query, &body).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    debug!(%path_and_query, %err, ?delay, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        method: &Method,
        path_and_query: &str,
        body: &[u8],
    ) -> Result<T, ClientError> {
        let url = self
            .base
            .join(path_and_query)
            .map_err(|err| ClientError::Malformed(err.to_string()))?;

        let signature = RequestSignature::create(
            &self.keypair,
            method.as_str(),
            path_and_query,
            Utc::now(),
            body,
        );

        let mut request = self
            .http
            .request(method.clone(), url)
            .header(SIGNATURE_HEADER, &signature.signature)
            .header(PEER_HEADER, signature.peer.as_str())
            .header(DATE_HEADER, &signature.date)
            .header(SESSION_HEADER, &self.session);

        if !body.is_empty() {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_vec());
        }

        let response = request
            .send()
            .await
            .map_err(|err| ClientError::Network(err.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ClientError::Network(err.to_string()))?;

        match serde_json::from_slice::<ApiEnvelope<T>>(&bytes) {
            Ok(envelope) => envelope
                .into_result()
                .map_err(|(reason, details)| ClientError::from_reason(reason, details)),
            Err(_) if status.is_server_error() => Err(ClientError::Server(status.to_string())),
            Err(err) => Err(ClientError::Malformed(err.to_string())),
        }
    }

    // ---- typed endpoints -------------------------------------------------

    pub async fn register_user(&self, name: &str) -> Result<Peer, ClientError> {
        #[derive(Serialize)]
        struct Body<'a> {
            name: &'a str,
        }
        self.send(Method::POST, "/api/user", Some(&Body { name }))
            .await
    }

    pub async fn create_instance(&self, sku: &str) -> Result<Invitation, ClientError> {
        self.send::<_, ()>(Method::POST, &format!("/api/{sku}/create"), None)
            .await
    }

    pub async fn invitation(&self, sku: &str) -> Result<Option<Invitation>, ClientError> {
        self.send::<_, ()>(Method::GET, &format!("/api/{sku}/invitation"), None)
            .await
    }

    pub async fn accept(&self, sku: &str, invitation: &str) -> Result<Invitation, ClientError> {
        self.send::<_, ()>(
            Method::PUT,
            &format!("/api/{sku}/accept?invitation={invitation}"),
            None,
        )
        .await
    }

    pub async fn invite(
        &self,
        sku: &str,
        user: &PeerId,
        admin: bool,
    ) -> Result<Invitation, ClientError> {
        self.send::<_, ()>(
            Method::PUT,
            &format!("/api/{sku}/invite?user={user}&admin={admin}"),
            None,
        )
        .await
    }

    pub async fn revoke(&self, sku: &str, user: &PeerId) -> Result<(), ClientError> {
        self.send::<_, ()>(Method::DELETE, &format!("/api/{sku}/invite?user={user}"), None)
            .await
    }

    pub async fn request_code(&self, sku: &str) -> Result<String, ClientError> {
        #[derive(Deserialize)]
        struct CodeResponse {
            code: String,
        }
        let response: CodeResponse = self
            .send::<_, ()>(Method::PUT, &format!("/api/{sku}/request"), None)
            .await?;
        Ok(response.code)
    }

    pub async fn resolve_code(&self, sku: &str, code: &str) -> Result<PeerId, ClientError> {
        #[derive(Deserialize)]
        struct ResolveResponse {
            user: PeerId,
        }
        let response: ResolveResponse = self
            .send::<_, ()>(Method::GET, &format!("/api/{sku}/request?code={code}"), None)
            .await?;
        Ok(response.user)
    }

    pub async fn put_incident(
        &self,
        sku: &str,
        incident: &Envelope<Incident>,
    ) -> Result<(), ClientError> {
        self.send(Method::PUT, &format!("/api/{sku}/incident"), Some(incident))
            .await
    }

    pub async fn patch_incident(
        &self,
        sku: &str,
        incident: &Envelope<Incident>,
    ) -> Result<(), ClientError> {
        self.send(Method::PATCH, &format!("/api/{sku}/incident"), Some(incident))
            .await
    }

    pub async fn delete_incident(&self, sku: &str, id: &IncidentId) -> Result<(), ClientError> {
        self.send::<_, ()>(Method::DELETE, &format!("/api/{sku}/incident?id={id}"), None)
            .await
    }

    /// Out-of-band snapshot fetch, used by force-sync.
    pub async fn snapshot(&self, sku: &str) -> Result<ShareInfo, ClientError> {
        self.send::<_, ()>(Method::GET, &format!("/api/{sku}/get"), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps_within_jitter() {
        for attempt in 0..12_u32 {
            let delay = backoff_delay(attempt).as_millis() as u64;
            let nominal = BACKOFF_START_MS
                .saturating_mul(1 << attempt.min(16))
                .min(BACKOFF_CAP_MS);
            assert!(delay >= nominal * 8 / 10, "attempt {attempt}: {delay}");
            assert!(delay <= nominal * 12 / 10, "attempt {attempt}: {delay}");
        }
    }
}
