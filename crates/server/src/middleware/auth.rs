//! Request-signature middleware.
//!
//! Every protected route carries the signing headers; this layer buffers the
//! body, recomputes the canonical request string, verifies the signature and
//! the skew window, and stashes the verified peer id in the request
//! extensions for handlers to pick up.

use std::convert::Infallible;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::Request;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::{Duration, Utc};
use futures_util::future::BoxFuture;
use matchlog_identity::{verify_request, RequestSignature, DATE_HEADER, PEER_HEADER, SIGNATURE_HEADER};
use matchlog_primitives::PeerId;
use tower::{Layer, Service};
use tracing::debug;

use crate::error::ApiError;

/// The peer a request was verified to come from. Inserted into request
/// extensions by [`AuthSignatureLayer`].
#[derive(Clone, Debug)]
pub struct VerifiedPeer(pub PeerId);

#[derive(Clone)]
pub struct AuthSignatureLayer {
    skew: Duration,
}

impl AuthSignatureLayer {
    pub fn new(skew: Duration) -> Self {
        Self { skew }
    }
}

impl<S> Layer<S> for AuthSignatureLayer {
    type Service = AuthSignatureMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthSignatureMiddleware {
            inner,
            skew: self.skew,
        }
    }
}

#[derive(Clone)]
pub struct AuthSignatureMiddleware<S> {
    inner: S,
    skew: Duration,
}

impl<S> Service<Request<Body>> for AuthSignatureMiddleware<S>
where
    S: Service<Request<Body>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // Take the service that was polled ready; leave the clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let skew = self.skew;

        Box::pin(async move {
            let signature = match extract_signature(request.headers()) {
                Ok(signature) => signature,
                Err(err) => return Ok(err.into_response()),
            };

            let (mut parts, body) = request.into_parts();

            let bytes = match axum::body::to_bytes(body, 1024 * 1024).await {
                Ok(bytes) => bytes,
                Err(_) => return Ok(ApiError::bad_request("unreadable body").into_response()),
            };

            let path_and_query = parts
                .uri
                .path_and_query()
                .map_or_else(|| parts.uri.path().to_owned(), ToString::to_string);

            if let Err(err) = verify_request(
                &signature,
                parts.method.as_str(),
                &path_and_query,
                &bytes,
                Utc::now(),
                skew,
            ) {
                debug!(peer = %signature.peer, %err, "request signature rejected");
                return Ok(ApiError::bad_signature().into_response());
            }

            let _ = parts.extensions.insert(VerifiedPeer(signature.peer));

            let request = Request::from_parts(parts, Body::from(bytes));
            inner.call(request).await
        })
    }
}

fn extract_signature(headers: &HeaderMap) -> Result<RequestSignature, ApiError> {
    let header = |name: &str| -> Result<String, ApiError> {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned)
            .ok_or_else(|| ApiError::bad_request(format!("missing {name} header")))
    };

    Ok(RequestSignature {
        peer: PeerId::new(header(PEER_HEADER)?),
        signature: header(SIGNATURE_HEADER)?,
        date: header(DATE_HEADER)?,
    })
}
