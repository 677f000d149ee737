//! Canonical request strings and signature verification.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use matchlog_primitives::PeerId;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::Signature;
use sha2::{Digest, Sha256};

use crate::{verifying_key_of, IdentityError, Keypair};

pub const SIGNATURE_HEADER: &str = "x-matchlog-signature";
pub const PEER_HEADER: &str = "x-matchlog-peer";
pub const DATE_HEADER: &str = "x-matchlog-date";
pub const SESSION_HEADER: &str = "x-matchlog-session";

/// The string a request signature covers:
///
/// ```text
/// METHOD \n PATH-WITH-QUERY \n ISO-8601-DATE \n base64url(SHA-256(body))
/// ```
///
/// A missing body hashes as the empty string. The date is the transmitted
/// header value verbatim — both sides hash the same bytes.
pub fn canonical_request(method: &str, path_and_query: &str, date: &str, body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!(
        "{}\n{}\n{}\n{}",
        method.to_uppercase(),
        path_and_query,
        date,
        URL_SAFE_NO_PAD.encode(digest)
    )
}

/// The signable path of a socket join URL: everything except the trailing
/// `signature` parameter, with both sides encoding the query identically.
pub fn socket_join_path(sku: &str, peer: &PeerId, name: &str, date: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("id", peer.as_str())
        .append_pair("name", name)
        .append_pair("date", date)
        .finish();

    format!("/api/{sku}/join?{query}")
}

/// The authentication material attached to a request, however transported
/// (HTTP headers or socket-URL query parameters).
#[derive(Clone, Debug)]
pub struct RequestSignature {
    pub peer: PeerId,
    pub signature: String,
    pub date: String,
}

impl RequestSignature {
    /// Sign a request with `keypair`, stamping it with the given date.
    pub fn create(
        keypair: &Keypair,
        method: &str,
        path_and_query: &str,
        date: DateTime<Utc>,
        body: &[u8],
    ) -> Self {
        let date = date.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let canonical = canonical_request(method, path_and_query, &date, body);

        Self {
            peer: keypair.peer_id(),
            signature: keypair.sign(canonical.as_bytes()),
            date,
        }
    }
}

/// Verify a request signature and enforce the skew window.
///
/// The declared public key is the identity; a valid signature proves the
/// request came from its holder. Dates further than `skew` from `now` in
/// either direction are rejected before any cryptography runs.
pub fn verify_request(
    signature: &RequestSignature,
    method: &str,
    path_and_query: &str,
    body: &[u8],
    now: DateTime<Utc>,
    skew: Duration,
) -> Result<(), IdentityError> {
    let signed_at = DateTime::parse_from_rfc3339(&signature.date)
        .map_err(|_| IdentityError::MalformedDate)?
        .with_timezone(&Utc);

    if (now - signed_at).abs() > skew {
        return Err(IdentityError::SkewExceeded);
    }

    let key = verifying_key_of(&signature.peer)?;

    let raw = URL_SAFE_NO_PAD
        .decode(&signature.signature)
        .map_err(|_| IdentityError::MalformedSignature)?;
    let parsed = Signature::from_slice(&raw).map_err(|_| IdentityError::MalformedSignature)?;

    let canonical = canonical_request(method, path_and_query, &signature.date, body);

    key.verify(canonical.as_bytes(), &parsed)
        .map_err(|_| IdentityError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skew() -> Duration {
        Duration::minutes(5)
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let keypair = Keypair::generate();
        let now = Utc::now();
        let body = br#"{"team":"1234A"}"#;

        let signature =
            RequestSignature::create(&keypair, "PUT", "/api/SKU123/incident", now, body);

        verify_request(&signature, "PUT", "/api/SKU123/incident", body, now, skew()).unwrap();
    }

    #[test]
    fn tampered_body_is_rejected() {
        let keypair = Keypair::generate();
        let now = Utc::now();

        let signature =
            RequestSignature::create(&keypair, "PUT", "/api/SKU123/incident", now, b"original");

        let err = verify_request(
            &signature,
            "PUT",
            "/api/SKU123/incident",
            b"tampered",
            now,
            skew(),
        )
        .unwrap_err();
        assert!(matches!(err, IdentityError::BadSignature));
    }

    #[test]
    fn different_path_is_rejected() {
        let keypair = Keypair::generate();
        let now = Utc::now();

        let signature = RequestSignature::create(&keypair, "GET", "/api/SKU123/get", now, b"");

        let err =
            verify_request(&signature, "GET", "/api/OTHER/get", b"", now, skew()).unwrap_err();
        assert!(matches!(err, IdentityError::BadSignature));
    }

    #[test]
    fn date_outside_skew_window_is_rejected() {
        let keypair = Keypair::generate();
        let signed_at = Utc::now();

        let signature = RequestSignature::create(&keypair, "GET", "/api/SKU123/get", signed_at, b"");

        let late = signed_at + Duration::minutes(6);
        let err = verify_request(&signature, "GET", "/api/SKU123/get", b"", late, skew()).unwrap_err();
        assert!(matches!(err, IdentityError::SkewExceeded));

        // Just inside the window still verifies.
        let close = signed_at + Duration::minutes(4);
        verify_request(&signature, "GET", "/api/SKU123/get", b"", close, skew()).unwrap();
    }

    #[test]
    fn signature_from_another_key_is_rejected() {
        let keypair = Keypair::generate();
        let imposter = Keypair::generate();
        let now = Utc::now();

        let mut signature = RequestSignature::create(&keypair, "GET", "/api/SKU123/get", now, b"");
        signature.peer = imposter.peer_id();

        let err = verify_request(&signature, "GET", "/api/SKU123/get", b"", now, skew()).unwrap_err();
        assert!(matches!(err, IdentityError::BadSignature));
    }
}
