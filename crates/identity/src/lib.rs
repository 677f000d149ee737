//! Peer identity and request authentication.
//!
//! Every peer owns a long-lived ECDSA P-256 keypair. The public key, encoded
//! base64url without the SEC1 `0x04` prefix, *is* the peer's identity — there
//! are no accounts and no passwords. Requests are authenticated by signing a
//! canonical string derived from the request; verification recomputes the
//! string and checks the signature against the declared key, rejecting dates
//! outside the skew window.

pub mod signing;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use matchlog_primitives::PeerId;
use matchlog_store::{Store, StoreError};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error as ThisError;

pub use signing::{
    canonical_request, socket_join_path, verify_request, RequestSignature, DATE_HEADER,
    PEER_HEADER, SESSION_HEADER, SIGNATURE_HEADER,
};

/// Store key the device keypair persists under.
const KEYPAIR_STORE_KEY: &str = "identity:keypair";

/// Errors raised by identity handling and signature verification.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum IdentityError {
    #[error("malformed public key")]
    MalformedKey,

    #[error("malformed signature")]
    MalformedSignature,

    #[error("malformed signing date")]
    MalformedDate,

    #[error("signature does not match the declared key")]
    BadSignature,

    #[error("signing date outside the accepted skew window")]
    SkewExceeded,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A peer's long-lived signing keypair.
#[derive(Clone)]
pub struct Keypair {
    key: SigningKey,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret never leaves the device, including via logs.
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

impl Keypair {
    /// Generate a fresh keypair from the system RNG.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// Load the device keypair from the store, generating and persisting one
    /// on first run.
    pub fn load_or_generate(store: &Store) -> Result<Self, IdentityError> {
        if let Some(encoded) = store.get::<String>(KEYPAIR_STORE_KEY)? {
            let raw = URL_SAFE_NO_PAD
                .decode(encoded)
                .map_err(|_| IdentityError::MalformedKey)?;
            let key = SigningKey::from_slice(&raw).map_err(|_| IdentityError::MalformedKey)?;
            return Ok(Self { key });
        }

        let keypair = Self::generate();
        let encoded = URL_SAFE_NO_PAD.encode(keypair.key.to_bytes());
        store.set(KEYPAIR_STORE_KEY, &encoded)?;

        Ok(keypair)
    }

    /// This keypair's public identity.
    pub fn peer_id(&self) -> PeerId {
        peer_id_of(self.key.verifying_key())
    }

    /// Sign `message` (P-256 + SHA-256), returning the raw `r||s` signature
    /// base64url-encoded.
    pub fn sign(&self, message: &[u8]) -> String {
        let signature: Signature = self.key.sign(message);
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    }
}

/// Encode a verifying key as a peer id: base64url of the uncompressed SEC1
/// point with the leading `0x04` stripped.
pub fn peer_id_of(key: &VerifyingKey) -> PeerId {
    let point = key.to_encoded_point(false);
    PeerId::new(URL_SAFE_NO_PAD.encode(&point.as_bytes()[1..]))
}

/// Decode a peer id back into a verifying key.
pub fn verifying_key_of(peer: &PeerId) -> Result<VerifyingKey, IdentityError> {
    let raw = URL_SAFE_NO_PAD
        .decode(peer.as_str())
        .map_err(|_| IdentityError::MalformedKey)?;

    let mut sec1 = Vec::with_capacity(raw.len() + 1);
    sec1.push(0x04);
    sec1.extend_from_slice(&raw);

    VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| IdentityError::MalformedKey)
}
