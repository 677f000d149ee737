use core::fmt;

use serde::{Deserialize, Serialize};

/// A peer's identity: the base64url encoding of its ECDSA P-256 public key
/// (uncompressed point, leading `0x04` stripped).
///
/// The encoded string is the identity — there is no separate account or
/// login. Ordering is lexicographic over the encoded form, which is what the
/// envelope merge uses to break ties deterministically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(encoded: String) -> Self {
        Self(encoded)
    }
}

/// A peer as other participants see it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
}
