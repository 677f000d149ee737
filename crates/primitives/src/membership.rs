use core::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::peer::PeerId;

/// Invitation identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvitationId(String);

impl InvitationId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvitationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for InvitationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Admission to an event instance, granted by an admin and consumed exactly
/// once by the invited peer.
///
/// `instance_secret` is populated only in responses to the invitee once the
/// invitation is accepted; pending records omit it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub id: InvitationId,
    pub sku: String,
    pub from: PeerId,
    pub to: PeerId,
    pub admin: bool,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_secret: Option<String>,
}

impl Invitation {
    /// The accepted self-invitation returned from instance creation.
    pub fn for_creator(sku: impl Into<String>, creator: PeerId, secret: String) -> Self {
        Self {
            id: InvitationId::random(),
            sku: sku.into(),
            from: creator.clone(),
            to: creator,
            admin: true,
            accepted: true,
            instance_secret: Some(secret),
        }
    }

    /// A pending view safe to hand to the invitee before acceptance.
    pub fn pending_view(&self) -> Self {
        Self {
            instance_secret: None,
            ..self.clone()
        }
    }
}
