use matchlog_crdt::CrdtError;
use matchlog_identity::IdentityError;
use matchlog_server_primitives::ErrorReason;
use matchlog_store::StoreError;
use thiserror::Error as ThisError;

/// Client-side failure taxonomy. Everything below the mutation API is
/// recoverable; the UI only ever hears about these asynchronously.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum ClientError {
    /// Transient network trouble: retried with backoff.
    #[error("network error: {0}")]
    Network(String),

    /// The server holds a newer revision. Treated as success plus a
    /// force-sync.
    #[error("write was stale")]
    Stale,

    /// The target id is tombstoned. The write is dropped.
    #[error("incident was deleted")]
    Tombstoned,

    /// Signature rejected — clock skew or a revoked key.
    #[error("request signature rejected")]
    BadSignature,

    /// No longer admitted to the instance.
    #[error("not admitted to this event")]
    Forbidden,

    /// Non-retryable payload problem.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Server-side failure, worth a generic retry.
    #[error("server error: {0}")]
    Server(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crdt(#[from] CrdtError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl ClientError {
    /// Map a wire refusal onto the taxonomy.
    pub fn from_reason(reason: ErrorReason, details: Option<String>) -> Self {
        match reason {
            ErrorReason::Stale => match details.as_deref() {
                Some("deleted") => Self::Tombstoned,
                _ => Self::Stale,
            },
            ErrorReason::BadSignature => Self::BadSignature,
            ErrorReason::Forbidden => Self::Forbidden,
            ErrorReason::BadRequest | ErrorReason::IncorrectCode => {
                Self::Malformed(details.unwrap_or_default())
            }
            ErrorReason::ServerError => Self::Server(details.unwrap_or_default()),
        }
    }

    /// Whether a retry with backoff can help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Server(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_with_deleted_detail_is_tombstoned() {
        let err = ClientError::from_reason(ErrorReason::Stale, Some("deleted".to_owned()));
        assert!(matches!(err, ClientError::Tombstoned));

        let err = ClientError::from_reason(ErrorReason::Stale, None);
        assert!(matches!(err, ClientError::Stale));
    }

    #[test]
    fn transience() {
        assert!(ClientError::Network("dns".to_owned()).is_transient());
        assert!(ClientError::Server("storage".to_owned()).is_transient());
        assert!(!ClientError::Forbidden.is_transient());
        assert!(!ClientError::Tombstoned.is_transient());
    }
}
