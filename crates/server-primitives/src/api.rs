//! JSON response envelope for every HTTP route.

use serde::{Deserialize, Serialize};

/// The closed set of machine-readable failure reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    BadRequest,
    BadSignature,
    IncorrectCode,
    ServerError,
    Stale,
    Forbidden,
}

/// `{success: true, data}` on the happy path, `{success: false, reason,
/// details?}` otherwise. Every JSON response uses this shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiEnvelope<T> {
    Success {
        success: True,
        data: T,
    },
    Failure {
        success: False,
        reason: ErrorReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

impl<T> ApiEnvelope<T> {
    pub fn success(data: T) -> Self {
        Self::Success {
            success: True,
            data,
        }
    }

    pub fn failure(reason: ErrorReason, details: Option<String>) -> Self {
        Self::Failure {
            success: False,
            reason,
            details,
        }
    }

    /// Unwrap into a `Result`, discarding the envelope.
    pub fn into_result(self) -> Result<T, (ErrorReason, Option<String>)> {
        match self {
            Self::Success { data, .. } => Ok(data),
            Self::Failure {
                reason, details, ..
            } => Err((reason, details)),
        }
    }
}

/// The literal `true`, so the envelope round-trips unambiguously.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct True;

/// The literal `false`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct False;

impl Serialize for True {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(true)
    }
}

impl<'de> Deserialize<'de> for True {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match bool::deserialize(deserializer)? {
            true => Ok(True),
            false => Err(serde::de::Error::custom("expected `true`")),
        }
    }
}

impl Serialize for False {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(false)
    }
}

impl<'de> Deserialize<'de> for False {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match bool::deserialize(deserializer)? {
            false => Ok(False),
            true => Err(serde::de::Error::custom("expected `false`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn success_wire_shape() {
        let envelope = ApiEnvelope::success(json!({"n": 1}));
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({"success": true, "data": {"n": 1}})
        );
    }

    #[test]
    fn failure_wire_shape() {
        let envelope: ApiEnvelope<()> =
            ApiEnvelope::failure(ErrorReason::Stale, Some("deleted".to_owned()));
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({"success": false, "reason": "stale", "details": "deleted"})
        );
    }

    #[test]
    fn round_trips_by_success_flag() {
        let parsed: ApiEnvelope<u32> =
            serde_json::from_value(json!({"success": true, "data": 7})).unwrap();
        assert_eq!(parsed.into_result().unwrap(), 7);

        let parsed: ApiEnvelope<u32> =
            serde_json::from_value(json!({"success": false, "reason": "forbidden"})).unwrap();
        assert_eq!(
            parsed.into_result().unwrap_err(),
            (ErrorReason::Forbidden, None)
        );
    }
}
