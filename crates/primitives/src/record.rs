use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error as ThisError;

/// Field access errors raised by [`Record`] implementations.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum FieldError {
    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("invalid value for field {field}: {source}")]
    InvalidValue {
        field: String,
        source: serde_json::Error,
    },
}

/// A record type the consistency envelope can wrap.
///
/// The envelope tracks per-field metadata keyed by wire field name, so the
/// record has to expose its fields as JSON values. `FIELDS` lists the fields
/// that participate in merging; `IMMUTABLE` lists identity fields that never
/// merge and must agree byte-for-byte between any two envelopes claiming the
/// same id.
pub trait Record: Clone + std::fmt::Debug + Serialize + DeserializeOwned {
    /// Wire names of the fields that carry consistency metadata.
    const FIELDS: &'static [&'static str];

    /// Wire names of the identity fields excluded from merging.
    const IMMUTABLE: &'static [&'static str];

    /// Read a field as a JSON value. `None` for names outside
    /// `FIELDS ∪ IMMUTABLE`.
    fn field(&self, name: &str) -> Option<Value>;

    /// Overwrite a mutable field from a JSON value.
    fn set_field(&mut self, name: &str, value: Value) -> Result<(), FieldError>;
}

pub(crate) fn decode_field<T: DeserializeOwned>(field: &str, value: Value) -> Result<T, FieldError> {
    serde_json::from_value(value).map_err(|source| FieldError::InvalidValue {
        field: field.to_owned(),
        source,
    })
}
