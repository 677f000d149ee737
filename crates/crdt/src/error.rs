use matchlog_primitives::FieldError;
use thiserror::Error as ThisError;

/// Errors raised by the replicated data layer.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum CrdtError {
    /// A field name outside the record's mergeable field set.
    #[error("field {0} does not participate in merging")]
    NotMergeable(String),

    /// Two envelopes claiming the same id disagree on an immutable field.
    /// This is a precondition failure, not a conflict to resolve.
    #[error("immutable field {field} diverges between replicas")]
    ImmutableDivergence { field: String },

    #[error(transparent)]
    Field(#[from] FieldError),
}
