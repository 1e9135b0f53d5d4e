// src/error.rs
//! Error taxonomy for the database engine.

use thiserror::Error;

/// All errors surfaced by the public API.
#[derive(Error, Debug)]
pub enum DbError {
    /// Document or query failed structural validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// A unique index rejected an insert or update.
    #[error("unique constraint violated for index on field `{field_name}`, key {key}")]
    UniqueViolation { field_name: String, key: String },

    /// Unknown or misused comparison operator in a query.
    #[error("invalid query operator: {0}")]
    InvalidQueryOperator(String),

    /// Unknown or misused modifier in an update spec.
    #[error("invalid update operator: {0}")]
    InvalidUpdateOperator(String),

    /// Positional array update (`.$.`) could not be resolved.
    #[error("positional update error: {0}")]
    PositionalUpdate(String),

    /// Serialization hooks do not round-trip.
    #[error("beforeDeserialization is not the reverse of afterSerialization, cautiously refusing to start to prevent dataloss")]
    HookAsymmetry,

    /// Only one side of the serialization hook pair was supplied.
    #[error("hook configuration error: {0}")]
    HookConfiguration(String),

    /// Too many unreadable lines in the datafile.
    #[error("more than {percent}% of the data file is corrupt, the wrong beforeDeserialization hook may be used, cautiously refusing to start ({corrupt} of {total} lines)", percent = (threshold * 100.0).floor())]
    CorruptionThreshold {
        corrupt: usize,
        total: usize,
        threshold: f64,
    },

    /// Persistent collection configured without a storage adapter.
    #[error("a filename was given but no storage adapter is available")]
    StorageAdapterMissing,

    /// Malformed pipeline or stage input.
    #[error("aggregation error: {0}")]
    Aggregation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_message_mentions_threshold_and_counts() {
        let err = DbError::CorruptionThreshold {
            corrupt: 3,
            total: 10,
            threshold: 0.1,
        };
        let msg = err.to_string();
        assert!(msg.contains("10%"), "{msg}");
        assert!(msg.contains("3 of 10"), "{msg}");
    }

    #[test]
    fn test_unique_violation_names_field() {
        let err = DbError::UniqueViolation {
            field_name: "email".into(),
            key: "\"a@b.c\"".into(),
        };
        assert!(err.to_string().contains("`email`"));
    }
}
