//! 快照记录错误定义

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field `{field}` in {class} record")]
    MissingField { class: String, field: String },

    #[error("Field `{field}` in {class} record is not {expected}")]
    WrongType {
        class: String,
        field: String,
        expected: &'static str,
    },

    #[error("Expected {expected} record, found {found}")]
    ClassMismatch { expected: String, found: String },

    #[error("Unsupported {class} record version {found} (supported up to {supported})")]
    UnsupportedVersion {
        class: String,
        found: u32,
        supported: u32,
    },

    #[error("Invalid value for `{field}` in {class} record: {reason}")]
    InvalidValue {
        class: String,
        field: String,
        reason: String,
    },
}
