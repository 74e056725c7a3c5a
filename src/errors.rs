//! Typed errors for the decision engine.
//!
//! Library code returns these where a caller may want to match on the cause;
//! application paths wrap them with `anyhow::Context`.

use thiserror::Error;

/// Engine-level failures.
#[derive(Error, Debug)]
pub enum EngineError {
    // -- Configuration ------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),

    // -- Storage ------------------------------------------------------------
    #[error("stored value for {column} could not be decoded: {value}")]
    Decode { column: &'static str, value: String },

    // -- Collaborators ------------------------------------------------------
    #[error("{source_name} returned status {status}: {body}")]
    Upstream {
        source_name: &'static str,
        status: u16,
        body: String,
    },
}

/// A single unusable field in an exchange position update.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    #[error("field {field} is not numeric: {raw}")]
    NotNumeric { field: &'static str, raw: String },

    #[error("field {field} must not be negative: {raw}")]
    Negative { field: &'static str, raw: String },

    #[error("field {field} has unknown value: {raw}")]
    Unknown { field: &'static str, raw: String },

    #[error("size {size} reported without a side")]
    MissingSide { size: String },
}
