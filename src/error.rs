//! Error types for the tub datastore.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tub datastore.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A datastore was reopened with a schema that disagrees with the stored one
    #[error(
        "Schema mismatch: trying to open a datastore with different inputs/types than the stored \
         datastore. New inputs: {inputs:?} vs stored inputs: {stored_inputs:?}, new types: \
         {types:?} vs stored types: {stored_types:?}"
    )]
    SchemaMismatch {
        inputs: Vec<String>,
        types: Vec<String>,
        stored_inputs: Vec<String>,
        stored_types: Vec<String>,
    },

    /// Datastore directory has no manifest
    #[error("Datastore not found: {path}")]
    DatastoreNotFound { path: String },

    /// Mutation attempted on a file or datastore opened read-only
    #[error("Read-only: {path}")]
    ReadOnly { path: String },

    /// Malformed or inconsistent `manifest.json`
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Malformed or inconsistent segment or segment manifest
    #[error("Segment error: {0}")]
    Segment(String),

    /// Record cannot be encoded (non-finite floats, non-object records)
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] Box<serde_json::Error>),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a manifest error.
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest(message.into())
    }

    /// Create a segment error.
    pub fn segment(message: impl Into<String>) -> Self {
        Self::Segment(message.into())
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn read_only(path: &std::path::Path) -> Self {
        Self::ReadOnly {
            path: path.display().to_string(),
        }
    }

    /// Stable short code for the error category, used in logs and by the CLI.
    pub const fn category_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::DatastoreNotFound { .. } => "not_found",
            Self::ReadOnly { .. } => "read_only",
            Self::Manifest(_) => "manifest",
            Self::Segment(_) => "segment",
            Self::Serialization(_) => "serialization",
            Self::Validation(_) => "validation",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Box::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Box::new(value))
    }
}
