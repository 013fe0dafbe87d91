//! Error types for cluster specification handling

use thiserror::Error;

/// Errors raised while validating or interpreting a cluster specification
#[derive(Error, Debug)]
pub enum SpecError {
    /// The cluster document is inconsistent
    #[error("Invalid cluster: {0}")]
    Invalid(String),

    /// The cluster breaks its stored constraints
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// No procedure is defined for the machine type
    #[error("No repair procedure for machine type {machine_type:?}")]
    NoRepairProcedure { machine_type: String },

    /// The procedure of the machine type lacks the operation
    #[error("No repair operation {operation:?} for machine type {machine_type:?}")]
    NoRepairOperation {
        /// Machine type of the entry
        machine_type: String,
        /// Requested operation
        operation: String,
    },

    /// A resource key is not `Kind/name` or `Kind/namespace/name`
    #[error("Invalid resource key: {0}")]
    InvalidResourceKey(String),

    /// A resource definition cannot be interpreted
    #[error("Invalid resource definition: {0}")]
    InvalidResource(String),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for specification operations
pub type Result<T> = std::result::Result<T, SpecError>;
