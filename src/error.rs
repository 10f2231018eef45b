use crate::schema::FunderId;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FundingError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Invalid input for {field}: {details}")]
    InvalidInput { field: String, details: String },

    #[error("Envelope for funder {funder_id} was modified concurrently; retry the update")]
    TransientStorageConflict { funder_id: FunderId },

    #[error("Allocation mismatch in {year}: allocated {allocated} vs expected {expected} (tolerance {tolerance})")]
    AllocationMismatch {
        year: i32,
        allocated: Decimal,
        expected: Decimal,
        tolerance: Decimal,
    },

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl FundingError {
    pub fn invalid_input(field: impl Into<String>, details: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            details: details.into(),
        }
    }

    /// A "no data" outcome the caller can recover from.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether retrying the whole operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStorageConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, FundingError>;
