//! Error taxonomy shared by every oracle operation

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::chain::ChainError;
use crate::store::StoreError;

pub type OracleResult<T> = std::result::Result<T, OracleError>;

/// Root error type of the oracle core
#[derive(Error, Debug)]
pub enum OracleError {
    /// Malformed or unacceptable input, rejected before anything is persisted
    #[error("{0}")]
    Validation(String),

    /// A derived rate truncated to zero
    #[error("Invalid zero value from price calculation on key {0}")]
    ZeroRate(String),

    /// Nothing to compute from or nothing published yet
    #[error("{0}")]
    NoData(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Chain call failed: {0}")]
    Chain(#[from] ChainError),

    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Snapshot archive failed: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Signing failed: {0}")]
    Signing(String),
}

impl OracleError {
    pub fn validation(msg: impl Into<String>) -> Self {
        OracleError::Validation(msg.into())
    }

    pub fn no_data(msg: impl Into<String>) -> Self {
        OracleError::NoData(msg.into())
    }

    /// Whether the error originates outside the caller's request
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            OracleError::Chain(_)
                | OracleError::Store(_)
                | OracleError::Archive(_)
                | OracleError::Signing(_)
        )
    }
}
