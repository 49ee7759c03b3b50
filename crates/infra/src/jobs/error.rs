use std::time::Duration;

use fulfillment_core::DomainError;

use crate::gateways::GatewayError;
use crate::store::StoreError;

/// Why a job execution did not complete.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Inputs the job needs are missing or invalid; retrying cannot help.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),
}

impl JobError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }
}

impl From<DomainError> for JobError {
    fn from(err: DomainError) -> Self {
        Self::Precondition(err.to_string())
    }
}
