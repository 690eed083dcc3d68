use thiserror::Error;

use crate::auth::AuthError;
use crate::backend::BackendError;
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::operation::{ConsensusPosition, OperationError, OperationKind};
use crate::watermark::WatermarkError;

/// How a failure should be reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request; retrying the same request cannot succeed
    Validation,
    Authentication,
    /// Stale or duplicate position, rejected before signing
    PolicyViolation,
    /// Lost the watermark race after signing; the signature was discarded
    ConcurrencyConflict,
    /// Oracle or store failure; safe to retry, no watermark moved
    Transient,
    NotFound,
    MethodNotAllowed,
}

impl ErrorKind {
    pub const fn status_code(self) -> u16 {
        match self {
            Self::Validation | Self::PolicyViolation | Self::ConcurrencyConflict => 400,
            Self::Authentication => 401,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::Transient => 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("No message to sign in the request body")]
    MissingBody,

    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("High Watermark Violation")]
    HighWatermarkViolation {
        kind: OperationKind,
        requested: ConsensusPosition,
        current: ConsensusPosition,
    },

    #[error("High Watermark Mutual Exclusion Violation")]
    MutualExclusionViolation {
        kind: OperationKind,
        position: ConsensusPosition,
    },

    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Not Found")]
    NotFound,

    #[error("Method Not Allowed")]
    MethodNotAllowed,
}

impl SignerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingBody | Self::InvalidBody(_) | Self::Codec(_) | Self::Operation(_) => {
                ErrorKind::Validation
            }
            Self::Auth(_) => ErrorKind::Authentication,
            Self::HighWatermarkViolation { .. } => ErrorKind::PolicyViolation,
            Self::MutualExclusionViolation { .. } => ErrorKind::ConcurrencyConflict,
            Self::Watermark(WatermarkError::ConcurrencyConflict { .. }) => {
                ErrorKind::ConcurrencyConflict
            }
            Self::Watermark(_) | Self::Backend(_) | Self::Timeout(_) | Self::Config(_) => {
                ErrorKind::Transient
            }
            Self::NotFound => ErrorKind::NotFound,
            Self::MethodNotAllowed => ErrorKind::MethodNotAllowed,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }
}

pub type Result<T> = std::result::Result<T, SignerError>;
