use thiserror::Error;

use crate::consensus::{Hrs, Step};

/// Error taxonomy of the threshold signer. Double-sign protections
/// (`Regression`, `ConflictingData`) are fatal to the request; nonce and
/// cosigner failures are transient and the caller may retry.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("sign request for {got:?} is below highest signed {have:?}")]
    Regression { have: Hrs, got: Hrs },

    #[error(
        "conflicting data: already signed different bytes at height {height} round {round} step {step}"
    )]
    ConflictingData { height: i64, round: i64, step: Step },

    #[error("this validator is not the leader")]
    NotLeader,

    #[error("nonce cache is exhausted")]
    NonceExhausted,

    #[error("timed out waiting for a nonce set")]
    NonceTimeout,

    #[error("no nonces found for set {uuid}")]
    NonceNotFound { uuid: uuid::Uuid },

    #[error("cosigner {id} is unreachable")]
    CosignerUnreachable { id: u8 },

    #[error("cosigner {id} timed out")]
    CosignerTimeout { id: u8 },

    #[error("cosigner {id} refused: {reason}")]
    RemoteRefused { id: u8, reason: String },

    #[error("invalid response from cosigner {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("insufficient signature shares: got {got}, need {need}")]
    InsufficientShares { got: usize, need: usize },

    #[error("an attempt for the same voting moment did not resolve in time")]
    SameBlockInFlight,

    #[error("aggregated signature failed verification")]
    VerificationFailed,

    #[error("failed to persist sign state: {0}")]
    Persist(#[from] std::io::Error),

    #[error("failed to parse persisted state: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown cosigner {id}")]
    UnknownCosigner { id: u8 },

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SignerError {
    /// Whether the request may be retried as-is (nonce supply or cosigner
    /// availability problems) rather than being rejected for safety.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NonceExhausted
                | Self::NonceTimeout
                | Self::CosignerUnreachable { .. }
                | Self::CosignerTimeout { .. }
                | Self::InsufficientShares { .. }
        )
    }
}
