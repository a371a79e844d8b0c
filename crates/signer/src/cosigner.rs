use types::errors::SignerError;
use types::rpc::{NonceBatch, SignRequest, SignResponse};
use uuid::Uuid;

pub mod local;
pub mod remote;

/// The capability set every cosigner offers, whether it lives in this
/// process or behind the cosigner transport. The threshold validator only
/// ever talks to this trait.
#[async_trait::async_trait]
pub trait Cosigner: Send + Sync {
    /// 1-based shard identity.
    fn id(&self) -> u8;

    /// Transport address peers dial; empty for in-process cosigners.
    fn address(&self) -> String;

    /// The aggregate Ed25519 public key for a chain (identical across all
    /// cosigners of that chain).
    async fn pub_key(&self, chain_id: &str) -> Result<Vec<u8>, SignerError>;

    /// Deal fresh nonces for each requested ceremony identifier, returning
    /// every other cosigner's share encrypted to it.
    async fn get_nonces(&self, uuids: &[Uuid]) -> Result<NonceBatch, SignerError>;

    /// Install peer nonce shares for a ceremony and produce this cosigner's
    /// partial signature(s).
    async fn set_nonces_and_sign(&self, req: SignRequest) -> Result<SignResponse, SignerError>;

    /// Verify a full signature against the chain's aggregate public key.
    async fn verify_signature(&self, chain_id: &str, payload: &[u8], signature: &[u8]) -> bool;
}
