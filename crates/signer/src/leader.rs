use types::errors::SignerError;

use crate::sign_state::SignStateConsensus;

/// Capability the validator holds on the leader-election layer. Concrete
/// implementations identify validators by id and look them up through their
/// own registry; they never hold a reference back into the validator.
pub trait Leader: Send + Sync {
    /// Whether the validator owning this handle is the current leader.
    fn is_leader(&self) -> bool;

    /// Best-effort broadcast of a just-committed sign state to peer
    /// validators, so a new leader picks up the highest signed moment
    /// without double-signing.
    fn share_signed(&self, chain_id: &str, entry: &SignStateConsensus) -> Result<(), SignerError>;
}
