use std::sync::Arc;

use signer::{Cosigner, LocalCosigner};
use types::errors::SignerError;
use types::rpc::{NonceBatch, SignRequest, SignResponse};
use uuid::Uuid;

/// Wraps a real cosigner but corrupts its partial signature, mimicking a
/// faulty or malicious cosigner (or one torn down mid-response). The inner
/// cosigner still signs and commits its own state.
pub struct FaultyCosigner {
    inner: Arc<LocalCosigner>,
}

impl FaultyCosigner {
    pub fn new(inner: Arc<LocalCosigner>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl Cosigner for FaultyCosigner {
    fn id(&self) -> u8 {
        self.inner.id()
    }

    fn address(&self) -> String {
        self.inner.address()
    }

    async fn pub_key(&self, chain_id: &str) -> Result<Vec<u8>, SignerError> {
        self.inner.pub_key(chain_id).await
    }

    async fn get_nonces(&self, uuids: &[Uuid]) -> Result<NonceBatch, SignerError> {
        self.inner.get_nonces(uuids).await
    }

    async fn set_nonces_and_sign(&self, req: SignRequest) -> Result<SignResponse, SignerError> {
        let mut response = self.inner.set_nonces_and_sign(req).await?;
        response.signature = vec![0u8; 32];
        Ok(response)
    }

    async fn verify_signature(&self, chain_id: &str, payload: &[u8], signature: &[u8]) -> bool {
        self.inner.verify_signature(chain_id, payload, signature).await
    }
}
