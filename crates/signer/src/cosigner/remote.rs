use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::warn;
use types::errors::SignerError;
use types::rpc::{NonceBatch, SignRequest, SignResponse};
use uuid::Uuid;

use crate::cosigner::Cosigner;

/// Transport-level failure, mapped by the proxy onto the caller-facing error
/// taxonomy.
#[derive(Debug)]
pub enum TransportError {
    /// The peer could not be reached at all.
    Unreachable(String),
    /// The peer answered with an application-level refusal.
    Refused(String),
    /// The peer answered with something that does not parse.
    Invalid(String),
}

/// The wire calls a cosigner exposes. The concrete transport (and its
/// authenticated channel) is a collaborator; anything that can move these
/// payloads and report [`TransportError`]s plugs in here.
#[async_trait::async_trait]
pub trait CosignerTransport: Send + Sync {
    async fn pub_key(&self, chain_id: &str) -> Result<Vec<u8>, TransportError>;
    async fn get_nonces(&self, uuids: &[Uuid]) -> Result<NonceBatch, TransportError>;
    async fn set_nonces_and_sign(&self, req: SignRequest) -> Result<SignResponse, TransportError>;
}

/// Client stub for a cosigner running in another process. Every call runs
/// under a deadline; failures are reported distinctly as unreachable,
/// timeout, refused, or invalid-response.
pub struct RemoteCosigner {
    id: u8,
    address: String,
    timeout: Duration,
    transport: Box<dyn CosignerTransport>,
}

impl RemoteCosigner {
    #[must_use]
    pub fn new(
        id: u8,
        address: String,
        call_timeout: Duration,
        transport: Box<dyn CosignerTransport>,
    ) -> Self {
        Self {
            id,
            address,
            timeout: call_timeout,
            transport,
        }
    }

    fn map_error(&self, error: TransportError) -> SignerError {
        match error {
            TransportError::Unreachable(reason) => {
                warn!(id = self.id, address = %self.address, reason = %reason, "cosigner unreachable");
                SignerError::CosignerUnreachable { id: self.id }
            }
            TransportError::Refused(reason) => SignerError::RemoteRefused {
                id: self.id,
                reason,
            },
            TransportError::Invalid(reason) => SignerError::InvalidResponse {
                id: self.id,
                reason,
            },
        }
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, SignerError> {
        match timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| self.map_error(e)),
            Err(_) => Err(SignerError::CosignerTimeout { id: self.id }),
        }
    }
}

#[async_trait::async_trait]
impl Cosigner for RemoteCosigner {
    fn id(&self) -> u8 {
        self.id
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    async fn pub_key(&self, chain_id: &str) -> Result<Vec<u8>, SignerError> {
        let pub_key = self.call(self.transport.pub_key(chain_id)).await?;
        if pub_key.len() != 32 {
            return Err(SignerError::InvalidResponse {
                id: self.id,
                reason: format!("public key has length {}", pub_key.len()),
            });
        }
        Ok(pub_key)
    }

    async fn get_nonces(&self, uuids: &[Uuid]) -> Result<NonceBatch, SignerError> {
        let batch = self.call(self.transport.get_nonces(uuids)).await?;
        if batch.batches.len() != uuids.len() {
            return Err(SignerError::InvalidResponse {
                id: self.id,
                reason: format!(
                    "requested {} nonce sets, got {}",
                    uuids.len(),
                    batch.batches.len()
                ),
            });
        }
        Ok(batch)
    }

    async fn set_nonces_and_sign(&self, req: SignRequest) -> Result<SignResponse, SignerError> {
        let response = self.call(self.transport.set_nonces_and_sign(req)).await?;
        if response.nonce_pub.len() != 32 {
            return Err(SignerError::InvalidResponse {
                id: self.id,
                reason: format!("nonce commitment has length {}", response.nonce_pub.len()),
            });
        }
        Ok(response)
    }

    async fn verify_signature(&self, chain_id: &str, payload: &[u8], signature: &[u8]) -> bool {
        match self.pub_key(chain_id).await {
            Ok(pub_key) => threshold_ed25519::verify(&pub_key, payload, signature),
            Err(_) => false,
        }
    }
}
