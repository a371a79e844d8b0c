use std::sync::Arc;
use std::time::Duration;

use signer::{Cosigner, CosignerTransport, LocalCosigner, RemoteCosigner, ThresholdValidator, TransportError};
use types::consensus::{proposal_to_block, Proposal};
use types::errors::SignerError;
use types::rpc::{NonceBatch, SignRequest, SignResponse};
use uuid::Uuid;

use crate::mocks::cluster::{TestCluster, TEST_CHAIN_ID};
use crate::mocks::leader::MockLeader;

/// How an in-process stand-in transport behaves before delegating to the
/// wrapped cosigner.
#[derive(Clone, Copy)]
enum Behavior {
    Healthy,
    Unreachable,
    Refusing,
    Garbling,
    Slow(Duration),
}

struct LoopbackTransport {
    inner: Arc<LocalCosigner>,
    behavior: Behavior,
}

impl LoopbackTransport {
    fn boxed(inner: &Arc<LocalCosigner>, behavior: Behavior) -> Box<dyn CosignerTransport> {
        Box::new(Self {
            inner: Arc::clone(inner),
            behavior,
        })
    }

    async fn gate(&self) -> Result<(), TransportError> {
        match self.behavior {
            Behavior::Healthy | Behavior::Garbling => Ok(()),
            Behavior::Unreachable => Err(TransportError::Unreachable(
                "connection refused".to_string(),
            )),
            Behavior::Refusing => Err(TransportError::Refused("maintenance".to_string())),
            Behavior::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl CosignerTransport for LoopbackTransport {
    async fn pub_key(&self, chain_id: &str) -> Result<Vec<u8>, TransportError> {
        self.gate().await?;
        if matches!(self.behavior, Behavior::Garbling) {
            return Ok(vec![0u8; 16]);
        }
        self.inner
            .pub_key(chain_id)
            .await
            .map_err(|e| TransportError::Refused(e.to_string()))
    }

    async fn get_nonces(&self, uuids: &[Uuid]) -> Result<NonceBatch, TransportError> {
        self.gate().await?;
        self.inner
            .get_nonces(uuids)
            .await
            .map_err(|e| TransportError::Refused(e.to_string()))
    }

    async fn set_nonces_and_sign(&self, req: SignRequest) -> Result<SignResponse, TransportError> {
        self.gate().await?;
        self.inner
            .set_nonces_and_sign(req)
            .await
            .map_err(|e| TransportError::Refused(e.to_string()))
    }
}

#[tokio::test]
async fn signing_works_through_remote_proxies() {
    let cluster = TestCluster::new(2, 3);
    let peers: Vec<Arc<dyn Cosigner>> = (1..3)
        .map(|i| {
            Arc::new(RemoteCosigner::new(
                i as u8 + 1,
                format!("tcp://cosigner-{}:2222", i + 1),
                Duration::from_secs(1),
                LoopbackTransport::boxed(&cluster.cosigners[i], Behavior::Healthy),
            )) as Arc<dyn Cosigner>
        })
        .collect();

    let leader = Arc::new(MockLeader::fixed(1));
    let validator = ThresholdValidator::new(
        cluster.cosigners[0].config().clone(),
        2,
        Duration::from_secs(1),
        Arc::clone(&cluster.cosigners[0]),
        peers,
        leader,
    );

    let block = proposal_to_block(
        TEST_CHAIN_ID,
        &Proposal {
            height: 1,
            round: 0,
            ..Proposal::default()
        },
    )
    .unwrap();
    let signed = validator.sign(TEST_CHAIN_ID, block.clone()).await.unwrap();
    assert!(threshold_ed25519::verify(
        &cluster.pub_key,
        &block.sign_bytes,
        &signed.signature
    ));
    validator.stop();
}

#[tokio::test]
async fn transport_failures_map_to_distinct_errors() {
    let cluster = TestCluster::new(2, 2);
    let call_timeout = Duration::from_millis(50);

    let unreachable = RemoteCosigner::new(
        2,
        String::new(),
        call_timeout,
        LoopbackTransport::boxed(&cluster.cosigners[1], Behavior::Unreachable),
    );
    let err = unreachable.pub_key(TEST_CHAIN_ID).await.unwrap_err();
    assert!(matches!(err, SignerError::CosignerUnreachable { id: 2 }), "{err}");

    let refusing = RemoteCosigner::new(
        2,
        String::new(),
        call_timeout,
        LoopbackTransport::boxed(&cluster.cosigners[1], Behavior::Refusing),
    );
    let err = refusing.get_nonces(&[Uuid::new_v4()]).await.unwrap_err();
    assert!(matches!(err, SignerError::RemoteRefused { id: 2, .. }), "{err}");

    let slow = RemoteCosigner::new(
        2,
        String::new(),
        call_timeout,
        LoopbackTransport::boxed(&cluster.cosigners[1], Behavior::Slow(Duration::from_secs(5))),
    );
    let err = slow.pub_key(TEST_CHAIN_ID).await.unwrap_err();
    assert!(matches!(err, SignerError::CosignerTimeout { id: 2 }), "{err}");
    assert!(err.is_transient());

    let garbling = RemoteCosigner::new(
        2,
        String::new(),
        call_timeout,
        LoopbackTransport::boxed(&cluster.cosigners[1], Behavior::Garbling),
    );
    let err = garbling.pub_key(TEST_CHAIN_ID).await.unwrap_err();
    assert!(matches!(err, SignerError::InvalidResponse { id: 2, .. }), "{err}");
}
