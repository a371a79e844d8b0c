use std::sync::Arc;
use std::time::Duration;

use signer::nonce_cache::NonceCache;
use signer::Cosigner;
use types::consensus::{Hrst, Step};
use types::errors::SignerError;
use types::rpc::{NonceBatch, SignRequest, SignResponse};
use uuid::Uuid;

use crate::mocks::cluster::{TestCluster, TEST_CHAIN_ID};

fn cache_over(cluster: &TestCluster, threshold: u8, low: usize, high: usize) -> Arc<NonceCache> {
    let cosigners: Vec<Arc<dyn Cosigner>> = cluster
        .cosigners
        .iter()
        .map(|c| Arc::clone(c) as Arc<dyn Cosigner>)
        .collect();
    Arc::new(NonceCache::new(
        cosigners,
        threshold,
        low,
        high,
        Duration::from_secs(1),
    ))
}

/// A cosigner that never answers anything.
struct DeadCosigner {
    id: u8,
}

#[async_trait::async_trait]
impl Cosigner for DeadCosigner {
    fn id(&self) -> u8 {
        self.id
    }

    fn address(&self) -> String {
        String::new()
    }

    async fn pub_key(&self, _chain_id: &str) -> Result<Vec<u8>, SignerError> {
        Err(SignerError::CosignerUnreachable { id: self.id })
    }

    async fn get_nonces(&self, _uuids: &[Uuid]) -> Result<NonceBatch, SignerError> {
        Err(SignerError::CosignerUnreachable { id: self.id })
    }

    async fn set_nonces_and_sign(&self, _req: SignRequest) -> Result<SignResponse, SignerError> {
        Err(SignerError::CosignerUnreachable { id: self.id })
    }

    async fn verify_signature(&self, _chain_id: &str, _payload: &[u8], _signature: &[u8]) -> bool {
        false
    }
}

#[tokio::test]
async fn load_n_mints_sets_naming_every_contributor() {
    let cluster = TestCluster::new(2, 3);
    let cache = cache_over(&cluster, 2, 1, 4);

    assert_eq!(cache.load_n(3).await, 3);
    assert_eq!(cache.depth().await, 3);

    let set = cache.take(Duration::from_millis(100)).await.unwrap();
    assert_eq!(set.cosigner_ids, vec![1, 2, 3]);
    // Each participant receives contributions from every other participant.
    for id in 1..=3u8 {
        let nonces = set.nonces_for(id);
        assert_eq!(nonces.uuid, set.uuid);
        assert_eq!(nonces.nonces.len(), 2);
        assert!(nonces.nonces.iter().all(|n| n.destination_id == id));
        assert!(nonces.nonces.iter().all(|n| n.source_id != id));
    }
}

#[tokio::test]
async fn taken_sets_are_burned() {
    let cluster = TestCluster::new(2, 2);
    let cache = cache_over(&cluster, 2, 1, 4);

    cache.load_n(2).await;
    let first = cache.take(Duration::from_millis(100)).await.unwrap();
    let second = cache.take(Duration::from_millis(100)).await.unwrap();
    assert_ne!(first.uuid, second.uuid);
}

#[tokio::test]
async fn empty_cache_mints_on_demand() {
    let cluster = TestCluster::new(2, 2);
    let cache = cache_over(&cluster, 2, 1, 4);

    assert_eq!(cache.depth().await, 0);
    let set = cache.take(Duration::from_secs(1)).await.unwrap();
    assert_eq!(set.cosigner_ids, vec![1, 2]);
}

#[tokio::test]
async fn below_threshold_sets_are_dropped_not_served() {
    let cluster = TestCluster::new(2, 3);
    // Only one live cosigner out of three: no set can reach the threshold.
    let cosigners: Vec<Arc<dyn Cosigner>> = vec![
        Arc::clone(&cluster.cosigners[0]) as Arc<dyn Cosigner>,
        Arc::new(DeadCosigner { id: 2 }),
        Arc::new(DeadCosigner { id: 3 }),
    ];
    let cache = Arc::new(NonceCache::new(
        cosigners,
        2,
        1,
        4,
        Duration::from_millis(100),
    ));

    assert_eq!(cache.load_n(2).await, 0);
    let err = cache.take(Duration::from_millis(200)).await.unwrap_err();
    assert!(matches!(err, SignerError::NonceTimeout), "{err}");
}

#[tokio::test]
async fn dead_minority_does_not_block_minting() {
    let cluster = TestCluster::new(2, 3);
    let cosigners: Vec<Arc<dyn Cosigner>> = vec![
        Arc::clone(&cluster.cosigners[0]) as Arc<dyn Cosigner>,
        Arc::clone(&cluster.cosigners[1]) as Arc<dyn Cosigner>,
        Arc::new(DeadCosigner { id: 3 }),
    ];
    let cache = Arc::new(NonceCache::new(
        cosigners,
        2,
        1,
        4,
        Duration::from_millis(100),
    ));

    assert_eq!(cache.load_n(1).await, 1);
    let set = cache.take(Duration::from_millis(100)).await.unwrap();
    // The dead cosigner is not named in the set.
    assert_eq!(set.cosigner_ids, vec![1, 2]);
    assert!(set
        .nonces_for(1)
        .nonces
        .iter()
        .all(|n| n.source_id != 3 && n.destination_id != 3));
}

#[tokio::test]
async fn refiller_keeps_the_queue_at_the_high_watermark() {
    let cluster = TestCluster::new(2, 2);
    let cache = cache_over(&cluster, 2, 2, 6);

    let refiller = cache.spawn_refiller();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(cache.depth().await >= 2, "refiller never filled the queue");

    refiller.abort();
}

#[tokio::test]
async fn consumed_ceremony_uuids_are_single_use() {
    let cluster = TestCluster::new(1, 1);
    let cosigner = &cluster.cosigners[0];

    let uuid = Uuid::new_v4();
    cosigner.get_nonces(&[uuid]).await.unwrap();

    let request = |height: i64| SignRequest {
        chain_id: TEST_CHAIN_ID.to_string(),
        hrst: Hrst {
            height,
            round: 0,
            step: Step::Propose,
            timestamp_nanos: 0,
        },
        sign_bytes: vec![height as u8; 16],
        vote_extension_sign_bytes: Vec::new(),
        nonces: types::rpc::UuidNonces {
            uuid,
            nonces: Vec::new(),
        },
        vote_ext_nonces: None,
    };

    cosigner.set_nonces_and_sign(request(1)).await.unwrap();

    // The dealt nonce was consumed with the first ceremony.
    let err = cosigner.set_nonces_and_sign(request(2)).await.unwrap_err();
    assert!(matches!(err, SignerError::NonceNotFound { .. }), "{err}");
}
