use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};
use types::consensus::{Block, Hrs, Hrst};
use types::errors::SignerError;
use types::rpc::{SignRequest, SignResponse};
use types::{sign_latency_metrics, sign_result_metrics};

use crate::config::RuntimeConfig;
use crate::cosigner::local::LocalCosigner;
use crate::cosigner::Cosigner;
use crate::leader::Leader;
use crate::nonce_cache::NonceCache;
use crate::sign_state::{Decision, SignState, SignStateConsensus};

/// Result of a successful sign call. `bytes_substituted` is set when the
/// returned signature was produced for previously committed bytes at the
/// same voting moment rather than for the bytes the caller submitted.
#[derive(Debug, Clone)]
pub struct SignedBlock {
    pub signature: Vec<u8>,
    pub vote_ext_signature: Vec<u8>,
    pub hrst: Hrst,
    pub bytes_substituted: bool,
}

struct ChainInner {
    sign_state: SignState,
    // Voting moments with a ceremony currently running in this process.
    in_flight: HashSet<Hrs>,
}

struct ChainSignState {
    inner: Mutex<ChainInner>,
    // Signalled whenever an in-flight attempt commits or fails.
    resolved: Notify,
}

/// The sign orchestrator. Gates on leadership, consults the sign state,
/// distributes a pre-generated nonce set to the ceremony's cosigners, waits
/// for the first T partial signatures, aggregates and verifies, and only
/// then durably commits and returns.
pub struct ThresholdValidator {
    config: RuntimeConfig,
    threshold: u8,
    sign_timeout: Duration,
    my_cosigner: Arc<LocalCosigner>,
    cosigners: HashMap<u8, Arc<dyn Cosigner>>,
    leader: Arc<dyn Leader>,
    nonce_cache: Arc<NonceCache>,
    refiller: std::sync::Mutex<Option<JoinHandle<()>>>,
    chains: Mutex<HashMap<String, Arc<ChainSignState>>>,
}

impl ThresholdValidator {
    pub fn new(
        config: RuntimeConfig,
        threshold: u8,
        sign_timeout: Duration,
        my_cosigner: Arc<LocalCosigner>,
        peer_cosigners: Vec<Arc<dyn Cosigner>>,
        leader: Arc<dyn Leader>,
    ) -> Self {
        let mut cosigners: HashMap<u8, Arc<dyn Cosigner>> = HashMap::new();
        cosigners.insert(my_cosigner.id(), Arc::clone(&my_cosigner) as Arc<dyn Cosigner>);
        for peer in peer_cosigners {
            cosigners.insert(peer.id(), peer);
        }

        let nonce_cache = Arc::new(NonceCache::new(
            cosigners.values().cloned().collect(),
            threshold,
            config.config.nonce_cache_low_watermark,
            config.config.nonce_cache_high_watermark,
            sign_timeout,
        ));

        Self {
            config,
            threshold,
            sign_timeout,
            my_cosigner,
            cosigners,
            leader,
            nonce_cache,
            refiller: std::sync::Mutex::new(None),
            chains: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the nonce-cache refiller. Idempotent.
    pub fn start(&self) {
        let mut refiller = self.refiller.lock().expect("refiller lock poisoned");
        if refiller.is_none() {
            *refiller = Some(self.nonce_cache.spawn_refiller());
        }
    }

    /// Abort the refiller task. Called on shutdown and from `Drop`.
    pub fn stop(&self) {
        if let Some(handle) = self
            .refiller
            .lock()
            .expect("refiller lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    #[must_use]
    pub fn nonce_cache(&self) -> Arc<NonceCache> {
        Arc::clone(&self.nonce_cache)
    }

    /// Lazy initialization of sign state and key material for a chain.
    /// Idempotent.
    pub async fn load_sign_state_if_necessary(&self, chain_id: &str) -> Result<(), SignerError> {
        self.load_chain(chain_id).await.map(|_| ())
    }

    async fn load_chain(&self, chain_id: &str) -> Result<Arc<ChainSignState>, SignerError> {
        let mut chains = self.chains.lock().await;
        if let Some(chain) = chains.get(chain_id) {
            return Ok(Arc::clone(chain));
        }

        self.my_cosigner.load_chain_if_necessary(chain_id)?;
        let sign_state = SignState::load_or_create(self.config.consensus_state_file(chain_id))?;
        let chain = Arc::new(ChainSignState {
            inner: Mutex::new(ChainInner {
                sign_state,
                in_flight: HashSet::new(),
            }),
            resolved: Notify::new(),
        });
        chains.insert(chain_id.to_string(), Arc::clone(&chain));
        Ok(chain)
    }

    /// Apply a sign-state entry broadcast by a peer validator. The entry is
    /// adopted only strictly above the local high water; a local reservation
    /// at the same moment always wins.
    pub async fn observe_signed(
        &self,
        chain_id: &str,
        entry: SignStateConsensus,
    ) -> Result<(), SignerError> {
        let chain = self.load_chain(chain_id).await?;
        let mut inner = chain.inner.lock().await;
        if inner.in_flight.contains(&entry.hrs()) {
            debug!(chain_id, "ignoring peer sign state for an in-flight attempt");
            return Ok(());
        }
        inner.sign_state.observe(entry);
        Ok(())
    }

    pub async fn sign(&self, chain_id: &str, block: Block) -> Result<SignedBlock, SignerError> {
        let start = std::time::Instant::now();
        let result = self.sign_block(chain_id, &block).await;

        match &result {
            Ok(signed) if signed.bytes_substituted => sign_result_metrics!(chain_id, "substituted"),
            Ok(_) => sign_result_metrics!(chain_id, "signed"),
            Err(e) => {
                warn!(
                    chain_id,
                    height = block.hrst.height,
                    round = block.hrst.round,
                    step = %block.hrst.step,
                    error = %e,
                    "sign request failed"
                );
                sign_result_metrics!(chain_id, "failed");
            }
        }
        sign_latency_metrics!(chain_id, start);
        result
    }

    async fn sign_block(&self, chain_id: &str, block: &Block) -> Result<SignedBlock, SignerError> {
        let chain = self.load_chain(chain_id).await?;
        let hrst = block.hrst;
        let hrs = hrst.hrs();
        let deadline = Instant::now() + self.sign_timeout;

        loop {
            let mut inner = chain.inner.lock().await;
            match inner.sign_state.check(hrs, &block.sign_bytes) {
                Decision::IdempotentReturn(entry) => {
                    debug!(chain_id, height = hrs.height, "returning existing signature");
                    return Ok(Self::stored_response(*entry, false));
                }
                Decision::SubstituteReturn(entry) => {
                    warn!(
                        chain_id,
                        height = hrs.height,
                        round = hrs.round,
                        step = %hrs.step,
                        "conflicting bytes at an already-signed moment, returning the committed signature"
                    );
                    return Ok(Self::stored_response(*entry, true));
                }
                Decision::Regression { have } => {
                    return Err(SignerError::Regression { have, got: hrs });
                }
                Decision::Conflict => {
                    return Err(SignerError::ConflictingData {
                        height: hrs.height,
                        round: hrs.round,
                        step: hrs.step,
                    });
                }
                Decision::ReattemptAllowed if inner.in_flight.contains(&hrs) => {
                    // Another task is signing this block; wait for it to
                    // commit or fail, then re-check. The waiter must be
                    // registered before the lock drops or the wakeup races.
                    let notified = chain.resolved.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    drop(inner);

                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() || timeout(remaining, notified).await.is_err() {
                        return Err(SignerError::SameBlockInFlight);
                    }
                }
                Decision::Proceed | Decision::ReattemptAllowed => {
                    if !self.leader.is_leader() {
                        return Err(SignerError::NotLeader);
                    }
                    inner.sign_state.reserve(
                        hrst,
                        &block.sign_bytes,
                        &block.vote_extension_sign_bytes,
                    );
                    inner.in_flight.insert(hrs);
                    break;
                }
            }
        }

        let ceremony = self.run_ceremony(chain_id, block, deadline).await;

        // The reservation is resolved whatever happened; on failure the
        // cache entry keeps its empty signature so the block may be retried.
        let mut inner = chain.inner.lock().await;
        inner.in_flight.remove(&hrs);
        let outcome = match ceremony {
            Ok(entry) => inner.sign_state.commit(entry.clone()).map(|()| entry),
            Err(e) => Err(e),
        };
        chain.resolved.notify_waiters();
        drop(inner);

        let entry = outcome?;

        if let Err(e) = self.leader.share_signed(chain_id, &entry) {
            warn!(chain_id, error = %e, "failed to share sign state with peer validators");
        }

        info!(
            chain_id,
            height = hrs.height,
            round = hrs.round,
            step = %hrs.step,
            "signed block"
        );

        Ok(SignedBlock {
            signature: entry.signature,
            vote_ext_signature: entry.vote_ext_signature,
            hrst,
            bytes_substituted: false,
        })
    }

    /// Indexes of a response subset whose partial signatures share one
    /// aggregate nonce commitment, with at least `need` members.
    fn commitment_quorum(
        responses: &[(u8, SignResponse)],
        need: usize,
    ) -> Option<Vec<usize>> {
        let mut groups: HashMap<&[u8], Vec<usize>> = HashMap::new();
        for (i, (_, response)) in responses.iter().enumerate() {
            let commitment = response
                .signature
                .get(..32)
                .unwrap_or(&response.signature);
            groups.entry(commitment).or_default().push(i);
        }
        groups.into_values().find(|group| group.len() >= need)
    }

    fn stored_response(entry: SignStateConsensus, bytes_substituted: bool) -> SignedBlock {
        SignedBlock {
            signature: entry.signature,
            vote_ext_signature: entry.vote_ext_signature,
            hrst: entry.hrst,
            bytes_substituted,
        }
    }

    /// Steps 4-7 of the sign algorithm: take nonce set(s), fan out, collect
    /// the first T partials, aggregate, and verify. Commit stays with the
    /// caller so the reservation bookkeeping lives in one place.
    async fn run_ceremony(
        &self,
        chain_id: &str,
        block: &Block,
        deadline: Instant,
    ) -> Result<SignStateConsensus, SignerError> {
        let need = usize::from(self.threshold);

        let nonce_set = self
            .nonce_cache
            .take(deadline.saturating_duration_since(Instant::now()))
            .await?;
        let vote_ext_set = if block.has_vote_extension() {
            Some(
                self.nonce_cache
                    .take(deadline.saturating_duration_since(Instant::now()))
                    .await?,
            )
        } else {
            None
        };

        // Leadership can move between the fast check and here; revalidate
        // before anything is distributed.
        if !self.leader.is_leader() {
            return Err(SignerError::NotLeader);
        }

        let mut participants = nonce_set.cosigner_ids.clone();
        if let Some(set) = &vote_ext_set {
            participants.retain(|id| set.cosigner_ids.contains(id));
        }
        if participants.len() < need {
            return Err(SignerError::InsufficientShares {
                got: participants.len(),
                need,
            });
        }

        let (tx, mut rx) = mpsc::channel(participants.len());
        let mut handles = Vec::with_capacity(participants.len());
        for &id in &participants {
            let cosigner = self
                .cosigners
                .get(&id)
                .cloned()
                .ok_or(SignerError::UnknownCosigner { id })?;
            let req = SignRequest {
                chain_id: chain_id.to_string(),
                hrst: block.hrst,
                sign_bytes: block.sign_bytes.clone(),
                vote_extension_sign_bytes: block.vote_extension_sign_bytes.clone(),
                nonces: nonce_set.nonces_for(id),
                vote_ext_nonces: vote_ext_set.as_ref().map(|set| set.nonces_for(id)),
            };
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let result = cosigner.set_nonces_and_sign(req).await;
                let _ = tx.send((id, result)).await;
            }));
        }
        drop(tx);

        // Partial signatures only combine when they share one aggregate
        // nonce commitment (a retried ceremony can mix stored partials from
        // the original ceremony with fresh ones), so collect until some
        // commitment has T shares behind it.
        let mut responses: Vec<(u8, SignResponse)> = Vec::new();
        let mut refusal: Option<SignerError> = None;

        let quorum = loop {
            if let Some(quorum) = Self::commitment_quorum(&responses, need) {
                break Some(quorum);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Ok(message) = timeout(remaining, rx.recv()).await else {
                break None;
            };
            match message {
                Some((id, Ok(response))) => responses.push((id, response)),
                Some((id, Err(e))) => {
                    warn!(chain_id, id, error = %e, "cosigner did not contribute a share");
                    if refusal.is_none()
                        && matches!(
                            e,
                            SignerError::Regression { .. }
                                | SignerError::ConflictingData { .. }
                                | SignerError::RemoteRefused { .. }
                        )
                    {
                        refusal = Some(e);
                    }
                }
                None => break None,
            }
        };

        // Cancel stragglers so their pending nonces expire promptly.
        for handle in &handles {
            handle.abort();
        }

        let Some(quorum) = quorum else {
            // A safety refusal explains the failure better than a count.
            return Err(refusal.unwrap_or(SignerError::InsufficientShares {
                got: responses.len(),
                need,
            }));
        };

        let partials: Vec<(u8, Vec<u8>)> = quorum
            .iter()
            .map(|&i| (responses[i].0, responses[i].1.signature.clone()))
            .collect();
        let vote_ext_partials: Vec<(u8, Vec<u8>)> = quorum
            .iter()
            .map(|&i| (responses[i].0, responses[i].1.vote_ext_signature.clone()))
            .collect();

        let pub_key: [u8; 32] = self
            .my_cosigner
            .pub_key(chain_id)
            .await?
            .try_into()
            .map_err(|_| SignerError::Crypto("aggregate public key must be 32 bytes".to_string()))?;

        let signature = threshold_ed25519::combine_partials(&partials)
            .map_err(|_| SignerError::VerificationFailed)?;
        if !threshold_ed25519::verify(&pub_key, &block.sign_bytes, &signature) {
            error!(
                chain_id,
                height = block.hrst.height,
                "aggregated signature failed verification; a cosigner returned bad shares"
            );
            return Err(SignerError::VerificationFailed);
        }

        let vote_ext_signature = if block.has_vote_extension() {
            let combined = threshold_ed25519::combine_partials(&vote_ext_partials)
                .map_err(|_| SignerError::VerificationFailed)?;
            if !threshold_ed25519::verify(&pub_key, &block.vote_extension_sign_bytes, &combined) {
                error!(
                    chain_id,
                    height = block.hrst.height,
                    "aggregated vote extension signature failed verification"
                );
                return Err(SignerError::VerificationFailed);
            }
            combined.to_vec()
        } else {
            Vec::new()
        };

        Ok(SignStateConsensus {
            hrst: block.hrst,
            sign_bytes: block.sign_bytes.clone(),
            signature: signature.to_vec(),
            vote_ext_sign_bytes: block.vote_extension_sign_bytes.clone(),
            vote_ext_signature,
        })
    }
}

impl Drop for ThresholdValidator {
    fn drop(&mut self) {
        self.stop();
    }
}
