use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use curve25519_dalek::scalar::Scalar;
use tracing::{debug, warn};
use types::consensus::Hrs;
use types::errors::SignerError;
use types::rpc::{NonceBatch, SecuredNonce, SignRequest, SignResponse, UuidNonces};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::cosigner::Cosigner;
use crate::key::CosignerKey;
use crate::security::CosignerSecurity;
use crate::sign_state::{Decision, SignState, SignStateConsensus};

/// Dealt nonces are discarded if no ceremony consumes them in time.
const NONCE_EXPIRATION: Duration = Duration::from_secs(10);

/// A nonce this cosigner dealt for one ceremony: the Shamir shares of its
/// random scalar (own share included) and the public commitment.
struct DealtNonce {
    shares: Vec<Scalar>,
    nonce_pub: [u8; 32],
    dealt_at: Instant,
}

/// Per-chain key shard and the cosigner's private highest-signed record.
struct ChainShareState {
    pub_key: [u8; 32],
    shard: Scalar,
    sign_state: SignState,
}

/// A cosigner holding one Shamir share per chain. It deals nonces, produces
/// partial signatures, and keeps its own durable sign state per chain as the
/// final line of defense: even a malicious leader cannot make it double-sign.
pub struct LocalCosigner {
    config: RuntimeConfig,
    security: Arc<dyn CosignerSecurity>,
    address: String,
    threshold: u8,
    total: u8,
    chains: Mutex<HashMap<String, ChainShareState>>,
    nonces: Mutex<HashMap<Uuid, DealtNonce>>,
}

impl LocalCosigner {
    pub fn new(
        config: RuntimeConfig,
        security: Arc<dyn CosignerSecurity>,
        address: String,
    ) -> Result<Self, SignerError> {
        let threshold_mode = config.threshold_mode()?;
        let threshold = threshold_mode.threshold;
        let total = threshold_mode.total();
        Ok(Self {
            config,
            security,
            address,
            threshold,
            total,
            chains: Mutex::new(HashMap::new()),
            nonces: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Load the key shard and sign state for a chain if not already
    /// resident. Idempotent.
    pub fn load_chain_if_necessary(&self, chain_id: &str) -> Result<(), SignerError> {
        let mut chains = self.chains.lock().expect("chain state lock poisoned");
        if chains.contains_key(chain_id) {
            return Ok(());
        }

        let key = CosignerKey::load_from_file(&self.config.key_file_path_cosigner(chain_id))?;
        if key.id != self.security.id() {
            return Err(SignerError::Config(format!(
                "key shard for chain {chain_id} belongs to cosigner {}, not {}",
                key.id,
                self.security.id()
            )));
        }
        let sign_state = SignState::load_or_create(self.config.cosigner_state_file(chain_id))?;

        chains.insert(
            chain_id.to_string(),
            ChainShareState {
                pub_key: key.public_key_bytes()?,
                shard: key.shard_scalar()?,
                sign_state,
            },
        );
        debug!(chain_id, id = self.security.id(), "loaded key shard");
        Ok(())
    }

    fn with_chain<T>(
        &self,
        chain_id: &str,
        f: impl FnOnce(&mut ChainShareState) -> Result<T, SignerError>,
    ) -> Result<T, SignerError> {
        self.load_chain_if_necessary(chain_id)?;
        let mut chains = self.chains.lock().expect("chain state lock poisoned");
        let state = chains
            .get_mut(chain_id)
            .expect("chain state loaded above");
        f(state)
    }

    /// Drop dealt nonces that no ceremony consumed in time.
    fn sweep_expired_nonces(nonces: &mut HashMap<Uuid, DealtNonce>) {
        let before = nonces.len();
        nonces.retain(|_, dealt| dealt.dealt_at.elapsed() < NONCE_EXPIRATION);
        let swept = before - nonces.len();
        if swept > 0 {
            debug!(swept, "expired unused nonces");
        }
    }

    /// Combine this cosigner's own dealt share with the decrypted peer
    /// contributions, producing its share of the ceremony nonce and the
    /// aggregate commitment. Consumes the dealt nonce: every set is
    /// single-use.
    fn combine_nonce(
        &self,
        uuid: Uuid,
        peer_nonces: &[SecuredNonce],
    ) -> Result<(Scalar, [u8; 32]), SignerError> {
        let dealt = self
            .nonces
            .lock()
            .expect("nonce table lock poisoned")
            .remove(&uuid)
            .ok_or(SignerError::NonceNotFound { uuid })?;

        let own_index = usize::from(self.security.id()) - 1;
        let mut share = dealt.shares[own_index];
        let mut publics: Vec<Vec<u8>> = vec![dealt.nonce_pub.to_vec()];

        for secured in peer_nonces {
            if secured.source_id == self.security.id() {
                continue;
            }
            let decrypted = self.security.decrypt_and_verify(secured)?;
            let bytes: [u8; 32] = decrypted.share.as_slice().try_into().map_err(|_| {
                SignerError::Crypto(format!(
                    "nonce share from cosigner {} has length {}",
                    decrypted.source_id,
                    decrypted.share.len()
                ))
            })?;
            share += Scalar::from_bytes_mod_order(bytes);
            publics.push(decrypted.nonce_pub);
        }

        let nonce_pub = threshold_ed25519::add_nonce_publics(&publics)?;
        Ok((share, nonce_pub))
    }

    fn check_sign_state(
        state: &ChainShareState,
        hrs: Hrs,
        sign_bytes: &[u8],
    ) -> Result<Option<SignResponse>, SignerError> {
        match state.sign_state.check(hrs, sign_bytes) {
            Decision::Proceed | Decision::ReattemptAllowed => Ok(None),
            // Same block, already signed: hand back the stored partial so a
            // retried ceremony can still aggregate shares from the original
            // one.
            Decision::IdempotentReturn(entry) => {
                let nonce_pub = entry.signature.get(..32).unwrap_or_default().to_vec();
                let vote_ext_nonce_pub = entry
                    .vote_ext_signature
                    .get(..32)
                    .unwrap_or_default()
                    .to_vec();
                Ok(Some(SignResponse {
                    nonce_pub,
                    signature: entry.signature.clone(),
                    vote_ext_nonce_pub,
                    vote_ext_signature: entry.vote_ext_signature.clone(),
                    timestamp_nanos: entry.hrst.timestamp_nanos,
                }))
            }
            // A cosigner never substitutes: conflicting bytes at a signed
            // moment are refused outright.
            Decision::SubstituteReturn(_) | Decision::Conflict => {
                Err(SignerError::ConflictingData {
                    height: hrs.height,
                    round: hrs.round,
                    step: hrs.step,
                })
            }
            Decision::Regression { have } => Err(SignerError::Regression { have, got: hrs }),
        }
    }
}

#[async_trait::async_trait]
impl Cosigner for LocalCosigner {
    fn id(&self) -> u8 {
        self.security.id()
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    async fn pub_key(&self, chain_id: &str) -> Result<Vec<u8>, SignerError> {
        self.with_chain(chain_id, |state| Ok(state.pub_key.to_vec()))
    }

    async fn get_nonces(&self, uuids: &[Uuid]) -> Result<NonceBatch, SignerError> {
        let mut batches = Vec::with_capacity(uuids.len());

        for &uuid in uuids {
            let secret = threshold_ed25519::random_scalar();
            let shares = threshold_ed25519::deal_shares(&secret, self.threshold, self.total);
            let nonce_pub = threshold_ed25519::scalar_multiply_base(&secret);

            let mut secured = Vec::with_capacity(usize::from(self.total) - 1);
            for destination in 1..=self.total {
                if destination == self.security.id() {
                    continue;
                }
                let share_bytes = shares[usize::from(destination) - 1].to_bytes();
                secured.push(self.security.encrypt_and_sign(
                    destination,
                    &nonce_pub,
                    &share_bytes,
                )?);
            }

            let mut nonces = self.nonces.lock().expect("nonce table lock poisoned");
            Self::sweep_expired_nonces(&mut nonces);
            nonces.insert(
                uuid,
                DealtNonce {
                    shares,
                    nonce_pub,
                    dealt_at: Instant::now(),
                },
            );

            batches.push(UuidNonces {
                uuid,
                nonces: secured,
            });
        }

        Ok(NonceBatch { batches })
    }

    async fn set_nonces_and_sign(&self, req: SignRequest) -> Result<SignResponse, SignerError> {
        let hrs = req.hrst.hrs();

        // Sign-state gate first: a refused request must not consume nonces.
        let gate = self.with_chain(&req.chain_id, |state| {
            Self::check_sign_state(state, hrs, &req.sign_bytes)
        })?;
        if let Some(stored) = gate {
            debug!(
                chain_id = %req.chain_id,
                height = hrs.height,
                round = hrs.round,
                step = %hrs.step,
                "returning stored partial signature"
            );
            return Ok(stored);
        }

        let (nonce_share, nonce_pub) = self.combine_nonce(req.nonces.uuid, &req.nonces.nonces)?;

        let vote_ext = if req.vote_extension_sign_bytes.is_empty() {
            None
        } else {
            let uuid_nonces = req.vote_ext_nonces.as_ref().ok_or_else(|| {
                SignerError::Crypto("vote extension sign bytes without nonces".to_string())
            })?;
            Some(self.combine_nonce(uuid_nonces.uuid, &uuid_nonces.nonces)?)
        };

        self.with_chain(&req.chain_id, |state| {
            // Re-check under the chain lock: another request may have landed
            // while nonces were being combined.
            if let Some(stored) = Self::check_sign_state(state, hrs, &req.sign_bytes)? {
                warn!(
                    chain_id = %req.chain_id,
                    height = hrs.height,
                    "concurrent request already signed this block"
                );
                return Ok(stored);
            }

            let signature = threshold_ed25519::sign_with_share(
                &req.sign_bytes,
                &state.shard,
                &nonce_share,
                &state.pub_key,
                &nonce_pub,
            )
            .to_vec();

            let (vote_ext_nonce_pub, vote_ext_signature) = match &vote_ext {
                Some((share, aggregate)) => (
                    aggregate.to_vec(),
                    threshold_ed25519::sign_with_share(
                        &req.vote_extension_sign_bytes,
                        &state.shard,
                        share,
                        &state.pub_key,
                        aggregate,
                    )
                    .to_vec(),
                ),
                None => (Vec::new(), Vec::new()),
            };

            // Commit before the partial leaves this process.
            state.sign_state.commit(SignStateConsensus {
                hrst: req.hrst,
                sign_bytes: req.sign_bytes.clone(),
                signature: signature.clone(),
                vote_ext_sign_bytes: req.vote_extension_sign_bytes.clone(),
                vote_ext_signature: vote_ext_signature.clone(),
            })?;

            Ok(SignResponse {
                nonce_pub: nonce_pub.to_vec(),
                signature,
                vote_ext_nonce_pub,
                vote_ext_signature,
                timestamp_nanos: req.hrst.timestamp_nanos,
            })
        })
    }

    async fn verify_signature(&self, chain_id: &str, payload: &[u8], signature: &[u8]) -> bool {
        self.with_chain(chain_id, |state| {
            Ok(threshold_ed25519::verify(&state.pub_key, payload, signature))
        })
        .unwrap_or(false)
    }
}
