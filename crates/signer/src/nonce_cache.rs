use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, warn};
use types::errors::SignerError;
use types::nonce_cache_metrics;
use types::rpc::{SecuredNonce, UuidNonces};
use uuid::Uuid;

use crate::cosigner::Cosigner;

/// How often the refiller checks the queue depth.
const REFILL_INTERVAL: Duration = Duration::from_millis(250);

/// One pre-generated, distributed-at-rest nonce set: every participating
/// cosigner has dealt its contribution and holds its own share; the per-peer
/// encrypted shares are staged here, grouped by destination.
#[derive(Debug, Clone)]
pub struct NonceSet {
    pub uuid: Uuid,
    pub cosigner_ids: Vec<u8>,
    by_destination: HashMap<u8, Vec<SecuredNonce>>,
}

impl NonceSet {
    /// The contributions of every participant destined for `destination`.
    #[must_use]
    pub fn nonces_for(&self, destination: u8) -> UuidNonces {
        UuidNonces {
            uuid: self.uuid,
            nonces: self
                .by_destination
                .get(&destination)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

/// Bounded queue of pre-generated nonce sets, kept topped up by a refiller
/// task so a sign request never waits on N round trips.
pub struct NonceCache {
    cosigners: Vec<Arc<dyn Cosigner>>,
    threshold: u8,
    low_watermark: usize,
    high_watermark: usize,
    get_nonces_timeout: Duration,
    queue: Mutex<VecDeque<NonceSet>>,
    available: Notify,
}

impl NonceCache {
    #[must_use]
    pub fn new(
        cosigners: Vec<Arc<dyn Cosigner>>,
        threshold: u8,
        low_watermark: usize,
        high_watermark: usize,
        get_nonces_timeout: Duration,
    ) -> Self {
        Self {
            cosigners,
            threshold,
            low_watermark,
            high_watermark: high_watermark.max(low_watermark),
            get_nonces_timeout,
            queue: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    pub async fn depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Synchronously mint `n` additional sets. Sets that fall below the
    /// threshold because of cosigner failures are dropped, not enqueued.
    /// Returns how many sets were actually added.
    pub async fn load_n(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let sets = self.mint(n).await;
        let added = sets.len();
        if added > 0 {
            self.queue.lock().await.extend(sets);
            // One permit per set so every blocked taker gets a wakeup and a
            // notification arriving before the wait is not lost.
            for _ in 0..added {
                self.available.notify_one();
            }
        }
        if added < n {
            warn!(requested = n, added, "minted fewer nonce sets than requested");
        }
        added
    }

    /// Pop one set, waiting until one is available or the deadline passes.
    /// An empty queue triggers an on-demand mint before blocking on the
    /// refiller. A popped set is burned: it is never re-enqueued.
    pub async fn take(&self, deadline: Duration) -> Result<NonceSet, SignerError> {
        let expires = Instant::now() + deadline;
        loop {
            if let Some(set) = self.queue.lock().await.pop_front() {
                nonce_cache_metrics!("taken");
                return Ok(set);
            }
            nonce_cache_metrics!("empty");
            if Instant::now() >= expires {
                return Err(SignerError::NonceTimeout);
            }
            if self.load_n(1).await == 0 {
                let remaining = expires.saturating_duration_since(Instant::now());
                if remaining.is_zero()
                    || timeout(remaining, self.available.notified()).await.is_err()
                {
                    return Err(SignerError::NonceTimeout);
                }
            }
        }
    }

    /// Mint `count` sets in one parallel round: each cosigner is asked for
    /// shares for every freshly minted UUID. A cosigner failing drops only
    /// that cosigner's contribution; a set is kept only if at least the
    /// threshold of cosigners fully contributed, so no set ever names a
    /// cosigner whose share is missing.
    async fn mint(&self, count: usize) -> Vec<NonceSet> {
        let uuids: Vec<Uuid> = (0..count).map(|_| Uuid::new_v4()).collect();

        let mut tasks = Vec::with_capacity(self.cosigners.len());
        for cosigner in &self.cosigners {
            let cosigner = Arc::clone(cosigner);
            let uuids = uuids.clone();
            let call_timeout = self.get_nonces_timeout;
            tasks.push(tokio::spawn(async move {
                let id = cosigner.id();
                match timeout(call_timeout, cosigner.get_nonces(&uuids)).await {
                    Ok(Ok(batch)) => Some((id, batch)),
                    Ok(Err(e)) => {
                        warn!(id, error = %e, "cosigner failed to deal nonces");
                        None
                    }
                    Err(_) => {
                        warn!(id, "cosigner timed out dealing nonces");
                        None
                    }
                }
            }));
        }

        // uuid -> (source id, that source's envelopes for the uuid)
        let mut contributions: HashMap<Uuid, Vec<(u8, Vec<SecuredNonce>)>> = HashMap::new();
        for task in tasks {
            let Ok(Some((id, batch))) = task.await else {
                continue;
            };
            for uuid_nonces in batch.batches {
                contributions
                    .entry(uuid_nonces.uuid)
                    .or_default()
                    .push((id, uuid_nonces.nonces));
            }
        }

        let mut sets = Vec::with_capacity(count);
        for uuid in uuids {
            let Some(sources) = contributions.remove(&uuid) else {
                nonce_cache_metrics!("dropped");
                continue;
            };
            if sources.len() < usize::from(self.threshold) {
                nonce_cache_metrics!("dropped");
                debug!(
                    %uuid,
                    contributed = sources.len(),
                    threshold = self.threshold,
                    "dropping below-threshold nonce set"
                );
                continue;
            }

            let mut cosigner_ids: Vec<u8> = sources.iter().map(|(id, _)| *id).collect();
            cosigner_ids.sort_unstable();

            let mut by_destination: HashMap<u8, Vec<SecuredNonce>> = HashMap::new();
            for (_, envelopes) in sources {
                for envelope in envelopes {
                    if cosigner_ids.contains(&envelope.destination_id) {
                        by_destination
                            .entry(envelope.destination_id)
                            .or_default()
                            .push(envelope);
                    }
                }
            }

            nonce_cache_metrics!("minted");
            sets.push(NonceSet {
                uuid,
                cosigner_ids,
                by_destination,
            });
        }
        sets
    }

    /// Keep the queue at the high watermark. The task is owned by the
    /// validator and aborted on stop.
    pub fn spawn_refiller(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(REFILL_INTERVAL);
            loop {
                ticker.tick().await;
                let depth = cache.depth().await;
                if depth < cache.low_watermark {
                    cache.load_n(cache.high_watermark - depth).await;
                }
            }
        })
    }
}
