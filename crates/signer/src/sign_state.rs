use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;
use types::consensus::{same_block_ignoring_timestamp, Hrs, Hrst, Step};
use types::errors::SignerError;

/// One emitted (or in-flight) signature at a voting moment. An empty
/// `signature` marks an attempt that was reserved but has not produced a
/// committed signature; it blocks conflicting bytes at the same HRS while
/// permitting a retry with the same block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignStateConsensus {
    pub hrst: Hrst,
    pub sign_bytes: Vec<u8>,
    pub signature: Vec<u8>,
    pub vote_ext_sign_bytes: Vec<u8>,
    pub vote_ext_signature: Vec<u8>,
}

impl SignStateConsensus {
    #[must_use]
    pub const fn hrs(&self) -> Hrs {
        self.hrst.hrs()
    }

    #[must_use]
    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}

/// Outcome of checking a sign candidate against the highest-signed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Candidate is strictly above everything seen; sign it.
    Proceed,
    /// Same voting moment, same block (modulo timestamp), already signed;
    /// return the stored signature without a new ceremony.
    IdempotentReturn(Box<SignStateConsensus>),
    /// Same voting moment, different block, but a signature is already
    /// committed; return that signature instead of signing the new bytes.
    SubstituteReturn(Box<SignStateConsensus>),
    /// Same voting moment and block as a reserved attempt with no committed
    /// signature; a retry is permitted.
    ReattemptAllowed,
    /// Same voting moment, different block, nothing committed; refusing is
    /// the only safe answer.
    Conflict,
    /// Candidate is below the highest seen voting moment.
    Regression { have: Hrs },
}

/// Persisted shape of the highest-signed record. Byte strings are hex so the
/// state file stays inspectable.
#[derive(Debug, Serialize, Deserialize)]
struct SignStateFile {
    height: i64,
    round: i64,
    step: u8,
    timestamp_nanos: i64,
    sign_bytes: String,
    signature: String,
    vote_ext_sign_bytes: String,
    vote_ext_signature: String,
}

impl SignStateFile {
    fn from_entry(entry: &SignStateConsensus) -> Self {
        Self {
            height: entry.hrst.height,
            round: entry.hrst.round,
            step: entry.hrst.step.as_u8(),
            timestamp_nanos: entry.hrst.timestamp_nanos,
            sign_bytes: hex::encode(&entry.sign_bytes),
            signature: hex::encode(&entry.signature),
            vote_ext_sign_bytes: hex::encode(&entry.vote_ext_sign_bytes),
            vote_ext_signature: hex::encode(&entry.vote_ext_signature),
        }
    }

    fn into_entry(self) -> Result<SignStateConsensus, SignerError> {
        let step = Step::try_from(self.step)?;
        let decode = |field: &str, what: &str| {
            hex::decode(field)
                .map_err(|e| SignerError::Crypto(format!("malformed {what} in sign state: {e}")))
        };
        Ok(SignStateConsensus {
            hrst: Hrst {
                height: self.height,
                round: self.round,
                step,
                timestamp_nanos: self.timestamp_nanos,
            },
            sign_bytes: decode(&self.sign_bytes, "sign bytes")?,
            signature: decode(&self.signature, "signature")?,
            vote_ext_sign_bytes: decode(&self.vote_ext_sign_bytes, "vote extension sign bytes")?,
            vote_ext_signature: decode(&self.vote_ext_signature, "vote extension signature")?,
        })
    }
}

/// The append-only "highest signed" ledger for one (chain, purpose).
///
/// The committed record is durable (one JSON file, written atomically); the
/// cache holds recent attempts keyed by HRS, including reservations with an
/// empty signature, to deduplicate concurrent and repeated sign requests.
#[derive(Debug)]
pub struct SignState {
    path: PathBuf,
    latest: Option<SignStateConsensus>,
    cache: HashMap<Hrs, SignStateConsensus>,
}

impl SignState {
    /// Load the record from `path`, or start empty if the file does not
    /// exist yet.
    pub fn load_or_create(path: PathBuf) -> Result<Self, SignerError> {
        let latest = match fs::read_to_string(&path) {
            Ok(contents) => {
                let file: SignStateFile = serde_json::from_str(&contents)?;
                Some(file.into_entry()?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut cache = HashMap::new();
        if let Some(entry) = &latest {
            cache.insert(entry.hrs(), entry.clone());
        }

        Ok(Self {
            path,
            latest,
            cache,
        })
    }

    #[must_use]
    pub fn latest(&self) -> Option<&SignStateConsensus> {
        self.latest.as_ref()
    }

    /// The highest voting moment this state knows about, committed or merely
    /// reserved. Reservations count: cosigners may already have signed for a
    /// reserved attempt, so anything below it is a regression.
    fn high_water(&self) -> Option<Hrs> {
        let committed = self.latest.as_ref().map(SignStateConsensus::hrs);
        let reserved = self.cache.keys().max().copied();
        committed.max(reserved)
    }

    /// Classify a sign candidate. Pure; callers serialize through the owning
    /// lock.
    #[must_use]
    pub fn check(&self, hrs: Hrs, sign_bytes: &[u8]) -> Decision {
        let existing = self
            .cache
            .get(&hrs)
            .or_else(|| self.latest.as_ref().filter(|e| e.hrs() == hrs));

        if let Some(entry) = existing {
            let same_block = same_block_ignoring_timestamp(&entry.sign_bytes, sign_bytes);
            return if entry.is_signed() {
                if same_block {
                    Decision::IdempotentReturn(Box::new(entry.clone()))
                } else {
                    Decision::SubstituteReturn(Box::new(entry.clone()))
                }
            } else if same_block {
                Decision::ReattemptAllowed
            } else {
                Decision::Conflict
            };
        }

        match self.high_water() {
            Some(have) if have > hrs => Decision::Regression { have },
            _ => Decision::Proceed,
        }
    }

    /// Record an in-flight attempt: a cache entry with an empty signature.
    pub fn reserve(&mut self, hrst: Hrst, sign_bytes: &[u8], vote_ext_sign_bytes: &[u8]) {
        self.cache.insert(
            hrst.hrs(),
            SignStateConsensus {
                hrst,
                sign_bytes: sign_bytes.to_vec(),
                signature: Vec::new(),
                vote_ext_sign_bytes: vote_ext_sign_bytes.to_vec(),
                vote_ext_signature: Vec::new(),
            },
        );
    }

    /// Durably commit a signed entry. The write is atomic (temp file +
    /// rename) and must succeed before the signature is released to any
    /// caller. Cache entries below the committed moment are pruned.
    pub fn commit(&mut self, entry: SignStateConsensus) -> Result<(), SignerError> {
        if let Some(have) = self.latest.as_ref().map(SignStateConsensus::hrs) {
            if have > entry.hrs() {
                return Err(SignerError::Regression {
                    have,
                    got: entry.hrs(),
                });
            }
        }

        self.persist(&entry)?;

        let committed_hrs = entry.hrs();
        self.cache.retain(|hrs, _| *hrs >= committed_hrs);
        self.cache.insert(committed_hrs, entry.clone());
        self.latest = Some(entry);
        Ok(())
    }

    /// Apply a just-committed entry broadcast by a peer validator. Applied
    /// only strictly above the local high water so a peer's broadcast can
    /// never mask a reserved or failed local attempt at the same moment.
    pub fn observe(&mut self, entry: SignStateConsensus) -> bool {
        match self.high_water() {
            Some(have) if have >= entry.hrs() => false,
            _ => {
                debug!(
                    height = entry.hrst.height,
                    round = entry.hrst.round,
                    step = %entry.hrst.step,
                    "adopting sign state from peer validator"
                );
                let hrs = entry.hrs();
                self.cache.retain(|cached, _| *cached >= hrs);
                self.cache.insert(hrs, entry);
                true
            }
        }
    }

    fn persist(&self, entry: &SignStateConsensus) -> Result<(), SignerError> {
        let contents = serde_json::to_string_pretty(&SignStateFile::from_entry(entry))?;
        let tmp_path = self.path.with_extension("tmp");
        {
            use std::io::Write;
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(contents.as_bytes())?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
