use bincode::{Decode, Encode};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::errors::SignerError;

/// Consensus voting phase. Discriminants follow the wire convention
/// (propose = 1, prevote = 2, precommit = 3).
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    Encode, Decode,
)]
pub enum Step {
    Propose,
    Prevote,
    Precommit,
}

impl Step {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Propose => 1,
            Self::Prevote => 2,
            Self::Precommit => 3,
        }
    }
}

impl TryFrom<u8> for Step {
    type Error = SignerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Propose),
            2 => Ok(Self::Prevote),
            3 => Ok(Self::Precommit),
            other => Err(SignerError::Config(format!("unknown step {other}"))),
        }
    }
}

/// The consensus coordinate used for double-sign protection. Ordering is
/// lexicographic over (height, round, step), which the derive provides.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Hrs {
    pub height: i64,
    pub round: i64,
    pub step: Step,
}

impl Hrs {
    #[must_use]
    pub const fn new(height: i64, round: i64, step: Step) -> Self {
        Self {
            height,
            round,
            step,
        }
    }
}

/// An [`Hrs`] plus the informational timestamp. The timestamp never
/// participates in ordering or equality of voting moments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hrst {
    pub height: i64,
    pub round: i64,
    pub step: Step,
    pub timestamp_nanos: i64,
}

impl Hrst {
    #[must_use]
    pub const fn hrs(&self) -> Hrs {
        Hrs {
            height: self.height,
            round: self.round,
            step: self.step,
        }
    }
}

/// One sign request as submitted by the consensus client: the voting moment
/// plus the exact bytes to sign. `vote_extension_sign_bytes` is non-empty
/// only for precommits that carry an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub hrst: Hrst,
    pub sign_bytes: Vec<u8>,
    pub vote_extension_sign_bytes: Vec<u8>,
}

impl Block {
    #[must_use]
    pub const fn hrs(&self) -> Hrs {
        self.hrst.hrs()
    }

    #[must_use]
    pub fn has_vote_extension(&self) -> bool {
        self.hrst.step == Step::Precommit && !self.vote_extension_sign_bytes.is_empty()
    }
}

/// Canonical encoding of the bytes a validator signs for one voting moment.
///
/// The consensus client is a collaborator, so the repository owns its own
/// canonical form. Everything except `timestamp_nanos` identifies the block;
/// two encodings that differ only there are the same block resigned with a
/// refreshed timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CanonicalSignDoc {
    pub chain_id: String,
    pub height: i64,
    pub round: i64,
    pub step: u8,
    pub block_id: Option<Vec<u8>>,
    pub part_set_id: Option<Vec<u8>>,
    pub timestamp_nanos: i64,
}

impl CanonicalSignDoc {
    pub fn encode(&self) -> Result<Vec<u8>, SignerError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SignerError::Crypto(format!("failed to encode sign doc: {e}")))
    }

    pub fn decode(data: &[u8]) -> Result<Self, SignerError> {
        let (doc, _): (Self, _) = bincode::decode_from_slice(data, bincode::config::standard())
            .map_err(|e| SignerError::Crypto(format!("failed to decode sign doc: {e}")))?;
        Ok(doc)
    }
}

/// Canonical encoding of a precommit vote extension, signed separately from
/// the vote itself.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CanonicalVoteExtension {
    pub chain_id: String,
    pub height: i64,
    pub round: i64,
    pub extension: Vec<u8>,
}

impl CanonicalVoteExtension {
    pub fn encode(&self) -> Result<Vec<u8>, SignerError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SignerError::Crypto(format!("failed to encode vote extension: {e}")))
    }
}

/// A block proposal as handed over by the consensus client.
#[derive(Debug, Clone, Default)]
pub struct Proposal {
    pub height: i64,
    pub round: i64,
    pub block_id: Option<Vec<u8>>,
    pub part_set_id: Option<Vec<u8>>,
    pub timestamp_nanos: i64,
}

/// A prevote or precommit as handed over by the consensus client.
#[derive(Debug, Clone)]
pub struct Vote {
    pub height: i64,
    pub round: i64,
    pub step: Step,
    pub block_id: Option<Vec<u8>>,
    pub timestamp_nanos: i64,
    pub extension: Vec<u8>,
}

pub fn proposal_to_block(chain_id: &str, proposal: &Proposal) -> Result<Block, SignerError> {
    let doc = CanonicalSignDoc {
        chain_id: chain_id.to_string(),
        height: proposal.height,
        round: proposal.round,
        step: Step::Propose.as_u8(),
        block_id: proposal.block_id.clone(),
        part_set_id: proposal.part_set_id.clone(),
        timestamp_nanos: proposal.timestamp_nanos,
    };

    Ok(Block {
        hrst: Hrst {
            height: proposal.height,
            round: proposal.round,
            step: Step::Propose,
            timestamp_nanos: proposal.timestamp_nanos,
        },
        sign_bytes: doc.encode()?,
        vote_extension_sign_bytes: Vec::new(),
    })
}

pub fn vote_to_block(chain_id: &str, vote: &Vote) -> Result<Block, SignerError> {
    let doc = CanonicalSignDoc {
        chain_id: chain_id.to_string(),
        height: vote.height,
        round: vote.round,
        step: vote.step.as_u8(),
        block_id: vote.block_id.clone(),
        part_set_id: None,
        timestamp_nanos: vote.timestamp_nanos,
    };

    let vote_extension_sign_bytes = if vote.step == Step::Precommit && !vote.extension.is_empty() {
        CanonicalVoteExtension {
            chain_id: chain_id.to_string(),
            height: vote.height,
            round: vote.round,
            extension: vote.extension.clone(),
        }
        .encode()?
    } else {
        Vec::new()
    };

    Ok(Block {
        hrst: Hrst {
            height: vote.height,
            round: vote.round,
            step: vote.step,
            timestamp_nanos: vote.timestamp_nanos,
        },
        sign_bytes: doc.encode()?,
        vote_extension_sign_bytes,
    })
}

/// Whether two sign-byte strings identify the same block at the same voting
/// moment, allowing only the consensus timestamp to differ. Undecodable
/// inputs fall back to strict equality.
#[must_use]
pub fn same_block_ignoring_timestamp(a: &[u8], b: &[u8]) -> bool {
    if a == b {
        return true;
    }

    match (CanonicalSignDoc::decode(a), CanonicalSignDoc::decode(b)) {
        (Ok(mut doc_a), Ok(mut doc_b)) => {
            doc_a.timestamp_nanos = 0;
            doc_b.timestamp_nanos = 0;
            doc_a == doc_b
        }
        _ => false,
    }
}
