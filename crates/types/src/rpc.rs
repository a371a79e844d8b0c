use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::consensus::Hrst;

/// One encrypted nonce share in transit between two cosigners.
///
/// `nonce_pub` is the dealer's public commitment `R = r·G` and travels in the
/// clear; `share` is the Shamir share of `r` destined for `destination_id`,
/// encrypted to that cosigner; `signature` authenticates the whole envelope
/// under the source cosigner's long-term key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuredNonce {
    pub source_id: u8,
    pub destination_id: u8,
    pub nonce_pub: Vec<u8>,
    pub share: Vec<u8>,
    pub signature: Vec<u8>,
}

/// The nonce contributions for one ceremony identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidNonces {
    pub uuid: Uuid,
    pub nonces: Vec<SecuredNonce>,
}

/// Response to `get_nonces`: one entry per requested ceremony identifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NonceBatch {
    pub batches: Vec<UuidNonces>,
}

/// The `set_nonces_and_sign` request: the voting moment, the bytes to sign,
/// and the nonce contributions (from every participant of the ceremony)
/// destined for the receiving cosigner. `vote_ext_nonces` is present exactly
/// when `vote_extension_sign_bytes` is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    pub chain_id: String,
    pub hrst: Hrst,
    pub sign_bytes: Vec<u8>,
    pub vote_extension_sign_bytes: Vec<u8>,
    pub nonces: UuidNonces,
    pub vote_ext_nonces: Option<UuidNonces>,
}

/// A cosigner's partial signature(s) for one ceremony. `signature` is
/// `R ∥ s_i` (64 bytes); `nonce_pub` is the aggregate commitment the cosigner
/// derived from the distributed shares.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignResponse {
    pub nonce_pub: Vec<u8>,
    pub signature: Vec<u8>,
    pub vote_ext_nonce_pub: Vec<u8>,
    pub vote_ext_signature: Vec<u8>,
    pub timestamp_nanos: i64,
}
