use std::collections::BTreeMap;

use aes_gcm::{aead::Aead, Aes256Gcm, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use k256::ecdh::{diffie_hellman, EphemeralSecret};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use types::errors::SignerError;
use types::rpc::SecuredNonce;

const SEC1_COMPRESSED_LEN: usize = 33;
const AEAD_NONCE_LEN: usize = 12;
const HKDF_INFO: &[u8] = b"cosigner nonce share";

fn derive_aead_key(shared_secret: &[u8]) -> Result<[u8; 32], SignerError> {
    let mut aead_key = [0u8; 32];
    Hkdf::<Sha256>::new(None, shared_secret)
        .expand(HKDF_INFO, &mut aead_key)
        .map_err(|e| SignerError::Crypto(format!("hkdf expand failed: {e}")))?;
    Ok(aead_key)
}

/// A nonce share decrypted and authenticated from a peer cosigner.
#[derive(Debug, Clone)]
pub struct DecryptedNonce {
    pub source_id: u8,
    pub nonce_pub: Vec<u8>,
    pub share: Vec<u8>,
}

/// Authenticated confidential envelope for nonce shares in transit between
/// cosigners. The core treats the construction as a black box; the contract
/// is that `decrypt_and_verify` fails on any tampering and on unknown
/// sources, and that a share is readable only by its destination.
pub trait CosignerSecurity: Send + Sync {
    fn id(&self) -> u8;

    fn encrypt_and_sign(
        &self,
        destination_id: u8,
        nonce_pub: &[u8],
        share: &[u8],
    ) -> Result<SecuredNonce, SignerError>;

    fn decrypt_and_verify(&self, nonce: &SecuredNonce) -> Result<DecryptedNonce, SignerError>;
}

/// ECIES over secp256k1: ephemeral ECDH with the destination's long-term
/// key, HKDF-SHA256 key derivation, AES-256-GCM for the share, and an ECDSA
/// envelope signature under the source's long-term key.
pub struct EciesSecurity {
    id: u8,
    secret: SecretKey,
    signing_key: SigningKey,
    // 1-based cosigner id -> long-term public key, the full roster.
    peers: BTreeMap<u8, PublicKey>,
}

impl EciesSecurity {
    pub fn new(id: u8, secret: SecretKey, peer_pub_keys: Vec<PublicKey>) -> Result<Self, SignerError> {
        if id == 0 || usize::from(id) > peer_pub_keys.len() {
            return Err(SignerError::Config(format!(
                "cosigner id {id} out of range for {} keys",
                peer_pub_keys.len()
            )));
        }
        let signing_key = SigningKey::from(&secret);
        let peers = peer_pub_keys
            .into_iter()
            .enumerate()
            .map(|(i, key)| (i as u8 + 1, key))
            .collect();
        Ok(Self {
            id,
            secret,
            signing_key,
            peers,
        })
    }

    fn envelope_payload(nonce: &SecuredNonce) -> Vec<u8> {
        let mut payload = vec![nonce.source_id, nonce.destination_id];
        payload.extend_from_slice(&nonce.nonce_pub);
        payload.extend_from_slice(&nonce.share);
        payload
    }
}

impl CosignerSecurity for EciesSecurity {
    fn id(&self) -> u8 {
        self.id
    }

    fn encrypt_and_sign(
        &self,
        destination_id: u8,
        nonce_pub: &[u8],
        share: &[u8],
    ) -> Result<SecuredNonce, SignerError> {
        let destination_pub = self
            .peers
            .get(&destination_id)
            .ok_or(SignerError::UnknownCosigner { id: destination_id })?;

        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(destination_pub);
        let aead_key = derive_aead_key(shared.raw_secret_bytes().as_slice())?;

        let mut aead_nonce = [0u8; AEAD_NONCE_LEN];
        OsRng.fill_bytes(&mut aead_nonce);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&aead_key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&aead_nonce), share)
            .map_err(|e| SignerError::Crypto(format!("share encryption failed: {e}")))?;

        let mut sealed =
            Vec::with_capacity(SEC1_COMPRESSED_LEN + AEAD_NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(ephemeral_pub.to_encoded_point(true).as_bytes());
        sealed.extend_from_slice(&aead_nonce);
        sealed.extend_from_slice(&ciphertext);

        let mut secured = SecuredNonce {
            source_id: self.id,
            destination_id,
            nonce_pub: nonce_pub.to_vec(),
            share: sealed,
            signature: Vec::new(),
        };
        let signature: Signature = self.signing_key.sign(&Self::envelope_payload(&secured));
        secured.signature = signature.to_bytes().to_vec();
        Ok(secured)
    }

    fn decrypt_and_verify(&self, nonce: &SecuredNonce) -> Result<DecryptedNonce, SignerError> {
        if nonce.destination_id != self.id {
            return Err(SignerError::Crypto(format!(
                "nonce share for cosigner {} delivered to cosigner {}",
                nonce.destination_id, self.id
            )));
        }

        let source_pub = self
            .peers
            .get(&nonce.source_id)
            .ok_or(SignerError::UnknownCosigner {
                id: nonce.source_id,
            })?;

        let signature = Signature::from_slice(&nonce.signature)
            .map_err(|e| SignerError::Crypto(format!("malformed envelope signature: {e}")))?;
        VerifyingKey::from(source_pub)
            .verify(&Self::envelope_payload(nonce), &signature)
            .map_err(|_| {
                SignerError::Crypto(format!(
                    "envelope signature from cosigner {} does not verify",
                    nonce.source_id
                ))
            })?;

        if nonce.share.len() < SEC1_COMPRESSED_LEN + AEAD_NONCE_LEN {
            return Err(SignerError::Crypto("sealed share is truncated".to_string()));
        }
        let (ephemeral_bytes, rest) = nonce.share.split_at(SEC1_COMPRESSED_LEN);
        let (aead_nonce, ciphertext) = rest.split_at(AEAD_NONCE_LEN);

        let ephemeral_pub = PublicKey::from_sec1_bytes(ephemeral_bytes)
            .map_err(|e| SignerError::Crypto(format!("malformed ephemeral key: {e}")))?;
        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), ephemeral_pub.as_affine());
        let aead_key = derive_aead_key(shared.raw_secret_bytes().as_slice())?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&aead_key));
        let share = cipher
            .decrypt(Nonce::from_slice(aead_nonce), ciphertext)
            .map_err(|_| SignerError::Crypto("share decryption failed".to_string()))?;

        Ok(DecryptedNonce {
            source_id: nonce.source_id,
            nonce_pub: nonce.nonce_pub.clone(),
            share,
        })
    }
}
