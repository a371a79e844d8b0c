//! Ed25519 threshold signing over a Shamir-shared expanded secret.
//!
//! The monolithic signing scalar is dealt into N shares of which any T
//! suffice. Nonces are fresh random scalars dealt the same way, so a partial
//! signature is an ordinary Schnorr share `s_i = r_i + H(R ∥ A ∥ m)·x_i` and
//! T of them interpolate to the scalar of a canonical Ed25519 signature.

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha512};

use types::errors::SignerError;

pub const SCALAR_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// Expand a 32-byte Ed25519 seed into its clamped signing scalar, reduced
/// into the group order.
#[must_use]
pub fn expand_secret(seed: &[u8; 32]) -> Scalar {
    let digest = Sha512::digest(seed);
    let mut lower = [0u8; 32];
    lower.copy_from_slice(&digest[..32]);
    lower[0] &= 248;
    lower[31] &= 127;
    lower[31] |= 64;
    Scalar::from_bytes_mod_order(lower)
}

/// A uniformly random scalar from the operating system RNG.
#[must_use]
pub fn random_scalar() -> Scalar {
    let mut wide = [0u8; 64];
    OsRng.fill_bytes(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Shamir-split `secret` into `total` shares with reconstruction threshold
/// `threshold`. Share `i` (1-based) is the polynomial evaluated at `i`.
#[must_use]
pub fn deal_shares(secret: &Scalar, threshold: u8, total: u8) -> Vec<Scalar> {
    let mut coefficients = vec![*secret];
    for _ in 1..threshold {
        coefficients.push(random_scalar());
    }

    (1..=total)
        .map(|id| {
            let x = Scalar::from(u64::from(id));
            // Horner evaluation from the highest coefficient down.
            coefficients
                .iter()
                .rev()
                .fold(Scalar::ZERO, |acc, c| acc * x + c)
        })
        .collect()
}

/// Compressed `s·G`.
#[must_use]
pub fn scalar_multiply_base(s: &Scalar) -> [u8; 32] {
    EdwardsPoint::mul_base(s).compress().to_bytes()
}

fn decompress(bytes: &[u8]) -> Result<EdwardsPoint, SignerError> {
    let compressed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SignerError::Crypto(format!("bad point length {}", bytes.len())))?;
    CompressedEdwardsY(compressed)
        .decompress()
        .ok_or_else(|| SignerError::Crypto("point fails to decompress".to_string()))
}

/// Sum of compressed nonce commitments, producing the ceremony's aggregate
/// commitment `R`.
pub fn add_nonce_publics<P: AsRef<[u8]>>(publics: &[P]) -> Result<[u8; 32], SignerError> {
    if publics.is_empty() {
        return Err(SignerError::Crypto("no nonce commitments to sum".to_string()));
    }
    let mut sum = EdwardsPoint::identity();
    for public in publics {
        sum += decompress(public.as_ref())?;
    }
    Ok(sum.compress().to_bytes())
}

/// The Ed25519 challenge scalar `H(R ∥ A ∥ m)` (SHA-512, wide reduction).
#[must_use]
pub fn challenge(nonce_pub: &[u8; 32], group_pub: &[u8; 32], message: &[u8]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(nonce_pub);
    hasher.update(group_pub);
    hasher.update(message);
    Scalar::from_bytes_mod_order_wide(&hasher.finalize().into())
}

/// One cosigner's partial signature `R ∥ s_i` where
/// `s_i = r_i + H(R ∥ A ∥ m)·x_i`.
#[must_use]
pub fn sign_with_share(
    message: &[u8],
    shard: &Scalar,
    nonce_share: &Scalar,
    group_pub: &[u8; 32],
    nonce_pub: &[u8; 32],
) -> [u8; 64] {
    let k = challenge(nonce_pub, group_pub, message);
    let s = nonce_share + k * shard;

    let mut signature = [0u8; 64];
    signature[..32].copy_from_slice(nonce_pub);
    signature[32..].copy_from_slice(&s.to_bytes());
    signature
}

/// Lagrange coefficient at zero for share `id` over the participating set
/// `ids` (1-based, distinct).
#[must_use]
pub fn lagrange_coefficient(id: u8, ids: &[u8]) -> Scalar {
    let x_i = Scalar::from(u64::from(id));
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for &other in ids {
        if other == id {
            continue;
        }
        let x_j = Scalar::from(u64::from(other));
        numerator *= x_j;
        denominator *= x_j - x_i;
    }
    numerator * denominator.invert()
}

/// Interpolate T partial signatures `(id, R ∥ s_i)` into a full Ed25519
/// signature. Malformed partials contribute a zero scalar so a corrupt
/// cosigner yields a signature that fails verification rather than a panic.
pub fn combine_partials(partials: &[(u8, Vec<u8>)]) -> Result<[u8; 64], SignerError> {
    let ids: Vec<u8> = partials.iter().map(|(id, _)| *id).collect();

    let nonce_pub = partials
        .iter()
        .find(|(_, sig)| sig.len() == SIGNATURE_LEN)
        .map(|(_, sig)| &sig[..32])
        .ok_or_else(|| SignerError::Crypto("no well-formed partial signatures".to_string()))?;

    let mut s = Scalar::ZERO;
    for (id, sig) in partials {
        let share = if sig.len() == SIGNATURE_LEN {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&sig[32..]);
            Scalar::from_bytes_mod_order(bytes)
        } else {
            Scalar::ZERO
        };
        s += lagrange_coefficient(*id, &ids) * share;
    }

    let mut signature = [0u8; 64];
    signature[..32].copy_from_slice(nonce_pub);
    signature[32..].copy_from_slice(&s.to_bytes());
    Ok(signature)
}

/// Verify a 64-byte signature against a 32-byte aggregate public key.
#[must_use]
pub fn verify(group_pub: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes): Result<[u8; 32], _> = group_pub.try_into() else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes): Result<[u8; 64], _> = signature.try_into() else {
        return false;
    };
    verifying_key
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}
