use std::fs;
use std::path::Path;

use curve25519_dalek::scalar::Scalar;
use serde::{Deserialize, Serialize};
use types::errors::SignerError;

/// One cosigner's Shamir share of a chain key, as persisted on disk.
/// `pub_key` is the aggregate Ed25519 public key (identical across shares);
/// `private_shard` is this cosigner's share of the expanded secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CosignerKey {
    pub pub_key: String,
    pub private_shard: String,
    pub id: u8,
}

impl CosignerKey {
    #[must_use]
    pub fn new(pub_key: &[u8; 32], private_shard: &Scalar, id: u8) -> Self {
        Self {
            pub_key: hex::encode(pub_key),
            private_shard: hex::encode(private_shard.to_bytes()),
            id,
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, SignerError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Write the key shard with owner-only permissions.
    pub fn save_to_file(&self, path: &Path) -> Result<(), SignerError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn public_key_bytes(&self) -> Result<[u8; 32], SignerError> {
        decode_32(&self.pub_key, "public key")
    }

    pub fn shard_scalar(&self) -> Result<Scalar, SignerError> {
        let bytes = decode_32(&self.private_shard, "private shard")?;
        Ok(Scalar::from_bytes_mod_order(bytes))
    }
}

fn decode_32(encoded: &str, what: &str) -> Result<[u8; 32], SignerError> {
    let bytes = hex::decode(encoded)
        .map_err(|e| SignerError::Crypto(format!("malformed {what}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| SignerError::Crypto(format!("{what} must be 32 bytes")))
}
