use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use types::errors::SignerError;

pub const DEFAULT_SIGN_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_NONCE_CACHE_LOW_WATERMARK: usize = 4;
pub const DEFAULT_NONCE_CACHE_HIGH_WATERMARK: usize = 16;

/// One cosigner as named in the configuration file. `shard_id` is the
/// 1-based Shamir share index; `address` is the transport address peers dial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosignerParams {
    pub shard_id: u8,
    #[serde(default)]
    pub address: String,
}

/// Threshold-mode parameters: T and the full cosigner roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdModeConfig {
    pub threshold: u8,
    pub cosigners: Vec<CosignerParams>,
}

impl ThresholdModeConfig {
    #[must_use]
    pub fn total(&self) -> u8 {
        self.cosigners.len() as u8
    }

    pub fn validate(&self) -> Result<(), SignerError> {
        if self.threshold == 0 {
            return Err(SignerError::Config("threshold must be positive".to_string()));
        }
        if usize::from(self.threshold) > self.cosigners.len() {
            return Err(SignerError::Config(format!(
                "threshold {} exceeds cosigner count {}",
                self.threshold,
                self.cosigners.len()
            )));
        }
        for (i, cosigner) in self.cosigners.iter().enumerate() {
            if usize::from(cosigner.shard_id) != i + 1 {
                return Err(SignerError::Config(format!(
                    "cosigner shard ids must be 1-based and contiguous, got {} at position {}",
                    cosigner.shard_id, i
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub threshold_mode: Option<ThresholdModeConfig>,
    #[serde(default = "default_sign_timeout_ms")]
    pub sign_timeout_ms: u64,
    #[serde(default = "default_low_watermark")]
    pub nonce_cache_low_watermark: usize,
    #[serde(default = "default_high_watermark")]
    pub nonce_cache_high_watermark: usize,
}

const fn default_sign_timeout_ms() -> u64 {
    DEFAULT_SIGN_TIMEOUT_MS
}

const fn default_low_watermark() -> usize {
    DEFAULT_NONCE_CACHE_LOW_WATERMARK
}

const fn default_high_watermark() -> usize {
    DEFAULT_NONCE_CACHE_HIGH_WATERMARK
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold_mode: None,
            sign_timeout_ms: DEFAULT_SIGN_TIMEOUT_MS,
            nonce_cache_low_watermark: DEFAULT_NONCE_CACHE_LOW_WATERMARK,
            nonce_cache_high_watermark: DEFAULT_NONCE_CACHE_HIGH_WATERMARK,
        }
    }
}

/// Runtime paths plus the parsed configuration. The validator and every
/// local cosigner carry one of these.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub home_dir: PathBuf,
    pub state_dir: PathBuf,
    pub config: Config,
}

impl RuntimeConfig {
    pub fn load(home_dir: PathBuf, state_dir: PathBuf, config_file: &Path) -> Result<Self, SignerError> {
        let contents = fs::read_to_string(config_file)?;
        let config = serde_yaml::from_str::<Config>(&contents)
            .map_err(|e| SignerError::Config(format!("failed to parse config file: {e}")))?;
        if let Some(threshold_mode) = &config.threshold_mode {
            threshold_mode.validate()?;
        }
        Ok(Self {
            home_dir,
            state_dir,
            config,
        })
    }

    pub fn save_config_file(&self, config_file: &Path) -> Result<(), SignerError> {
        let contents = serde_yaml::to_string(&self.config)
            .map_err(|e| SignerError::Config(format!("failed to serialize config: {e}")))?;
        fs::write(config_file, contents)?;
        Ok(())
    }

    pub fn threshold_mode(&self) -> Result<&ThresholdModeConfig, SignerError> {
        self.config
            .threshold_mode
            .as_ref()
            .ok_or_else(|| SignerError::Config("threshold mode is not configured".to_string()))
    }

    #[must_use]
    pub fn sign_timeout(&self) -> Duration {
        Duration::from_millis(self.config.sign_timeout_ms)
    }

    /// Path of this cosigner's key shard for `chain_id`.
    #[must_use]
    pub fn key_file_path_cosigner(&self, chain_id: &str) -> PathBuf {
        self.home_dir.join(format!("{chain_id}_shard.json"))
    }

    /// Path of the validator-level highest-signed record for `chain_id`.
    #[must_use]
    pub fn consensus_state_file(&self, chain_id: &str) -> PathBuf {
        self.state_dir
            .join(format!("{chain_id}_consensus_sign_state.json"))
    }

    /// Path of this cosigner's private highest-signed record for `chain_id`.
    #[must_use]
    pub fn cosigner_state_file(&self, chain_id: &str) -> PathBuf {
        self.state_dir
            .join(format!("{chain_id}_cosigner_sign_state.json"))
    }
}
