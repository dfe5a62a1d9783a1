//! Repository format blob and the parameters stored alongside it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use keel_crypto::key::WrappedKey;
use keel_storage::StorageBackend;
use keel_types::blob::{PutOptions, RetentionMode, FORMAT_BLOB_ID};
use keel_types::error::{KeelError, Result};

pub const FORMAT_VERSION: u32 = 1;

pub const DEFAULT_MAX_PACK_SIZE: u64 = 20 * 1024 * 1024;
const MIN_MAX_PACK_SIZE: u64 = 1024 * 1024;
const MAX_MAX_PACK_SIZE: u64 = 512 * 1024 * 1024;

pub const DEFAULT_MAX_SMALL_INDEX_BLOBS: usize = 8;

/// Shortest accepted retention period.
pub const MIN_RETENTION_PERIOD: Duration = Duration::from_secs(24 * 3600);

/// Features this build understands. A repository requiring anything else is
/// refused on open.
pub const SUPPORTED_FEATURES: &[&str] = &["index-v1"];

/// Persisted unencrypted (JSON) at [`FORMAT_BLOB_ID`]. The master key is
/// wrapped with the passphrase; the mutable parameters are sealed with the
/// master key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatBlob {
    pub version: u32,
    pub unique_id: String,
    pub hash: String,
    pub encryption: String,
    pub key: WrappedKey,
    /// Hex of the sealed [`MutableParameters`] JSON.
    pub parameters: String,
}

impl FormatBlob {
    /// `Ok(None)` when the store has no format blob.
    pub fn load(storage: &dyn StorageBackend) -> Result<Option<Self>> {
        let Some(raw) = storage.get(FORMAT_BLOB_ID)? else {
            return Ok(None);
        };
        let blob: FormatBlob = serde_json::from_slice(&raw)
            .map_err(|e| KeelError::Corruption(format!("{FORMAT_BLOB_ID}: {e}")))?;
        if blob.version != FORMAT_VERSION {
            return Err(KeelError::UnsupportedVersion(blob.version));
        }
        Ok(Some(blob))
    }

    /// Write the format blob. With `create`, refuse to replace an existing one.
    pub fn store(&self, storage: &dyn StorageBackend, create: bool) -> Result<()> {
        let raw = serde_json::to_vec_pretty(self)?;
        let opts = PutOptions {
            do_not_recreate: create,
            ..Default::default()
        };
        storage.put_with_options(FORMAT_BLOB_ID, &raw, &opts)
    }
}

/// Parameters that may change after creation via `set_parameters`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableParameters {
    pub max_pack_size: u64,
    /// Non-compacted index blob count that triggers quick compaction.
    #[serde(default = "default_max_small_index_blobs")]
    pub max_small_index_blobs: usize,
    #[serde(default)]
    pub required_features: Vec<String>,
}

fn default_max_small_index_blobs() -> usize {
    DEFAULT_MAX_SMALL_INDEX_BLOBS
}

impl Default for MutableParameters {
    fn default() -> Self {
        Self {
            max_pack_size: DEFAULT_MAX_PACK_SIZE,
            max_small_index_blobs: DEFAULT_MAX_SMALL_INDEX_BLOBS,
            required_features: Vec::new(),
        }
    }
}

impl MutableParameters {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_MAX_PACK_SIZE..=MAX_MAX_PACK_SIZE).contains(&self.max_pack_size) {
            return Err(KeelError::InvalidConfig(format!(
                "max_pack_size {} outside [{MIN_MAX_PACK_SIZE}, {MAX_MAX_PACK_SIZE}]",
                self.max_pack_size
            )));
        }
        if self.max_small_index_blobs < 2 {
            return Err(KeelError::InvalidConfig(format!(
                "max_small_index_blobs must be at least 2, got {}",
                self.max_small_index_blobs
            )));
        }
        Ok(())
    }

    /// Fail if the repository needs a feature this build lacks.
    pub fn check_features(&self) -> Result<()> {
        let missing: Vec<&str> = self
            .required_features
            .iter()
            .map(String::as_str)
            .filter(|f| !SUPPORTED_FEATURES.contains(f))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(KeelError::Unsupported(format!(
                "repository requires unsupported features: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Blob retention settings, stored at `keel.blobcfg`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    pub retention_mode: Option<RetentionMode>,
    #[serde(default)]
    pub retention_period_secs: u64,
}

impl BlobStorageConfig {
    pub fn with_retention(mode: RetentionMode, period: Duration) -> Self {
        Self {
            retention_mode: Some(mode),
            retention_period_secs: period.as_secs(),
        }
    }

    pub fn is_retention_enabled(&self) -> bool {
        self.retention_mode.is_some() && self.retention_period_secs > 0
    }

    pub fn retention_period(&self) -> Duration {
        Duration::from_secs(self.retention_period_secs)
    }

    pub fn validate(&self) -> Result<()> {
        self.put_options().validate()?;
        if self.retention_mode.is_some() && self.retention_period() < MIN_RETENTION_PERIOD {
            return Err(KeelError::InvalidConfig(format!(
                "retention period must be at least {}h",
                MIN_RETENTION_PERIOD.as_secs() / 3600
            )));
        }
        Ok(())
    }

    /// Options for writing pack blobs under this configuration.
    pub fn put_options(&self) -> PutOptions {
        PutOptions {
            retention_mode: self.retention_mode,
            retention_period: self.retention_period(),
            do_not_recreate: false,
        }
    }
}
