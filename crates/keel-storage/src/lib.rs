pub mod duplex;
pub mod memory;
pub mod reshard;
pub mod retry;
pub mod sharded;
pub mod sharded_fs;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use keel_types::blob::{BlobMetadata, PutOptions};
use keel_types::error::{KeelError, Result};

pub use memory::MemoryBackend;
pub use retry::{RetryConfig, RetryingBackend};
pub use sharded_fs::ShardedFsBackend;

/// Abstract blob store. Implementations must be safe to share across threads;
/// everything above this trait assumes only these operations.
///
/// Blob IDs are passed as `&str` and must satisfy `BlobId::validate`.
pub trait StorageBackend: Send + Sync {
    /// Read a whole blob. Returns `None` if it does not exist.
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Read `length` bytes at `offset`. A short read at the end of the blob is
    /// not an error.
    fn get_range(&self, id: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>>;

    /// Write a blob, replacing any previous version.
    fn put(&self, id: &str, data: &[u8]) -> Result<()>;

    /// Write with retention and recreate options. Backends that cannot honour
    /// an option must refuse instead of silently ignoring it.
    fn put_with_options(&self, id: &str, data: &[u8], opts: &PutOptions) -> Result<()> {
        opts.validate()?;
        if opts.has_retention() {
            return Err(KeelError::Unsupported("blob retention".into()));
        }
        if opts.do_not_recreate && self.exists(id)? {
            return Err(KeelError::AlreadyExists(id.to_string()));
        }
        self.put(id, data)
    }

    /// Delete a blob. Deleting a missing blob succeeds.
    fn delete(&self, id: &str) -> Result<()>;

    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.get_metadata(id)?.is_some())
    }

    /// Invoke `callback` for every blob whose ID starts with `prefix`.
    /// An error from the callback stops the listing and is returned.
    fn list_blobs(
        &self,
        prefix: &str,
        callback: &mut dyn FnMut(BlobMetadata) -> Result<()>,
    ) -> Result<()>;

    /// Collect the listing for `prefix`, sorted by blob ID.
    fn list(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        let mut out = Vec::new();
        self.list_blobs(prefix, &mut |bm| {
            out.push(bm);
            Ok(())
        })?;
        out.sort_by(|a, b| a.blob_id.cmp(&b.blob_id));
        Ok(out)
    }

    fn get_metadata(&self, id: &str) -> Result<Option<BlobMetadata>>;

    /// Push the retention deadline of an existing blob to now + period.
    fn extend_retention(&self, id: &str, _opts: &PutOptions) -> Result<()> {
        Err(KeelError::Unsupported(format!(
            "extending retention of '{id}'"
        )))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// The closed set of backends this crate can build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Sharded filesystem layout rooted at `path`.
    Filesystem {
        path: PathBuf,
        #[serde(default)]
        retry: RetryConfig,
    },
    /// Process-local store, mostly for tests.
    Memory,
}

impl StorageConfig {
    pub fn filesystem(path: impl Into<PathBuf>) -> Self {
        StorageConfig::Filesystem {
            path: path.into(),
            retry: RetryConfig::default(),
        }
    }
}

/// Build a backend from its configuration.
pub fn backend_from_config(cfg: &StorageConfig) -> Result<Box<dyn StorageBackend>> {
    match cfg {
        StorageConfig::Filesystem { path, retry } => {
            let backend = ShardedFsBackend::open(path)?;
            if retry.max_retries == 0 {
                Ok(Box::new(backend))
            } else {
                Ok(Box::new(RetryingBackend::new(backend, retry.clone())))
            }
        }
        StorageConfig::Memory => Ok(Box::new(MemoryBackend::new())),
    }
}
