pub mod content;
pub mod encrypted_blob;
pub mod format;
pub mod session;

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use keel_crypto::key::{KdfCost, MasterKey};
use keel_crypto::{crypter_from_format, select, DEFAULT_ENCRYPTION, DEFAULT_HASH};
use keel_storage::memory::{system_clock, Clock};
use keel_storage::StorageBackend;
use keel_types::blob::{BLOB_CONFIG_BLOB_ID, FORMAT_BLOB_ID};
use keel_types::content_id::ContentId;
use keel_types::error::{KeelError, Result};

use self::content::{ContentKind, WriteSession};
use self::encrypted_blob::EncryptionManager;
use self::format::{BlobStorageConfig, FormatBlob, MutableParameters, FORMAT_VERSION};
use crate::index::{ContentInfo, IndexBlobManager};
use crate::maintenance::params::{self as maintenance_params, MaintenanceState};
use crate::platform;

/// Encryption name that picks the faster AEAD at creation time.
pub const ENCRYPTION_AUTO: &str = "auto";

pub const DEFAULT_CACHE_SIZE: usize = 256;

pub struct RepositoryOptions {
    pub hash: String,
    /// Encryption algorithm name, or [`ENCRYPTION_AUTO`].
    pub encryption: String,
    pub parameters: MutableParameters,
    pub blob_storage: BlobStorageConfig,
    pub kdf_cost: KdfCost,
    pub open: OpenOptions,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            hash: DEFAULT_HASH.to_string(),
            encryption: DEFAULT_ENCRYPTION.to_string(),
            parameters: MutableParameters::default(),
            blob_storage: BlobStorageConfig::default(),
            kdf_cost: KdfCost::default(),
            open: OpenOptions::default(),
        }
    }
}

pub struct OpenOptions {
    /// Decrypted blobs kept in memory; 0 disables the cache.
    pub cache_size: usize,
    pub clock_skew_check: bool,
    /// Time source; defaults to the system clock.
    pub clock: Option<Clock>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            clock_skew_check: false,
            clock: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RepositoryDescription {
    unique_id: String,
    created: DateTime<Utc>,
    created_by: String,
}

/// A handle to an opened repository.
pub struct Repository {
    storage: Arc<dyn StorageBackend>,
    format: Mutex<FormatBlob>,
    parameters: Mutex<MutableParameters>,
    mgr: Arc<EncryptionManager>,
    indexes: IndexBlobManager,
    clock: Clock,
    clock_skew_check: bool,
}

impl Repository {
    /// Initialize a new repository in an empty store.
    pub fn create(
        storage: Arc<dyn StorageBackend>,
        passphrase: &str,
        options: RepositoryOptions,
    ) -> Result<Self> {
        if storage.exists(FORMAT_BLOB_ID)? {
            return Err(KeelError::RepoAlreadyExists(storage.describe()));
        }
        options.parameters.validate()?;
        options.parameters.check_features()?;
        options.blob_storage.validate()?;

        let encryption = if options.encryption == ENCRYPTION_AUTO {
            select::select_encryption().to_string()
        } else {
            options.encryption
        };
        let master = MasterKey::generate();
        let crypter = crypter_from_format(&options.hash, &encryption, &master)?;
        let mgr = Arc::new(EncryptionManager::new(
            Arc::clone(&storage),
            Arc::new(crypter),
            options.open.cache_size,
        ));

        let mut unique_id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut unique_id);
        let sealed = mgr.seal_fixed(FORMAT_BLOB_ID, &serde_json::to_vec(&options.parameters)?)?;
        let format = FormatBlob {
            version: FORMAT_VERSION,
            unique_id: hex::encode(unique_id),
            hash: options.hash,
            encryption,
            key: master.wrap(passphrase, options.kdf_cost)?,
            parameters: hex::encode(sealed),
        };
        format.store(storage.as_ref(), true).map_err(|e| match e {
            KeelError::AlreadyExists(_) => KeelError::RepoAlreadyExists(storage.describe()),
            other => other,
        })?;
        mgr.write_fixed_blob(BLOB_CONFIG_BLOB_ID, &serde_json::to_vec(&options.blob_storage)?)?;
        maintenance_params::save_state(&mgr, &MaintenanceState::new(platform::user_at_host()))?;

        let repo = Self::assemble(storage, format, options.parameters, mgr, options.open);
        let description = RepositoryDescription {
            unique_id: repo.unique_id(),
            created: repo.now(),
            created_by: platform::user_at_host(),
        };
        let mut session = repo.new_write_session()?;
        session.write_content(&serde_json::to_vec(&description)?, ContentKind::Metadata)?;
        session.close()?;

        info!(
            storage = %repo.storage.describe(),
            encryption = %repo.format().encryption,
            "created repository"
        );
        Ok(repo)
    }

    /// Open an existing repository.
    pub fn open(
        storage: Arc<dyn StorageBackend>,
        passphrase: &str,
        options: OpenOptions,
    ) -> Result<Self> {
        let format = FormatBlob::load(storage.as_ref())?
            .ok_or_else(|| KeelError::RepoNotFound(storage.describe()))?;
        let master = MasterKey::unwrap_with(&format.key, passphrase)?;
        let crypter = crypter_from_format(&format.hash, &format.encryption, &master)?;
        let mgr = Arc::new(EncryptionManager::new(
            Arc::clone(&storage),
            Arc::new(crypter),
            options.cache_size,
        ));

        let sealed = hex::decode(&format.parameters)
            .map_err(|e| KeelError::Corruption(format!("{FORMAT_BLOB_ID} parameters: {e}")))?;
        let parameters: MutableParameters =
            serde_json::from_slice(&mgr.open_fixed(FORMAT_BLOB_ID, &sealed)?)?;
        parameters.check_features()?;
        debug!(storage = %storage.describe(), "opened repository");
        Ok(Self::assemble(storage, format, parameters, mgr, options))
    }

    fn assemble(
        storage: Arc<dyn StorageBackend>,
        format: FormatBlob,
        parameters: MutableParameters,
        mgr: Arc<EncryptionManager>,
        options: OpenOptions,
    ) -> Self {
        let clock = options.clock.unwrap_or_else(system_clock);
        Self {
            storage,
            format: Mutex::new(format),
            parameters: Mutex::new(parameters),
            indexes: IndexBlobManager::new(Arc::clone(&mgr)),
            mgr,
            clock,
            clock_skew_check: options.clock_skew_check,
        }
    }

    fn format_lock(&self) -> MutexGuard<'_, FormatBlob> {
        self.format.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn encryption_manager(&self) -> &EncryptionManager {
        &self.mgr
    }

    pub fn indexes(&self) -> &IndexBlobManager {
        &self.indexes
    }

    pub fn format(&self) -> FormatBlob {
        self.format_lock().clone()
    }

    pub fn unique_id(&self) -> String {
        self.format_lock().unique_id.clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn clock_skew_check(&self) -> bool {
        self.clock_skew_check
    }

    pub fn parameters(&self) -> MutableParameters {
        self.parameters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Validate and persist new mutable parameters.
    pub fn set_parameters(&self, parameters: MutableParameters) -> Result<()> {
        parameters.validate()?;
        parameters.check_features()?;
        let sealed = self
            .mgr
            .seal_fixed(FORMAT_BLOB_ID, &serde_json::to_vec(&parameters)?)?;
        {
            let mut format = self.format_lock();
            let mut updated = format.clone();
            updated.parameters = hex::encode(sealed);
            updated.store(self.storage.as_ref(), false)?;
            *format = updated;
        }
        self.mgr.invalidate(&[FORMAT_BLOB_ID, BLOB_CONFIG_BLOB_ID]);
        *self.parameters.lock().unwrap_or_else(|e| e.into_inner()) = parameters;
        info!("updated repository parameters");
        Ok(())
    }

    pub fn blob_storage_config(&self) -> Result<BlobStorageConfig> {
        match self.mgr.read_fixed_blob(BLOB_CONFIG_BLOB_ID) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.is_not_found() => Ok(BlobStorageConfig::default()),
            Err(e) => Err(e),
        }
    }

    pub fn set_blob_storage_config(&self, config: &BlobStorageConfig) -> Result<()> {
        config.validate()?;
        self.mgr
            .write_fixed_blob(BLOB_CONFIG_BLOB_ID, &serde_json::to_vec(config)?)?;
        info!(retention = config.is_retention_enabled(), "updated blob storage configuration");
        Ok(())
    }

    pub fn new_write_session(&self) -> Result<WriteSession<'_>> {
        WriteSession::start(self)
    }

    /// Latest index entry for `id`, including deletion entries.
    pub fn content_info(&self, id: &ContentId) -> Result<ContentInfo> {
        self.indexes
            .load_index()?
            .get(id)
            .cloned()
            .ok_or_else(|| KeelError::NotFound(format!("content {id}")))
    }

    pub fn list_contents(&self, include_deleted: bool) -> Result<Vec<ContentInfo>> {
        Ok(self
            .indexes
            .load_index()?
            .iter()
            .filter(|info| include_deleted || !info.deleted)
            .cloned()
            .collect())
    }

    /// Read and verify a content. Deleted contents are `NotFound`.
    pub fn read_content(&self, id: &ContentId) -> Result<Vec<u8>> {
        let info = self.content_info(id)?;
        if info.deleted {
            return Err(KeelError::NotFound(format!("content {id} (deleted)")));
        }
        let pack = info.pack_blob_id.as_str();
        let ciphertext = self
            .storage
            .get_range(pack, info.pack_offset, info.packed_length)?
            .ok_or_else(|| KeelError::NotFound(format!("pack {pack} for content {id}")))?;
        if ciphertext.len() as u64 != info.packed_length {
            return Err(KeelError::Corruption(format!(
                "content {id}: pack {pack} is truncated"
            )));
        }
        let hash = id.hash_bytes();
        let crypter = self.mgr.crypter();
        let plaintext = crypter
            .encryptor()
            .decrypt(&ciphertext, &hash)
            .map_err(|e| KeelError::Corruption(format!("content {id}: {e}")))?;
        if crypter.hash_func().hash(&plaintext) != hash {
            return Err(KeelError::Corruption(format!("content {id}: hash mismatch")));
        }
        Ok(plaintext)
    }
}
