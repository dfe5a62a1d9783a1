//! Hash-addressed encrypted blobs and fixed-ID encrypted blobs.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use tracing::debug;

use keel_crypto::Crypter;
use keel_storage::StorageBackend;
use keel_types::blob::BlobMetadata;
use keel_types::error::{KeelError, Result};

use super::session::SessionId;

/// Domain separator for fixed-ID blob associated data.
const FIXED_BLOB_AAD_PREFIX: &[u8] = b"keel:fixed-blob:v1\0";

/// Writes and reads blobs whose ID is derived from the plaintext hash, so that
/// every read is verifiable against the ID it was requested by.
///
/// Safe for concurrent use; the optional plaintext cache is internally locked.
pub struct EncryptionManager {
    storage: Arc<dyn StorageBackend>,
    crypter: Arc<dyn Crypter>,
    cache: Option<Mutex<LruCache<String, Arc<Vec<u8>>>>>,
}

impl EncryptionManager {
    /// `cache_size` is the number of decrypted blobs to keep; 0 disables the cache.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        crypter: Arc<dyn Crypter>,
        cache_size: usize,
    ) -> Self {
        let cache = NonZeroUsize::new(cache_size).map(|n| Mutex::new(LruCache::new(n)));
        Self {
            storage,
            crypter,
            cache,
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn crypter(&self) -> &dyn Crypter {
        self.crypter.as_ref()
    }

    fn cache(&self) -> Option<MutexGuard<'_, LruCache<String, Arc<Vec<u8>>>>> {
        self.cache
            .as_ref()
            .map(|c| c.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn cache_get(&self, id: &str) -> Option<Arc<Vec<u8>>> {
        self.cache()?.get(id).cloned()
    }

    fn cache_put(&self, id: &str, plaintext: Vec<u8>) -> Arc<Vec<u8>> {
        let value = Arc::new(plaintext);
        if let Some(mut cache) = self.cache() {
            cache.put(id.to_string(), Arc::clone(&value));
        }
        value
    }

    /// Drop cached plaintext for `ids`.
    pub fn invalidate(&self, ids: &[&str]) {
        if let Some(mut cache) = self.cache() {
            for id in ids {
                cache.pop(*id);
            }
        }
    }

    /// Blob ID for `plaintext`: `prefix + hex(hash) [+ "-" + session]`.
    pub fn blob_id_for(
        &self,
        plaintext: &[u8],
        prefix: &str,
        session: Option<&SessionId>,
    ) -> (String, Vec<u8>) {
        let hash = self.crypter.hash_func().hash(plaintext);
        let mut id = format!("{prefix}{}", hex::encode(&hash));
        if let Some(s) = session {
            id.push('-');
            id.push_str(s.as_str());
        }
        (id, hash)
    }

    /// Hash, encrypt and store `plaintext`. Returns the metadata reported by
    /// the store, including its timestamp. Write errors are returned as-is.
    pub fn encrypt_and_write_blob(
        &self,
        plaintext: &[u8],
        prefix: &str,
        session: Option<&SessionId>,
    ) -> Result<BlobMetadata> {
        let (id, hash) = self.blob_id_for(plaintext, prefix, session);
        let ciphertext = self.crypter.encryptor().encrypt(plaintext, &hash)?;
        self.storage.put(&id, &ciphertext)?;
        self.cache_put(&id, plaintext.to_vec());
        debug!(blob = %id, len = ciphertext.len(), "wrote encrypted blob");
        self.storage
            .get_metadata(&id)?
            .ok_or_else(|| KeelError::NotFound(format!("{id} (vanished after write)")))
    }

    /// Read, decrypt and verify a blob written by [`encrypt_and_write_blob`].
    ///
    /// An absent blob is `NotFound` whatever its ID looks like; a stored blob
    /// whose ID carries no hash is `InvalidBlobId`.
    ///
    /// [`encrypt_and_write_blob`]: Self::encrypt_and_write_blob
    pub fn get_encrypted_blob(&self, id: &str) -> Result<Arc<Vec<u8>>> {
        if let Some(hit) = self.cache_get(id) {
            return Ok(hit);
        }
        let ciphertext = self
            .storage
            .get(id)?
            .ok_or_else(|| KeelError::NotFound(id.to_string()))?;
        let expected = hash_from_blob_id(id)?;
        let plaintext = self.verify_and_decrypt(id, &ciphertext, &expected)?;
        Ok(self.cache_put(id, plaintext))
    }

    fn verify_and_decrypt(&self, id: &str, ciphertext: &[u8], expected: &[u8]) -> Result<Vec<u8>> {
        let plaintext = self
            .crypter
            .encryptor()
            .decrypt(ciphertext, expected)
            .map_err(|e| KeelError::Corruption(format!("{id}: {e}")))?;
        let actual = self.crypter.hash_func().hash(&plaintext);
        if actual != expected {
            return Err(KeelError::Corruption(format!(
                "{id}: content hash mismatch"
            )));
        }
        Ok(plaintext)
    }

    /// Encrypt `value` for storage under a fixed, well-known ID.
    ///
    /// Layout: `[hash len][hash][ciphertext]`, with the ID and hash bound as
    /// associated data.
    pub fn seal_fixed(&self, id: &str, value: &[u8]) -> Result<Vec<u8>> {
        let hash = self.crypter.hash_func().hash(value);
        let hash_len = u8::try_from(hash.len())
            .map_err(|_| KeelError::Other("hash output too long".into()))?;
        let ciphertext = self
            .crypter
            .encryptor()
            .encrypt(value, &fixed_aad(id, &hash))?;
        let mut out = Vec::with_capacity(1 + hash.len() + ciphertext.len());
        out.push(hash_len);
        out.extend_from_slice(&hash);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open_fixed(&self, id: &str, sealed: &[u8]) -> Result<Vec<u8>> {
        let Some((&hash_len, rest)) = sealed.split_first() else {
            return Err(KeelError::Corruption(format!("{id}: empty blob")));
        };
        let hash_len = hash_len as usize;
        if rest.len() < hash_len {
            return Err(KeelError::Corruption(format!("{id}: truncated blob")));
        }
        let (hash, ciphertext) = rest.split_at(hash_len);
        let plaintext = self
            .crypter
            .encryptor()
            .decrypt(ciphertext, &fixed_aad(id, hash))
            .map_err(|e| KeelError::Corruption(format!("{id}: {e}")))?;
        if self.crypter.hash_func().hash(&plaintext) != hash {
            return Err(KeelError::Corruption(format!("{id}: content hash mismatch")));
        }
        Ok(plaintext)
    }

    pub fn write_fixed_blob(&self, id: &str, value: &[u8]) -> Result<()> {
        let sealed = self.seal_fixed(id, value)?;
        self.storage.put(id, &sealed)?;
        self.invalidate(&[id]);
        Ok(())
    }

    /// Read a fixed-ID blob. Absent blobs are `NotFound`.
    pub fn read_fixed_blob(&self, id: &str) -> Result<Arc<Vec<u8>>> {
        if let Some(hit) = self.cache_get(id) {
            return Ok(hit);
        }
        let sealed = self
            .storage
            .get(id)?
            .ok_or_else(|| KeelError::NotFound(id.to_string()))?;
        let plaintext = self.open_fixed(id, &sealed)?;
        Ok(self.cache_put(id, plaintext))
    }
}

fn fixed_aad(id: &str, hash: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(FIXED_BLOB_AAD_PREFIX.len() + id.len() + 1 + hash.len());
    aad.extend_from_slice(FIXED_BLOB_AAD_PREFIX);
    aad.extend_from_slice(id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(hash);
    aad
}

/// Extract the content hash embedded in `prefix + hex(hash) [+ "-" + session]`.
pub fn hash_from_blob_id(id: &str) -> Result<Vec<u8>> {
    let body = id.get(1..).unwrap_or_default();
    let hex_part = body.split('-').next().unwrap_or_default();
    if hex_part.is_empty() {
        return Err(KeelError::InvalidBlobId(id.to_string()));
    }
    hex::decode(hex_part).map_err(|_| KeelError::InvalidBlobId(id.to_string()))
}
