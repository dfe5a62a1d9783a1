pub mod aes_gcm;
pub mod chacha20_poly1305;
pub mod hashing;
pub mod key;
pub mod select;

use keel_types::error::{KeelError, Result};

use crate::aes_gcm::Aes256GcmEncryptor;
use crate::chacha20_poly1305::ChaCha20Poly1305Encryptor;
use crate::hashing::KeyedBlake2b;

pub const ENCRYPTION_AES256_GCM: &str = "AES256-GCM";
pub const ENCRYPTION_CHACHA20_POLY1305: &str = "CHACHA20-POLY1305";
pub const ENCRYPTION_NONE: &str = "NONE";
pub const HASH_BLAKE2B_256: &str = "BLAKE2B-256";

pub const DEFAULT_HASH: &str = HASH_BLAKE2B_256;
pub const DEFAULT_ENCRYPTION: &str = ENCRYPTION_AES256_GCM;

/// Deterministic, collision-resistant content hash.
pub trait HashFunc: Send + Sync {
    fn hash(&self, data: &[u8]) -> Vec<u8>;

    /// Output length in bytes.
    fn output_len(&self) -> usize;

    fn name(&self) -> &'static str;
}

/// Authenticated encryption bound to a content ID.
pub trait Encryptor: Send + Sync {
    /// Encrypt plaintext. `content_id` is authenticated but not encrypted, so a
    /// ciphertext moved under a different ID fails to decrypt.
    fn encrypt(&self, plaintext: &[u8], content_id: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt data produced by `encrypt` with the same `content_id`.
    fn decrypt(&self, data: &[u8], content_id: &[u8]) -> Result<Vec<u8>>;

    /// Whether ciphertext tampering is detected by `decrypt` itself.
    /// `NoneEncryptor` returns false; callers then rely on the content hash.
    fn is_authenticated(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// A hash function and encryptor pair, fixed when the repository is created.
pub trait Crypter: Send + Sync {
    fn hash_func(&self) -> &dyn HashFunc;
    fn encryptor(&self) -> &dyn Encryptor;
}

/// Crypter with a statically chosen hash and encryptor.
pub struct StaticCrypter {
    pub hash: Box<dyn HashFunc>,
    pub encryption: Box<dyn Encryptor>,
}

impl Crypter for StaticCrypter {
    fn hash_func(&self) -> &dyn HashFunc {
        self.hash.as_ref()
    }

    fn encryptor(&self) -> &dyn Encryptor {
        self.encryption.as_ref()
    }
}

/// No-encryption encryptor. Integrity still comes from the content hash.
pub struct NoneEncryptor;

impl Encryptor for NoneEncryptor {
    fn encrypt(&self, plaintext: &[u8], _content_id: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, data: &[u8], _content_id: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_authenticated(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        ENCRYPTION_NONE
    }
}

pub fn create_hash_func(name: &str, key: &[u8; 32]) -> Result<Box<dyn HashFunc>> {
    match name {
        HASH_BLAKE2B_256 => Ok(Box::new(KeyedBlake2b::new(key))),
        other => Err(KeelError::InvalidConfig(format!(
            "unknown hash algorithm '{other}'"
        ))),
    }
}

pub fn create_encryptor(name: &str, key: &[u8; 32]) -> Result<Box<dyn Encryptor>> {
    match name {
        ENCRYPTION_AES256_GCM => Ok(Box::new(Aes256GcmEncryptor::new(key))),
        ENCRYPTION_CHACHA20_POLY1305 => Ok(Box::new(ChaCha20Poly1305Encryptor::new(key))),
        ENCRYPTION_NONE => Ok(Box::new(NoneEncryptor)),
        other => Err(KeelError::InvalidConfig(format!(
            "unknown encryption algorithm '{other}'"
        ))),
    }
}

/// Build the crypter recorded in a repository format.
pub fn crypter_from_format(
    hash_name: &str,
    encryption_name: &str,
    master: &key::MasterKey,
) -> Result<StaticCrypter> {
    Ok(StaticCrypter {
        hash: create_hash_func(hash_name, &master.hash_key)?,
        encryption: create_encryptor(encryption_name, &master.encryption_key)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_encryptor_is_identity() {
        let enc = NoneEncryptor;
        let data = b"hello plaintext";
        let encrypted = enc.encrypt(data, b"id").unwrap();
        assert_eq!(encrypted, data);
        assert_eq!(enc.decrypt(&encrypted, b"other-id").unwrap(), data);
        assert!(!enc.is_authenticated());
    }

    #[test]
    fn factories_reject_unknown_names() {
        let key = [0x11; 32];
        assert!(create_hash_func("MD5", &key).is_err());
        assert!(create_encryptor("ROT13", &key).is_err());
    }

    #[test]
    fn crypter_from_format_uses_named_algorithms() {
        let master = key::MasterKey::generate();
        let crypter =
            crypter_from_format(HASH_BLAKE2B_256, ENCRYPTION_CHACHA20_POLY1305, &master).unwrap();
        assert_eq!(crypter.hash_func().name(), HASH_BLAKE2B_256);
        assert_eq!(crypter.encryptor().name(), ENCRYPTION_CHACHA20_POLY1305);
        assert!(crypter.encryptor().is_authenticated());
    }
}
