use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use keel_types::error::{KeelError, Result};

/// Repository master secrets. Only ever persisted wrapped by a passphrase.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    pub encryption_key: [u8; 32],
    pub hash_key: [u8; 32],
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct MasterKeyPayload {
    encryption_key: Vec<u8>,
    hash_key: Vec<u8>,
}

/// Argon2id work factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfCost {
    pub time_cost: u32,
    /// KiB
    pub memory_cost: u32,
    pub parallelism: u32,
}

impl KdfCost {
    pub const STANDARD: KdfCost = KdfCost {
        time_cost: 3,
        memory_cost: 64 * 1024,
        parallelism: 4,
    };

    /// Cheap parameters for throwaway repositories and tests.
    pub const LIGHT: KdfCost = KdfCost {
        time_cost: 1,
        memory_cost: 8 * 1024,
        parallelism: 1,
    };
}

impl Default for KdfCost {
    fn default() -> Self {
        Self::STANDARD
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

/// Master key wrapped with a passphrase-derived key, as stored in the format blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub kdf: KdfParams,
    pub nonce: Vec<u8>,
    pub payload: Vec<u8>,
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut encryption_key = [0u8; 32];
        let mut hash_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut encryption_key);
        rand::rngs::OsRng.fill_bytes(&mut hash_key);
        Self {
            encryption_key,
            hash_key,
        }
    }

    /// Wrap with Argon2id + AES-256-GCM. The KDF parameters are bound as
    /// associated data so they cannot be swapped undetected.
    pub fn wrap(&self, passphrase: &str, cost: KdfCost) -> Result<WrappedKey> {
        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let kdf = KdfParams {
            algorithm: "argon2id".to_string(),
            time_cost: cost.time_cost,
            memory_cost: cost.memory_cost,
            parallelism: cost.parallelism,
            salt,
        };
        let wrapping_key = derive_wrapping_key(passphrase, &kdf)?;

        let payload = MasterKeyPayload {
            encryption_key: self.encryption_key.to_vec(),
            hash_key: self.hash_key.to_vec(),
        };
        let plaintext = Zeroizing::new(rmp_serde::to_vec(&payload)?);

        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .map_err(|e| KeelError::KeyDerivation(format!("cipher init: {e}")))?;
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        let aad = kdf_aad(&kdf)?;
        let payload = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_ref(),
                    aad: &aad,
                },
            )
            .map_err(|e| KeelError::KeyDerivation(format!("wrap: {e}")))?;

        Ok(WrappedKey {
            kdf,
            nonce: nonce.to_vec(),
            payload,
        })
    }

    /// Unwrap a stored key. A wrong passphrase surfaces as `DecryptionFailed`.
    pub fn unwrap_with(wrapped: &WrappedKey, passphrase: &str) -> Result<Self> {
        if wrapped.kdf.algorithm != "argon2id" {
            return Err(KeelError::Unsupported(format!(
                "key derivation '{}'",
                wrapped.kdf.algorithm
            )));
        }
        if wrapped.nonce.len() != 12 {
            return Err(KeelError::Corruption("wrapped key nonce length".into()));
        }
        let wrapping_key = derive_wrapping_key(passphrase, &wrapped.kdf)?;
        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .map_err(|_| KeelError::DecryptionFailed)?;
        let aad = kdf_aad(&wrapped.kdf)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&wrapped.nonce),
                    Payload {
                        msg: &wrapped.payload,
                        aad: &aad,
                    },
                )
                .map_err(|_| KeelError::DecryptionFailed)?,
        );

        let payload: MasterKeyPayload =
            rmp_serde::from_slice(&plaintext).map_err(|_| KeelError::DecryptionFailed)?;
        if payload.encryption_key.len() != 32 || payload.hash_key.len() != 32 {
            return Err(KeelError::DecryptionFailed);
        }
        let mut key = MasterKey {
            encryption_key: [0u8; 32],
            hash_key: [0u8; 32],
        };
        key.encryption_key.copy_from_slice(&payload.encryption_key);
        key.hash_key.copy_from_slice(&payload.hash_key);
        Ok(key)
    }
}

fn kdf_aad(kdf: &KdfParams) -> Result<Vec<u8>> {
    rmp_serde::to_vec(kdf).map_err(|e| KeelError::KeyDerivation(format!("kdf aad: {e}")))
}

fn derive_wrapping_key(passphrase: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let params = argon2::Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| KeelError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, output.as_mut())
        .map_err(|e| KeelError::KeyDerivation(format!("argon2: {e}")))?;
    Ok(output)
}
