use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use keel_types::error::{KeelError, Result};

use crate::{Encryptor, ENCRYPTION_AES256_GCM};

pub(crate) const NONCE_LEN: usize = 12;
pub(crate) const TAG_LEN: usize = 16;

/// AES-256-GCM with a random 96-bit nonce per message.
pub struct Aes256GcmEncryptor {
    cipher: Aes256Gcm,
}

impl Aes256GcmEncryptor {
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(key).expect("valid 32-byte key for AES-256-GCM");
        Self { cipher }
    }
}

impl Encryptor for Aes256GcmEncryptor {
    fn encrypt(&self, plaintext: &[u8], content_id: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: content_id,
                },
            )
            .map_err(|e| KeelError::Other(format!("AES-GCM encrypt: {e}")))?;

        // [12-byte nonce][ciphertext][16-byte tag]
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8], content_id: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(KeelError::Corruption(format!(
                "ciphertext too short: {} bytes",
                data.len()
            )));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: content_id,
                },
            )
            .map_err(|_| KeelError::Corruption("AES-GCM authentication failed".into()))
    }

    fn is_authenticated(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        ENCRYPTION_AES256_GCM
    }
}
