use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;

use keel_types::error::{KeelError, Result};

use crate::aes_gcm::{NONCE_LEN, TAG_LEN};
use crate::{Encryptor, ENCRYPTION_CHACHA20_POLY1305};

/// ChaCha20-Poly1305, same wire layout as the AES-GCM encryptor.
pub struct ChaCha20Poly1305Encryptor {
    cipher: ChaCha20Poly1305,
}

impl ChaCha20Poly1305Encryptor {
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .expect("valid 32-byte key for ChaCha20-Poly1305");
        Self { cipher }
    }
}

impl Encryptor for ChaCha20Poly1305Encryptor {
    fn encrypt(&self, plaintext: &[u8], content_id: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: content_id,
                },
            )
            .map_err(|e| KeelError::Other(format!("ChaCha20-Poly1305 encrypt: {e}")))?;

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
            .map_err(|_| KeelError::Corruption("ChaCha20-Poly1305 authentication failed".into()))
    }

    fn is_authenticated(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        ENCRYPTION_CHACHA20_POLY1305
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aes_gcm::Aes256GcmEncryptor;

    #[test]
    fn roundtrip() {
        let enc = ChaCha20Poly1305Encryptor::new(&[0x24; 32]);
        let encrypted = enc.encrypt(b"chacha payload", b"aad").unwrap();
        assert_eq!(enc.decrypt(&encrypted, b"aad").unwrap(), b"chacha payload");
    }

    #[test]
    fn wrong_key_fails() {
        let a = ChaCha20Poly1305Encryptor::new(&[0x24; 32]);
        let b = ChaCha20Poly1305Encryptor::new(&[0x25; 32]);
        let encrypted = a.encrypt(b"secret", b"aad").unwrap();
        assert!(b.decrypt(&encrypted, b"aad").is_err());
    }

    #[test]
    fn not_interchangeable_with_aes_gcm() {
        let key = [0x24; 32];
        let chacha = ChaCha20Poly1305Encryptor::new(&key);
        let gcm = Aes256GcmEncryptor::new(&key);
        let encrypted = chacha.encrypt(b"secret", b"aad").unwrap();
        assert!(gcm.decrypt(&encrypted, b"aad").is_err());
    }
}
