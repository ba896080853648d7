use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{PanelError, PanelResult};

const NONCE_LEN: usize = 12;

/// Encryption service for agent secrets stored in the panel state.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> PanelResult<String>;
    fn decrypt(&self, encrypted: &str) -> PanelResult<String>;
}

/// AES-256-GCM keyed by SHA-256 of the configured master key. Output is
/// base64 of `nonce || ciphertext`.
pub struct AesSecretCipher {
    cipher: Aes256Gcm,
}

impl AesSecretCipher {
    pub fn from_master_key(master_key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(master_key.as_bytes());
        let key: [u8; 32] = hasher.finalize().into();
        Self { cipher: Aes256Gcm::new(&key.into()) }
    }
}

impl SecretCipher for AesSecretCipher {
    fn encrypt(&self, plaintext: &str) -> PanelResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| PanelError::Internal(format!("secret encryption failed: {}", e)))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(out))
    }

    fn decrypt(&self, encrypted: &str) -> PanelResult<String> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| PanelError::Internal(format!("stored secret is not base64: {}", e)))?;
        if data.len() <= NONCE_LEN {
            return Err(PanelError::Internal("stored secret is truncated".to_string()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| PanelError::Internal("stored secret does not decrypt with this master key".to_string()))?;
        String::from_utf8(plaintext).map_err(|e| PanelError::Internal(format!("stored secret is not utf-8: {}", e)))
    }
}
