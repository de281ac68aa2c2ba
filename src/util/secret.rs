//! AES-256-GCM sealing for stored exchange session credentials.

use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

const NONCE_LEN: usize = 12;

/// Symmetric sealer for credentials at rest. Wire form is
/// `base64(nonce || ciphertext)` with a fresh random nonce per seal.
#[derive(Clone)]
pub(crate) struct SecretBox {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox").finish_non_exhaustive()
    }
}

impl SecretBox {
    /// Build from a base64-encoded 32-byte key.
    pub(crate) fn from_key_base64(key_b64: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_b64.trim())
            .context("credential key is not valid base64")?;
        if key_bytes.len() != 32 {
            return Err(anyhow!(
                "credential key must be 32 bytes, got {}",
                key_bytes.len()
            ));
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        Ok(Self { cipher })
    }

    pub(crate) fn seal(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("credential encryption failed"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    pub(crate) fn open(&self, sealed_b64: &str) -> Result<String> {
        let sealed = BASE64
            .decode(sealed_b64.trim())
            .context("sealed credential is not valid base64")?;
        if sealed.len() <= NONCE_LEN {
            return Err(anyhow!("sealed credential is too short"));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| anyhow!("credential decryption failed"))?;

        String::from_utf8(plaintext).context("decrypted credential is not valid UTF-8")
    }
}
