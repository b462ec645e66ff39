//! Encryption at rest for stored credentials, plus gateway token generation.

use crate::error::{Result, SecretsError};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::Engine as _;
use rand::Rng as _;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Symmetric encryption for values stored in the database.
///
/// Only the storage layer calls this; compiled configuration and secret
/// environment maps always carry plaintext.
pub trait SecretCipher: Send + Sync + 'static {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// AES-256-GCM keyed by the SHA-256 digest of a master secret. Output is
/// base64 of `nonce || ciphertext`.
#[derive(Clone)]
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl AesGcmCipher {
    pub fn new(master_key: &str) -> Result<Self> {
        if master_key.trim().is_empty() {
            return Err(SecretsError::InvalidKey.into());
        }
        let digest = Sha256::digest(master_key.as_bytes());
        let cipher =
            Aes256Gcm::new_from_slice(digest.as_slice()).map_err(|_| SecretsError::InvalidKey)?;
        Ok(Self { cipher })
    }
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|error| SecretsError::EncryptionFailed(error.to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(nonce.as_slice());
        payload.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(payload))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let payload = base64::engine::general_purpose::STANDARD
            .decode(ciphertext.trim())
            .map_err(|error| SecretsError::DecryptionFailed(error.to_string()))?;
        if payload.len() <= NONCE_LEN {
            return Err(SecretsError::DecryptionFailed("payload too short".into()).into());
        }

        let (nonce, body) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| SecretsError::DecryptionFailed("authentication failed".into()))?;

        String::from_utf8(plaintext)
            .map_err(|error| SecretsError::DecryptionFailed(error.to_string()).into())
    }
}

/// Fresh 256-bit gateway token, hex encoded.
pub fn generate_gateway_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypts_what_it_encrypts() {
        let cipher = AesGcmCipher::new("master").unwrap();
        let sealed = cipher.encrypt("sk-ant-secret").unwrap();
        assert_ne!(sealed, "sk-ant-secret");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "sk-ant-secret");
    }

    #[test]
    fn nonces_differ_per_encryption() {
        let cipher = AesGcmCipher::new("master").unwrap();
        assert_ne!(cipher.encrypt("x").unwrap(), cipher.encrypt("x").unwrap());
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = AesGcmCipher::new("one").unwrap().encrypt("secret").unwrap();
        let error = AesGcmCipher::new("two").unwrap().decrypt(&sealed).unwrap_err();
        assert!(error.to_string().contains("authentication failed"));
    }

    #[test]
    fn empty_master_key_is_rejected() {
        assert!(AesGcmCipher::new("  ").is_err());
    }

    #[test]
    fn gateway_tokens_are_64_hex_chars() {
        let token = generate_gateway_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_gateway_token());
    }
}
