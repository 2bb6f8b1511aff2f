//! Field cryptography
//!
//! `secret*` attributes are encrypted with AES-256-GCM under a key derived
//! from the database passphrase via PBKDF2-HMAC-SHA256. The stored payload
//! is `base64(salt || nonce || ciphertext+tag)` with a fresh random salt and
//! nonce per value, so equal plaintexts never produce equal ciphertexts.
//! `password` attributes are hashed one-way with bcrypt.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha2::Sha256;

use s3db_types::{ErrorContext, S3dbError};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn encryption_error(message: impl Into<String>) -> S3dbError {
    S3dbError::Encryption {
        message: message.into(),
        context: ErrorContext::default(),
    }
}

/// Encrypt a plaintext under the given passphrase. Returns opaque base64.
pub fn encrypt(passphrase: &str, plaintext: &[u8]) -> Result<String, S3dbError> {
    if passphrase.is_empty() {
        return Err(encryption_error("empty passphrase"));
    }

    let mut salt = [0u8; SALT_LEN];
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let key_bytes = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| encryption_error("AES-GCM encryption failed"))?;

    let mut payload = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(payload))
}

/// Decrypt a payload produced by [`encrypt`].
pub fn decrypt(passphrase: &str, payload: &str) -> Result<Vec<u8>, S3dbError> {
    if passphrase.is_empty() {
        return Err(encryption_error("empty passphrase"));
    }

    let raw = BASE64
        .decode(payload)
        .map_err(|_| encryption_error("payload is not valid base64"))?;
    if raw.len() < SALT_LEN + NONCE_LEN + 16 {
        return Err(encryption_error("payload too short"));
    }

    let (salt, rest) = raw.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let key_bytes = derive_key(passphrase, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| encryption_error("AES-GCM decryption failed (wrong passphrase?)"))
}

/// Convenience wrappers for string plaintexts.
pub fn encrypt_str(passphrase: &str, plaintext: &str) -> Result<String, S3dbError> {
    encrypt(passphrase, plaintext.as_bytes())
}

pub fn decrypt_str(passphrase: &str, payload: &str) -> Result<String, S3dbError> {
    let bytes = decrypt(passphrase, payload)?;
    String::from_utf8(bytes).map_err(|_| encryption_error("decrypted payload is not UTF-8"))
}

/// One-way bcrypt hash for `password` attributes.
pub fn hash_password(password: &str) -> Result<String, S3dbError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|e| encryption_error(format!("bcrypt hash failed: {e}")))
}

/// Verify a password against a stored bcrypt hash.
pub fn verify_password(password: &str, hashed: &str) -> Result<bool, S3dbError> {
    bcrypt::verify(password, hashed)
        .map_err(|e| encryption_error(format!("bcrypt verify failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let payload = encrypt_str("passphrase", "top secret").unwrap();
        assert_ne!(payload, "top secret");
        assert_eq!(decrypt_str("passphrase", &payload).unwrap(), "top secret");
    }

    #[test]
    fn same_plaintext_differs_per_encryption() {
        let a = encrypt_str("p", "value").unwrap();
        let b = encrypt_str("p", "value").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let payload = encrypt_str("right", "value").unwrap();
        let err = decrypt_str("wrong", &payload).unwrap_err();
        assert_eq!(err.code(), "EncryptionError");
    }

    #[test]
    fn bcrypt_is_one_way_and_verifiable() {
        let hashed = hash_password("hunter2").unwrap();
        assert_ne!(hashed, "hunter2");
        assert!(verify_password("hunter2", &hashed).unwrap());
        assert!(!verify_password("hunter3", &hashed).unwrap());
    }
}
