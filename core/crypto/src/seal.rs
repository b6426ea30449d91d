//! Symmetric sealing of the primary identity using AES-256-GCM.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};

use sentinel_common::{Error, Result};

use crate::passphrase::KEY_LENGTH;

/// Nonce size for AES-256-GCM (12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Seal plaintext under the derived identity key.
///
/// # Preconditions
/// - `key` must be exactly KEY_LENGTH bytes
///
/// # Postconditions
/// - Returns nonce || ciphertext || tag
/// - The nonce is randomly generated per call
///
/// # Errors
/// - Returns error if the key length is incorrect or encryption fails
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
        Error::Crypto(format!(
            "invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        ))
    })?;

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| Error::Crypto(format!("sealing failed: {e}")))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Unseal data produced by [`seal`].
///
/// # Preconditions
/// - `data` must be at least NONCE_SIZE + TAG_SIZE bytes
///
/// # Errors
/// - Returns error on any authentication failure (wrong key, tampering)
pub fn unseal(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
        Error::Crypto(format!(
            "invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        ))
    })?;

    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Crypto("sealed data too short".to_string()));
    }

    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| Error::Crypto(format!("unsealing failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_unseal_roundtrip() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"AGE-SECRET-KEY-1EXAMPLE";

        let sealed = seal(&key, plaintext).unwrap();
        let opened = unseal(&key, &sealed).unwrap();

        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let key = [42u8; KEY_LENGTH];

        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();

        assert_ne!(&a[..NONCE_SIZE], &b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&[1u8; KEY_LENGTH], b"secret").unwrap();
        assert!(unseal(&[2u8; KEY_LENGTH], &sealed).is_err());
    }

    #[test]
    fn test_tampered_data_fails() {
        let key = [42u8; KEY_LENGTH];
        let mut sealed = seal(&key, b"secret").unwrap();
        sealed[NONCE_SIZE + 2] ^= 0xFF;

        assert!(unseal(&key, &sealed).is_err());
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(seal(&[0u8; 16], b"data").is_err());
        assert!(unseal(&[0u8; 16], &[0u8; 64]).is_err());
    }

    #[test]
    fn test_truncated_data_fails() {
        let key = [42u8; KEY_LENGTH];
        assert!(unseal(&key, &[0u8; NONCE_SIZE]).is_err());
    }
}
