//! age encryption of item values.
//!
//! Values are encrypted to the primary recipient and, when configured, to an
//! additional recovery recipient. Decryption always happens with the primary
//! identity; plaintext only ever lands in a locked buffer.

use std::io::{Read, Write};

use sentinel_common::{Error, Result};

use crate::enclave::LockedBuffer;

/// Encrypt plaintext for the given recipient set.
///
/// # Errors
/// - Returns error if `recipients` is empty or the stream cannot be written
pub fn encrypt_to_recipients(
    plaintext: &[u8],
    recipients: &[age::x25519::Recipient],
) -> Result<Vec<u8>> {
    if recipients.is_empty() {
        return Err(Error::Crypto("no recipients provided".to_string()));
    }

    let encryptor = age::Encryptor::with_recipients(
        recipients
            .iter()
            .map(|recipient| recipient as &dyn age::Recipient),
    )
    .map_err(|e: age::EncryptError| Error::Crypto(e.to_string()))?;

    let mut ciphertext = Vec::new();
    let mut writer = encryptor
        .wrap_output(&mut ciphertext)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    writer
        .write_all(plaintext)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    writer
        .finish()
        .map_err(|e| Error::Crypto(e.to_string()))?;

    Ok(ciphertext)
}

/// Decrypt an age stream with the primary identity.
///
/// # Postconditions
/// - The plaintext is returned in a locked buffer, wiped when dropped
pub fn decrypt_with_identity(
    data: &[u8],
    identity: &age::x25519::Identity,
) -> Result<LockedBuffer> {
    let decryptor =
        age::Decryptor::new(data).map_err(|e: age::DecryptError| Error::Crypto(e.to_string()))?;

    let identities: [&dyn age::Identity; 1] = [identity];
    let mut reader = decryptor
        .decrypt(identities.into_iter())
        .map_err(|e: age::DecryptError| Error::Crypto(e.to_string()))?;

    let mut plaintext = Vec::with_capacity(data.len());
    reader
        .read_to_end(&mut plaintext)
        .map_err(|e| Error::Crypto(e.to_string()))?;

    Ok(LockedBuffer::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_single_recipient() {
        let identity = age::x25519::Identity::generate();
        let ciphertext =
            encrypt_to_recipients(b"hunter2", &[identity.to_public()]).unwrap();

        let plaintext = decrypt_with_identity(&ciphertext, &identity).unwrap();
        assert_eq!(plaintext.bytes(), b"hunter2");
    }

    #[test]
    fn test_both_recipients_can_decrypt() {
        let primary = age::x25519::Identity::generate();
        let recovery = age::x25519::Identity::generate();

        let ciphertext = encrypt_to_recipients(
            b"shared secret",
            &[primary.to_public(), recovery.to_public()],
        )
        .unwrap();

        assert_eq!(
            decrypt_with_identity(&ciphertext, &primary).unwrap().bytes(),
            b"shared secret"
        );
        assert_eq!(
            decrypt_with_identity(&ciphertext, &recovery).unwrap().bytes(),
            b"shared secret"
        );
    }

    #[test]
    fn test_unrelated_identity_fails() {
        let identity = age::x25519::Identity::generate();
        let other = age::x25519::Identity::generate();

        let ciphertext = encrypt_to_recipients(b"secret", &[identity.to_public()]).unwrap();
        assert!(decrypt_with_identity(&ciphertext, &other).is_err());
    }

    #[test]
    fn test_empty_recipients_rejected() {
        assert!(encrypt_to_recipients(b"secret", &[]).is_err());
    }
}
