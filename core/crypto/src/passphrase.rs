//! Passphrase-derived identity keys.
//!
//! The master passphrase is never stored; its SHA-256 digest (with a fixed
//! domain suffix in secure mode) is the symmetric key that seals the primary
//! identity at rest.

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::enclave::{Enclave, LockedBuffer};

/// Length of the derived identity key in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Domain suffix appended to the passphrase in secure (production) mode.
const DOMAIN_SUFFIX: &[u8] = b"sentinel";

fn digest_passphrase(passphrase: &SecretString, secure: bool) -> [u8; KEY_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(passphrase.expose_secret().as_bytes());
    if secure {
        hasher.update(DOMAIN_SUFFIX);
    }

    hasher.finalize().into()
}

/// Derive the identity key from a passphrase.
///
/// # Postconditions
/// - Returns an enclave holding the 32-byte digest
/// - The passphrase is consumed and wiped when it drops
pub fn derive_identity_key(passphrase: SecretString, secure: bool) -> Enclave {
    let digest = digest_passphrase(&passphrase, secure);
    drop(passphrase);
    Enclave::new(digest.to_vec())
}

/// Compare a candidate passphrase against a derived key in constant time.
///
/// Does not touch any storage; only the in-memory key is consulted.
pub fn verify_identity_key(candidate: SecretString, secure: bool, key: &LockedBuffer) -> bool {
    let digest = digest_passphrase(&candidate, secure);
    drop(candidate);
    digest.ct_eq(key.bytes()).into()
}
