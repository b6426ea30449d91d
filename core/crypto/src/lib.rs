//! Cryptographic primitives for Sentinel.
//!
//! This module provides:
//! - Hardened in-memory custody of key material (enclaves, locked buffers)
//! - Passphrase-derived identity keys with constant-time verification
//! - AES-256-GCM sealing of the primary identity at rest
//! - age encryption of item values to a recipient set
//! - HMAC-SHA256 integrity tags for item metadata
//!
//! # Security Guarantees
//! - All key material is zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod agefile;
pub mod enclave;
pub mod integrity;
pub mod passphrase;
pub mod seal;

pub use agefile::{decrypt_with_identity, encrypt_to_recipients};
pub use enclave::{Enclave, LockedBuffer};
pub use integrity::{append_tag, hex_checksum, split_verified, TAG_LENGTH};
pub use passphrase::{derive_identity_key, verify_identity_key, KEY_LENGTH};
pub use seal::{seal, unseal, NONCE_SIZE};
