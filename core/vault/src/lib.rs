//! The Sentinel vault engine.
//!
//! This module provides:
//! - Item lifecycle with at-rest age encryption
//! - Hardened in-memory custody of the identity key and metadata secret
//! - Metadata integrity via trailing HMAC-SHA256 tags
//! - Peer pinning and recovery-recipient rotation
//! - The RPC-facing service contracts with synchronous secret zeroing
//!
//! # Architecture
//! The vault sits between the service layer and the storage backend and
//! handles all encryption and integrity checking itself; the backend only
//! ever sees ciphertext and tagged metadata.

pub mod config;
pub mod item;
pub mod service;
pub mod upgrade;
pub mod vault;

pub use config::{load_store_config, StoreConfig, TlsConfig};
pub use item::Item;
pub use service::{
    AdminCredentials, ClientCredentials, Credentials, GetItemResponse, ValueStream,
    VaultService, Zero,
};
pub use vault::{Vault, VaultOptions};
