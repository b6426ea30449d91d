//! Storage backend abstraction for the Sentinel vault.
//!
//! The vault is parameterized over a flat key/value backend; the reference
//! implementation is a directory on the local filesystem with owner-only
//! permissions. An in-memory backend is provided for tests.
//!
//! # Design Principles
//! - Backend isolation: no storage-specific logic in vault or crypto modules
//! - Async operations: all I/O is async
//! - Flat namespace: names are relative to the vault root; the backend is
//!   free to choose its internal layout

pub mod backend;
pub mod local;
pub mod memory;

pub use backend::Backend;
pub use local::LocalBackend;
pub use memory::MemoryBackend;
