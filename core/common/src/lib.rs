//! Common error types shared across the Sentinel crates.

pub mod error;

pub use error::{Error, Result};
