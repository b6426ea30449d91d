//! Storage backend trait definition.

use async_trait::async_trait;

use sentinel_common::Result;

/// Flat key/value storage contract the vault operates on.
///
/// Names are relative to the vault root and may contain `/` separators
/// (used for value snapshots under `.bak/`). Implementations must be safe
/// to share across tasks.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Prepare the backend for use.
    ///
    /// # Postconditions
    /// - Subsequent reads and writes succeed against an initialized store
    ///
    /// # Errors
    /// - Storage location cannot be created or accessed
    async fn init(&self) -> Result<()>;

    /// Read a file, returning `None` if it does not exist.
    async fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Write a file, replacing any previous content.
    async fn write_file(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Delete a file.
    ///
    /// # Returns
    /// `true` if a file was removed, `false` if nothing existed at `name`.
    async fn delete_file(&self, name: &str) -> Result<bool>;

    /// List top-level file names starting with `prefix`.
    ///
    /// An empty prefix lists everything. Directories are not reported.
    async fn list_files(&self, prefix: &str) -> Result<Vec<String>>;
}
