//! Local filesystem storage backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use sentinel_common::{Error, Result};

use crate::backend::Backend;

#[cfg(unix)]
const DIR_MODE: u32 = 0o700;
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Storage backend over a directory on local storage.
///
/// The directory is created with owner-only permissions if absent. The vault
/// instance is assumed to own the directory exclusively for its lifetime.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `root`. Nothing is touched until `init`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name.starts_with('/')
            || name.split('/').any(|part| part.is_empty() || part == "..")
        {
            return Err(Error::Config(format!("invalid storage name: {name}")));
        }

        Ok(self.root.join(name))
    }

    #[cfg(unix)]
    async fn restrict_file(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, std::fs::Permissions::from_mode(FILE_MODE)).await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn restrict_file(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            fs::set_permissions(&self.root, std::fs::Permissions::from_mode(DIR_MODE)).await?;
        }

        Ok(())
    }

    async fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(name)?;

        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(name)?;

        if let Some(parent) = path.parent() {
            if parent != self.root {
                fs::create_dir_all(parent).await?;
            }
        }

        fs::write(&path, data).await?;
        self.restrict_file(&path).await
    }

    async fn delete_file(&self, name: &str) -> Result<bool> {
        let path = self.resolve(name)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let mut result = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(prefix) {
                result.push(name);
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn backend() -> (TempDir, LocalBackend) {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path().join("vault"));
        backend.init().await.unwrap();
        (temp, backend)
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (_temp, backend) = backend().await;

        backend.write_file("a.json", b"payload").await.unwrap();
        let read = backend.read_file("a.json").await.unwrap();

        assert_eq!(read, Some(b"payload".to_vec()));
    }

    #[tokio::test]
    async fn test_missing_file_reads_none() {
        let (_temp, backend) = backend().await;
        assert_eq!(backend.read_file("nope.age").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let (_temp, backend) = backend().await;

        backend.write_file("x.age", b"v").await.unwrap();
        assert!(backend.delete_file("x.age").await.unwrap());
        assert!(!backend.delete_file("x.age").await.unwrap());
    }

    #[tokio::test]
    async fn test_nested_names_create_parents() {
        let (_temp, backend) = backend().await;

        backend.write_file(".bak/x.1.json", b"old").await.unwrap();
        assert_eq!(
            backend.read_file(".bak/x.1.json").await.unwrap(),
            Some(b"old".to_vec())
        );
    }

    #[tokio::test]
    async fn test_list_is_flat_and_filtered() {
        let (_temp, backend) = backend().await;

        backend.write_file("one.json", b"1").await.unwrap();
        backend.write_file("two.json", b"2").await.unwrap();
        backend.write_file(".identity", b"id").await.unwrap();
        backend.write_file(".bak/one.1.json", b"old").await.unwrap();

        let mut all = backend.list_files("").await.unwrap();
        all.sort();
        assert_eq!(all, vec![".identity", "one.json", "two.json"]);

        let dotted = backend.list_files(".").await.unwrap();
        assert_eq!(dotted, vec![".identity"]);
    }

    #[tokio::test]
    async fn test_traversal_names_rejected() {
        let (_temp, backend) = backend().await;

        assert!(backend.read_file("../outside").await.is_err());
        assert!(backend.write_file("/abs", b"x").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp, backend) = backend().await;
        backend.write_file("a.json", b"payload").await.unwrap();

        let dir_mode = std::fs::metadata(&backend.root).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let file_mode = std::fs::metadata(backend.root.join("a.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }
}
