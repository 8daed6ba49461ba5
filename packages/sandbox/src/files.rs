// ABOUTME: Resolution of input-file byte sources and copying them into a sandbox input directory
// ABOUTME: FileStore abstracts external attachment storage; LocalFileStore serves keys from a directory

use crate::error::{Result, SandboxError};
use crate::types::InputSource;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Byte-addressable storage for input files referenced by key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Size in bytes, used to enforce the input cap before reading.
    async fn size(&self, key: &str) -> Result<u64>;

    async fn read(&self, key: &str) -> Result<Vec<u8>>;
}

pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let plain = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !plain {
            return Err(SandboxError::Input(format!("invalid storage key: {}", key)));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn size(&self, key: &str) -> Result<u64> {
        let path = self.resolve(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| SandboxError::Input(format!("{}: {}", key, e)))?;
        Ok(meta.len())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| SandboxError::Input(format!("{}: {}", key, e)))
    }
}

/// Copies input bytes to their place in a sandbox input directory, enforcing a size cap.
#[derive(Clone)]
pub struct InputMaterializer {
    store: Option<Arc<dyn FileStore>>,
    max_bytes: u64,
}

impl InputMaterializer {
    pub fn new(store: Option<Arc<dyn FileStore>>, max_bytes: u64) -> Self {
        Self { store, max_bytes }
    }

    fn check_size(&self, name: &str, size: u64) -> Result<()> {
        if size > self.max_bytes {
            return Err(SandboxError::Input(format!(
                "{} is {} bytes, limit is {}",
                name, size, self.max_bytes
            )));
        }
        Ok(())
    }

    /// Write `source` to `dest`, returning the number of bytes written.
    pub async fn materialize(&self, name: &str, source: &InputSource, dest: &Path) -> Result<u64> {
        let size = match source {
            InputSource::Inline(bytes) => {
                self.check_size(name, bytes.len() as u64)?;
                tokio::fs::write(dest, bytes).await?;
                bytes.len() as u64
            }
            InputSource::Path(path) => {
                let meta = tokio::fs::metadata(path)
                    .await
                    .map_err(|e| SandboxError::Input(format!("{}: {}", path.display(), e)))?;
                if !meta.is_file() {
                    return Err(SandboxError::Input(format!(
                        "{} is not a regular file",
                        path.display()
                    )));
                }
                self.check_size(name, meta.len())?;
                tokio::fs::copy(path, dest).await?
            }
            InputSource::Stored(key) => {
                let store = self.store.as_ref().ok_or_else(|| {
                    SandboxError::Input(format!("no file store configured for key {}", key))
                })?;
                self.check_size(name, store.size(key).await?)?;
                let bytes = store.read(key).await?;
                self.check_size(name, bytes.len() as u64)?;
                tokio::fs::write(dest, &bytes).await?;
                bytes.len() as u64
            }
        };
        debug!("Materialized input {} -> {} ({} bytes)", name, dest.display(), size);
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_inline_over_cap_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let materializer = InputMaterializer::new(None, 4);
        let err = materializer
            .materialize("big.csv", &InputSource::Inline(vec![0; 5]), &dir.path().join("big.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Input(_)));
        assert!(!dir.path().join("big.csv").exists());
    }

    #[tokio::test]
    async fn test_stored_source_reads_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockFileStore::new();
        store.expect_size().with(eq("att-1")).returning(|_| Ok(5));
        store
            .expect_read()
            .with(eq("att-1"))
            .returning(|_| Ok(b"a,b\n1".to_vec()));

        let materializer = InputMaterializer::new(Some(Arc::new(store)), 1024);
        let dest = dir.path().join("data.csv");
        let written = materializer
            .materialize("data.csv", &InputSource::Stored("att-1".into()), &dest)
            .await
            .unwrap();
        assert_eq!(written, 5);
        assert_eq!(std::fs::read(&dest).unwrap(), b"a,b\n1");
    }

    #[tokio::test]
    async fn test_stored_source_size_checked_before_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockFileStore::new();
        store.expect_size().returning(|_| Ok(10_000));
        store.expect_read().never();

        let materializer = InputMaterializer::new(Some(Arc::new(store)), 1024);
        let result = materializer
            .materialize("x", &InputSource::Stored("k".into()), &dir.path().join("x"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_local_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        assert!(store.read("../etc/passwd").await.is_err());
        assert!(store.read("/etc/passwd").await.is_err());

        std::fs::write(dir.path().join("ok.txt"), "fine").unwrap();
        assert_eq!(store.read("ok.txt").await.unwrap(), b"fine");
        assert_eq!(store.size("ok.txt").await.unwrap(), 4);
    }
}
