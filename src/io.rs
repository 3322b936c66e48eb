//! Store I/O: the `IOManager` trait with filesystem and in-memory backends

use crate::error::{ConvertError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
    /// Process memory, used for dry runs and tests
    Memory,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        match url.find("://") {
            Some(scheme_end) => match &url[..scheme_end] {
                "file" => Ok(StorageBackend::FileSystem),
                "memory" => Ok(StorageBackend::Memory),
                scheme => Err(ConvertError::InvalidConfig(format!(
                    "unsupported output scheme {:?}; only local paths are written",
                    scheme
                ))),
            },
            None => Ok(StorageBackend::FileSystem),
        }
    }
}

/// Result of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// New bytes were stored
    Written,
    /// The stored bytes already matched; nothing was touched
    Unchanged,
}

/// Key/value access to a store, keys are `/`-separated relative paths
#[async_trait]
pub trait IOManager: Send + Sync {
    /// Read data from a path
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write data to a path. Readers never observe partial content.
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Delete data at a path
    async fn delete(&self, path: &str) -> Result<()>;

    /// List the entries directly below a prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get the size of data at a path
    async fn size(&self, path: &str) -> Result<usize>;

    /// Remove every key in the store
    async fn clear(&self) -> Result<()>;

    /// Get the backend type
    fn backend(&self) -> StorageBackend;

    /// Write only if the stored bytes differ from `data`
    async fn write_if_changed(&self, path: &str, data: &[u8]) -> Result<WriteOutcome> {
        if self.exists(path).await?
            && self.size(path).await? == data.len()
            && self.read(path).await?.as_ref() == data
        {
            return Ok(WriteOutcome::Unchanged);
        }
        self.write(path, data).await?;
        Ok(WriteOutcome::Written)
    }
}

/// File system I/O manager
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    /// Create a new file system I/O manager
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the full path for a relative path
    fn full_path(&self, path: &str) -> PathBuf {
        let mut full = self.base_path.clone();
        full.extend(path.split('/').filter(|p| !p.is_empty()));
        full
    }

    /// Hidden sibling used as the staging file for an atomic write
    fn staging_path(full_path: &Path) -> PathBuf {
        let name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        full_path.with_file_name(format!(".{}.{}.partial", name, Uuid::new_v4().simple()))
    }
}

#[async_trait]
impl IOManager for FileSystemIOManager {
    async fn read(&self, path: &str) -> Result<Bytes> {
        let data = fs::read(self.full_path(path)).await?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let staging = Self::staging_path(&full_path);
        let result = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(data).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&staging, &full_path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(path)).await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.full_path(path)).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(prefix);
        let mut entries = Vec::new();

        let mut read_dir = match fs::read_dir(&full_path).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }
        entries.sort();
        Ok(entries)
    }

    async fn size(&self, path: &str) -> Result<usize> {
        let metadata = fs::metadata(self.full_path(path)).await?;
        Ok(metadata.len() as usize)
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.base_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }
}

/// In-memory I/O manager
#[derive(Default)]
pub struct MemoryIOManager {
    entries: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryIOManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys currently stored, in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    fn not_found(path: &str) -> ConvertError {
        ConvertError::Io(std::io::Error::new(
            IoErrorKind::NotFound,
            format!("no such key: {}", path),
        ))
    }
}

#[async_trait]
impl IOManager for MemoryIOManager {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.entries
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Self::not_found(path))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.entries
            .write()
            .insert(path.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.entries.read().contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.entries
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = prefix.trim_end_matches('/');
        let dir = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        let mut names: Vec<String> = self
            .entries
            .read()
            .keys()
            .filter_map(|k| k.strip_prefix(dir.as_str()))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();
        names.dedup();
        Ok(names)
    }

    async fn size(&self, path: &str) -> Result<usize> {
        self.entries
            .read()
            .get(path)
            .map(Bytes::len)
            .ok_or_else(|| Self::not_found(path))
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

/// Parse an output location and create the matching I/O manager
pub fn create_io_manager(url: &str) -> Result<Box<dyn IOManager>> {
    match StorageBackend::from_url(url)? {
        StorageBackend::FileSystem => {
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Box::new(FileSystemIOManager::new(path)))
        }
        StorageBackend::Memory => Ok(Box::new(MemoryIOManager::new())),
    }
}
