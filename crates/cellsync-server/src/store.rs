//! Virtual document storage.
//!
//! Backends index virtual documents from wherever a store puts them: an
//! in-process map, or one file per notebook on disk. Writes are idempotent;
//! rewriting identical content is a no-op so the backend's analysis state is
//! left alone.

use std::hash::Hasher;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cellsync_core::NotebookId;
use lsp_types::Url;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};

use crate::error::{ServerError, ServerResult};

/// URI scheme used by [`MemoryStore`].
pub const MEMORY_SCHEME: &str = "cellsync";

/// Backing store for virtual document content.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// The URI the virtual document of `notebook` lives at.
    fn uri_for(&self, notebook: &NotebookId) -> ServerResult<Url>;

    /// Store `content` at `uri`. Returns whether anything changed.
    async fn write(&self, uri: &Url, content: &str) -> ServerResult<bool>;

    /// Read back the content at `uri`.
    async fn read(&self, uri: &Url) -> ServerResult<Option<String>>;

    /// Drop the document at `uri`. Missing documents are not an error.
    async fn remove(&self, uri: &Url) -> ServerResult<()>;
}

/// File name for a notebook's virtual document.
///
/// Keeps the notebook's file stem for readability and appends a hash of the
/// full id so two notebooks with the same name never collide.
pub fn virtual_file_name(notebook: &NotebookId, extension: &str) -> String {
    let mut hasher = FxHasher::default();
    hasher.write(notebook.as_str().as_bytes());
    let hash = hasher.finish();

    let stem: String = notebook
        .as_str()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .split(['.', '#', '?'])
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    let stem = if stem.is_empty() { "notebook" } else { stem.as_str() };

    format!("{}-{:016x}.{}", stem, hash, extension)
}

/// In-process store, for backends fed over the protocol only.
pub struct MemoryStore {
    extension: String,
    documents: RwLock<FxHashMap<Url, String>>,
}

impl MemoryStore {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            documents: RwLock::new(FxHashMap::default()),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn uri_for(&self, notebook: &NotebookId) -> ServerResult<Url> {
        let raw = format!(
            "{}:///{}",
            MEMORY_SCHEME,
            virtual_file_name(notebook, &self.extension)
        );
        Url::parse(&raw).map_err(|e| ServerError::Store {
            uri: raw,
            message: e.to_string(),
        })
    }

    async fn write(&self, uri: &Url, content: &str) -> ServerResult<bool> {
        let mut documents = self.documents.write();
        if documents.get(uri).is_some_and(|existing| existing == content) {
            return Ok(false);
        }
        documents.insert(uri.clone(), content.to_string());
        Ok(true)
    }

    async fn read(&self, uri: &Url) -> ServerResult<Option<String>> {
        Ok(self.documents.read().get(uri).cloned())
    }

    async fn remove(&self, uri: &Url) -> ServerResult<()> {
        self.documents.write().remove(uri);
        Ok(())
    }
}

/// One UTF-8 file per notebook in a directory.
pub struct FsStore {
    dir: PathBuf,
    extension: String,
}

impl FsStore {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    /// Store under the user cache directory.
    pub fn in_cache_dir(extension: impl Into<String>) -> Self {
        Self::new(default_store_dir(), extension)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(uri: &Url) -> ServerResult<PathBuf> {
        uri.to_file_path().map_err(|_| ServerError::Store {
            uri: uri.to_string(),
            message: "not a file URI".to_string(),
        })
    }
}

/// Default directory for virtual document files.
pub fn default_store_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cellsync")
        .join("virtual")
}

#[async_trait]
impl DocumentStore for FsStore {
    fn uri_for(&self, notebook: &NotebookId) -> ServerResult<Url> {
        let path = self.dir.join(virtual_file_name(notebook, &self.extension));
        Url::from_file_path(&path).map_err(|_| ServerError::Store {
            uri: path.display().to_string(),
            message: "store directory must be an absolute path".to_string(),
        })
    }

    async fn write(&self, uri: &Url, content: &str) -> ServerResult<bool> {
        let path = Self::path_of(uri)?;
        let io_err = |e: std::io::Error| ServerError::Io {
            path: path.clone(),
            message: e.to_string(),
        };

        match tokio::fs::read_to_string(&path).await {
            Ok(existing) if existing == content => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&path, content).await.map_err(io_err)?;
        tracing::debug!("Wrote virtual document {}", path.display());
        Ok(true)
    }

    async fn read(&self, uri: &Url) -> ServerResult<Option<String>> {
        let path = Self::path_of(uri)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServerError::Io {
                path,
                message: e.to_string(),
            }),
        }
    }

    async fn remove(&self, uri: &Url) -> ServerResult<()> {
        let path = Self::path_of(uri)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::Io {
                path,
                message: e.to_string(),
            }),
        }
    }
}
