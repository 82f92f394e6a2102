//! Notebook-to-language-server bridge.
//!
//! Keeps backend language servers' view of dependency-ordered notebooks in
//! sync and proxies position-based requests between cell and virtual-document
//! coordinates.
//!
//! # Architecture
//!
//! - **Workspace**: open notebooks and their variable tables
//! - **Documents**: the virtual document of each notebook and its store
//! - **Sync**: per-client notebook sync notifications
//! - **Protocol**: `notebookDocument/*` message types
//! - **Proxy**: completion, hover, definition and signature help
//! - **Transport**: JSON-RPC over a backend's stdio
//! - **Watcher**: file system monitoring for notebook files

pub mod backend;
pub mod client;
pub mod config;
pub mod documents;
pub mod error;
pub mod notebook;
pub mod protocol;
pub mod proxy;
pub mod store;
pub mod sync;
pub mod transport;
pub mod watcher;
pub mod workspace;

use std::sync::Arc;

use cellsync_core::NotebookId;
use parking_lot::RwLock;

pub use client::{ClientId, ClientNotebookSync, ClientRegistration};
pub use config::{BackendConfig, BridgeConfig, StoreConfig, StoreKind};
pub use documents::VirtualDocuments;
pub use error::{ServerError, ServerResult};
pub use notebook::{CellKind, CellSnapshot, NotebookEdit, NotebookFile, NotebookSnapshot};
pub use proxy::{LanguageBackend, NotebookProxy};
pub use store::{DocumentStore, FsStore, MemoryStore};
pub use sync::SyncEngine;
pub use transport::LspConnection;
pub use watcher::{FileEvent, FileWatcher};
pub use workspace::Workspace;

/// Build the document store a configuration asks for.
pub fn store_from_config(config: &BridgeConfig) -> Arc<dyn DocumentStore> {
    let extension = config.virtual_extension.clone();
    match config.store.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new(extension)),
        StoreKind::Filesystem => match &config.store.dir {
            Some(dir) => Arc::new(FsStore::new(dir.clone(), extension)),
            None => Arc::new(FsStore::in_cache_dir(extension)),
        },
    }
}

/// The sync engine and request proxy wired to one workspace.
pub struct Bridge {
    config: BridgeConfig,
    engine: SyncEngine,
    proxy: RwLock<Option<Arc<NotebookProxy>>>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let store = store_from_config(&config);
        Self::with_store(config, store)
    }

    pub fn with_store(config: BridgeConfig, store: Arc<dyn DocumentStore>) -> Self {
        let workspace = Arc::new(Workspace::new());
        let documents = Arc::new(VirtualDocuments::new(store));
        Self {
            config,
            engine: SyncEngine::new(workspace, documents),
            proxy: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        self.engine.workspace()
    }

    pub fn documents(&self) -> &Arc<VirtualDocuments> {
        self.engine.documents()
    }

    /// Route requests to `backend` from now on.
    pub fn set_backend(&self, backend: Arc<dyn LanguageBackend>) -> Arc<NotebookProxy> {
        let proxy = Arc::new(NotebookProxy::new(
            self.workspace().clone(),
            self.documents().clone(),
            backend,
            self.config.backend.language_id.clone(),
        ));
        *self.proxy.write() = Some(proxy.clone());
        proxy
    }

    pub fn proxy(&self) -> Option<Arc<NotebookProxy>> {
        self.proxy.read().clone()
    }

    /// Register a backend for notebook sync notifications.
    pub async fn register_client(&self, client: Arc<dyn ClientNotebookSync>) -> ClientRegistration {
        self.engine.register_client(client).await
    }

    /// Open the notebook a file describes.
    pub async fn open_file(&self, file: &NotebookFile) -> NotebookId {
        let snapshot = file.snapshot(&self.config.backend.language_id, &self.config.notebook_type);
        let id = snapshot.id.clone();
        self.engine
            .open_notebook(snapshot, file.variables.clone())
            .await;
        id
    }

    /// Bring an open notebook in line with a re-read file.
    ///
    /// The cell list is replaced as one edit; the variable table is only
    /// pushed when it changed. Opens the notebook if it is not open yet.
    pub async fn reload_file(&self, file: &NotebookFile) -> ServerResult<NotebookId> {
        let id = file.notebook_id();
        let Some(current) = self.workspace().get(&id) else {
            return Ok(self.open_file(file).await);
        };

        let cells = file.cell_snapshots(&self.config.backend.language_id);
        self.engine
            .apply_edit(&id, NotebookEdit::ReplaceAll { cells })
            .await?;

        if current.edges != file.variables {
            self.engine
                .update_dependencies(&id, file.variables.clone())
                .await?;
        }
        Ok(id)
    }

    /// Close a notebook for every client and release it in the backend.
    pub async fn close_notebook(&self, id: &NotebookId) -> ServerResult<()> {
        self.engine.close_notebook(id).await?;
        if let Some(proxy) = self.proxy() {
            proxy.release(id).await;
        }
        Ok(())
    }
}
