//! Backend clients that receive notebook sync notifications.
//!
//! Each backend adapter implements [`ClientNotebookSync`]; the sync engine
//! wraps it in a [`ManagedClient`] that owns the client's own cell counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use cellsync_core::NotebookId;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::ServerResult;
use crate::protocol::{
    DidChangeNotebookDocumentParams, DidCloseNotebookDocumentParams,
    DidOpenNotebookDocumentParams,
};

/// Capability a backend adapter provides to receive notebook notifications.
#[async_trait]
pub trait ClientNotebookSync: Send + Sync {
    /// Human-readable backend name, used in logs and errors.
    fn name(&self) -> &str;

    async fn did_open_notebook(&self, params: DidOpenNotebookDocumentParams) -> ServerResult<()>;

    async fn did_change_notebook(
        &self,
        params: DidChangeNotebookDocumentParams,
    ) -> ServerResult<()>;

    async fn did_close_notebook(&self, params: DidCloseNotebookDocumentParams) -> ServerResult<()>;
}

/// Identifier of a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client_{}", self.0)
    }
}

/// Number of cells last reported to one client, per notebook.
///
/// A missing entry means the notebook is untracked for that client.
pub type CellCountsMap = FxHashMap<NotebookId, usize>;

/// One registered backend connection and its private sync state.
pub struct ManagedClient {
    id: ClientId,
    sync: Arc<dyn ClientNotebookSync>,
    /// Serialization point for this client's read-modify-write cycles.
    counts: Mutex<CellCountsMap>,
}

impl ManagedClient {
    fn new(id: ClientId, sync: Arc<dyn ClientNotebookSync>) -> Self {
        Self {
            id,
            sync,
            counts: Mutex::new(CellCountsMap::default()),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.sync.name()
    }

    pub fn sync(&self) -> &dyn ClientNotebookSync {
        self.sync.as_ref()
    }

    /// Lock this client's counts for one atomic sync step.
    ///
    /// Hold the guard across computing and sending a notification so two
    /// notifications are never derived from the same previous count.
    pub async fn lock_counts(&self) -> MutexGuard<'_, CellCountsMap> {
        self.counts.lock().await
    }

    /// Last count reported for `notebook`, or `None` if untracked.
    pub async fn reported_count(&self, notebook: &NotebookId) -> Option<usize> {
        self.counts.lock().await.get(notebook).copied()
    }
}

/// The set of registered clients.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<Vec<Arc<ManagedClient>>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client with empty state.
    pub fn register(&self, sync: Arc<dyn ClientNotebookSync>) -> Arc<ManagedClient> {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let client = Arc::new(ManagedClient::new(id, sync));
        self.clients.write().push(client.clone());
        tracing::info!("Registered client {} ({})", id, client.name());
        client
    }

    /// Remove a client. Returns false if it was not registered.
    pub fn unregister(&self, id: ClientId) -> bool {
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|c| c.id != id);
        let removed = clients.len() != before;
        if removed {
            tracing::info!("Unregistered client {}", id);
        }
        removed
    }

    /// Snapshot of the registered clients.
    pub fn clients(&self) -> Vec<Arc<ManagedClient>> {
        self.clients.read().clone()
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<ManagedClient>> {
        self.clients.read().iter().find(|c| c.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

/// Keeps a client registered; dropping it unregisters the client.
#[must_use = "dropping the registration unregisters the client"]
pub struct ClientRegistration {
    id: ClientId,
    registry: Weak<ClientRegistry>,
}

impl ClientRegistration {
    pub(crate) fn new(id: ClientId, registry: &Arc<ClientRegistry>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Unregister now.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for ClientRegistration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullClient;

    #[async_trait]
    impl ClientNotebookSync for NullClient {
        fn name(&self) -> &str {
            "null"
        }

        async fn did_open_notebook(&self, _: DidOpenNotebookDocumentParams) -> ServerResult<()> {
            Ok(())
        }

        async fn did_change_notebook(
            &self,
            _: DidChangeNotebookDocumentParams,
        ) -> ServerResult<()> {
            Ok(())
        }

        async fn did_close_notebook(&self, _: DidCloseNotebookDocumentParams) -> ServerResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_assigns_distinct_ids() {
        let registry = ClientRegistry::new();
        let a = registry.register(Arc::new(NullClient));
        let b = registry.register(Arc::new(NullClient));
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
        assert_eq!(a.name(), "null");
    }

    #[test]
    fn test_registration_drop_unregisters() {
        let registry = Arc::new(ClientRegistry::new());
        let client = registry.register(Arc::new(NullClient));
        let registration = ClientRegistration::new(client.id(), &registry);

        assert!(registry.get(client.id()).is_some());
        registration.dispose();
        assert!(registry.get(client.id()).is_none());
        assert!(!registry.unregister(client.id()));
    }

    #[tokio::test]
    async fn test_counts_are_per_client() {
        let registry = ClientRegistry::new();
        let a = registry.register(Arc::new(NullClient));
        let b = registry.register(Arc::new(NullClient));
        let nb = NotebookId::new("nb");

        a.lock_counts().await.insert(nb.clone(), 3);
        assert_eq!(a.reported_count(&nb).await, Some(3));
        assert_eq!(b.reported_count(&nb).await, None);
    }
}
