//! Virtual documents per notebook.
//!
//! Rebuilds a notebook's [`VirtualDocInfo`] from its latest state, swaps it
//! in atomically and writes the content to the [`DocumentStore`]. Rebuilds
//! of one notebook are serialized, so the store always ends up holding the
//! newest content.

use std::sync::Arc;

use cellsync_core::{CellSource, NotebookId, VirtualDocInfo};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex as TokioMutex;

use crate::error::ServerResult;
use crate::store::DocumentStore;
use crate::workspace::{NotebookState, Workspace};

/// Current virtual document of every open notebook.
pub struct VirtualDocuments {
    store: Arc<dyn DocumentStore>,
    docs: RwLock<FxHashMap<NotebookId, Arc<VirtualDocInfo>>>,
    /// Held across build, swap and store write.
    rebuild_locks: Mutex<FxHashMap<NotebookId, Arc<TokioMutex<()>>>>,
}

impl VirtualDocuments {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            docs: RwLock::new(FxHashMap::default()),
            rebuild_locks: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    fn rebuild_lock(&self, id: &NotebookId) -> Arc<TokioMutex<()>> {
        self.rebuild_locks
            .lock()
            .entry(id.clone())
            .or_default()
            .clone()
    }

    /// Build the virtual document for `state` without storing it.
    pub fn build(&self, state: &NotebookState) -> ServerResult<VirtualDocInfo> {
        let uri = self.store.uri_for(&state.snapshot.id)?;
        let sorted = state.sorted_cells();
        Ok(VirtualDocInfo::build(
            uri,
            sorted.iter().map(|cell| CellSource::new(&cell.id, &cell.text)),
        ))
    }

    /// Rebuild a notebook's virtual document from the workspace's current
    /// state. Returns `None` if the notebook is no longer open.
    pub async fn refresh(
        &self,
        workspace: &Workspace,
        id: &NotebookId,
    ) -> ServerResult<Option<Arc<VirtualDocInfo>>> {
        let lock = self.rebuild_lock(id);
        let _guard = lock.lock().await;
        // Read under the lock: a rebuild queued behind this one sees a newer state.
        let Some(state) = workspace.get(id) else {
            return Ok(None);
        };
        self.rebuild_unlocked(&state).await.map(Some)
    }

    /// Rebuild, swap in and persist the virtual document for `state`.
    pub async fn rebuild(&self, state: &NotebookState) -> ServerResult<Arc<VirtualDocInfo>> {
        let lock = self.rebuild_lock(&state.snapshot.id);
        let _guard = lock.lock().await;
        self.rebuild_unlocked(state).await
    }

    async fn rebuild_unlocked(&self, state: &NotebookState) -> ServerResult<Arc<VirtualDocInfo>> {
        let doc = Arc::new(self.build(state)?);
        self.docs
            .write()
            .insert(state.snapshot.id.clone(), doc.clone());

        let changed = self.store.write(&doc.uri, &doc.content).await?;
        tracing::debug!(
            "Rebuilt virtual document for {} ({} cells, {} lines, changed: {})",
            state.snapshot.id,
            doc.cell_offsets.len(),
            doc.line_count(),
            changed
        );
        Ok(doc)
    }

    pub fn get(&self, id: &NotebookId) -> Option<Arc<VirtualDocInfo>> {
        self.docs.read().get(id).cloned()
    }

    /// The current virtual document, building it first if there is none.
    pub async fn get_or_build(&self, state: &NotebookState) -> ServerResult<Arc<VirtualDocInfo>> {
        if let Some(doc) = self.get(&state.snapshot.id) {
            return Ok(doc);
        }
        let lock = self.rebuild_lock(&state.snapshot.id);
        let _guard = lock.lock().await;
        match self.get(&state.snapshot.id) {
            Some(doc) => Ok(doc),
            None => self.rebuild_unlocked(state).await,
        }
    }

    /// Forget a notebook's virtual document and drop it from the store.
    pub async fn remove(&self, id: &NotebookId) -> ServerResult<Option<Arc<VirtualDocInfo>>> {
        let lock = self.rebuild_lock(id);
        let _guard = lock.lock().await;
        let removed = self.docs.write().remove(id);
        if let Some(doc) = &removed {
            self.store.remove(&doc.uri).await?;
        }
        self.rebuild_locks.lock().remove(id);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::{CellSnapshot, NotebookSnapshot, cell_uri};
    use crate::store::MemoryStore;
    use cellsync_core::{CellId, VariableEdge};
    use lsp_types::Url;

    fn state() -> NotebookState {
        let uri = Url::parse("file:///work/nb.ipynb").unwrap();
        let cell = |id: &str, text: &str| {
            CellSnapshot::code(id, cell_uri(&uri, &CellId::new(id)), "python", text)
        };
        NotebookState::new(
            NotebookSnapshot {
                id: NotebookId::new("nb"),
                uri: uri.clone(),
                notebook_type: "jupyter-notebook".to_string(),
                version: 0,
                cells: vec![cell("B", "y = x + 1"), cell("A", "x = 1")],
            },
            vec![VariableEdge::new("x", ["A"], ["B"])],
        )
    }

    #[tokio::test]
    async fn test_rebuild_writes_sorted_content() {
        let store = Arc::new(MemoryStore::new("py"));
        let documents = VirtualDocuments::new(store.clone());

        let doc = documents.rebuild(&state()).await.unwrap();
        assert_eq!(doc.content, "x = 1\ny = x + 1");
        assert_eq!(doc.cell_offsets[0].cell_id.as_str(), "A");

        let stored = store.read(&doc.uri).await.unwrap();
        assert_eq!(stored.as_deref(), Some("x = 1\ny = x + 1"));
    }

    #[tokio::test]
    async fn test_rebuild_swaps_snapshot() {
        let documents = VirtualDocuments::new(Arc::new(MemoryStore::new("py")));
        let mut state = state();

        let first = documents.rebuild(&state).await.unwrap();
        state.snapshot.cells[0].text = "y = x * 2".to_string();
        let second = documents.rebuild(&state).await.unwrap();

        assert_eq!(first.content, "x = 1\ny = x + 1");
        assert_eq!(second.content, "x = 1\ny = x * 2");
        let current = documents.get(&NotebookId::new("nb")).unwrap();
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[tokio::test]
    async fn test_refresh_reads_current_state() {
        let store = Arc::new(MemoryStore::new("py"));
        let documents = VirtualDocuments::new(store.clone());
        let workspace = Workspace::new();
        let id = NotebookId::new("nb");
        workspace.insert(state());

        let mut stale = state();
        stale.snapshot.cells[0].text = "y = 0".to_string();
        documents.rebuild(&stale).await.unwrap();

        let doc = documents.refresh(&workspace, &id).await.unwrap().unwrap();
        assert_eq!(doc.content, "x = 1\ny = x + 1");
        let stored = store.read(&doc.uri).await.unwrap();
        assert_eq!(stored.as_deref(), Some("x = 1\ny = x + 1"));

        workspace.remove(&id);
        assert!(documents.refresh(&workspace, &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_or_build_reuses_existing() {
        let documents = VirtualDocuments::new(Arc::new(MemoryStore::new("py")));
        let state = state();
        let built = documents.get_or_build(&state).await.unwrap();
        let again = documents.get_or_build(&state).await.unwrap();
        assert!(Arc::ptr_eq(&built, &again));
    }

    #[tokio::test]
    async fn test_remove_drops_stored_content() {
        let store = Arc::new(MemoryStore::new("py"));
        let documents = VirtualDocuments::new(store.clone());
        let doc = documents.rebuild(&state()).await.unwrap();

        assert!(documents.remove(&NotebookId::new("nb")).await.unwrap().is_some());
        assert!(documents.get(&NotebookId::new("nb")).is_none());
        assert!(store.read(&doc.uri).await.unwrap().is_none());
    }
}
