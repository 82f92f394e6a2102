//! Notebook sync protocol engine.
//!
//! Keeps every registered backend client's view of every open notebook in
//! step with the dependency order. Structural changes are sent as a single
//! replace-all: delete every cell the client was last told about, then
//! insert the full sorted list with full text. Diffing two topological orders
//! is not attempted.
//!
//! # Per-client state
//!
//! ```text
//! Untracked ──didOpen──► Tracked(k) ──structure/deps──► Tracked(n)
//!     ▲                      │
//!     └───────didClose───────┘
//! ```
//!
//! Each client owns its own counts behind its own lock. One step (read the
//! previous count, sort the latest notebook state, send, record the new
//! count) runs under that lock, so concurrent triggers serialize per client
//! and never interleave. A failed send only affects the client it was for.

use std::sync::Arc;

use cellsync_core::{CellId, NotebookId, VariableEdge};
use futures::future::join_all;
use lsp_types::{
    TextDocumentContentChangeEvent, TextDocumentIdentifier, VersionedTextDocumentIdentifier,
};

use crate::client::{
    CellCountsMap, ClientId, ClientNotebookSync, ClientRegistration, ClientRegistry,
    ManagedClient,
};
use crate::documents::VirtualDocuments;
use crate::error::ServerResult;
use crate::notebook::{CellSnapshot, EditKind, NotebookEdit, NotebookSnapshot};
use crate::protocol::{
    DidChangeNotebookDocumentParams, DidCloseNotebookDocumentParams,
    DidOpenNotebookDocumentParams, NotebookCellArrayChange, NotebookDocument,
    NotebookDocumentCellChange, NotebookDocumentCellChangeStructure,
    NotebookDocumentChangeEvent, NotebookDocumentChangeTextContent, NotebookDocumentIdentifier,
    VersionedNotebookDocumentIdentifier,
};
use crate::workspace::{NotebookState, Workspace};

/// Notification for a newly tracked notebook.
pub fn did_open_params(
    snapshot: &NotebookSnapshot,
    sorted: &[&CellSnapshot],
) -> DidOpenNotebookDocumentParams {
    DidOpenNotebookDocumentParams {
        notebook_document: NotebookDocument {
            uri: snapshot.uri.clone(),
            notebook_type: snapshot.notebook_type.clone(),
            version: snapshot.version,
            metadata: None,
            cells: sorted.iter().map(|c| c.notebook_cell()).collect(),
        },
        cell_text_documents: sorted
            .iter()
            .map(|c| c.text_document_item(snapshot.version))
            .collect(),
    }
}

/// Replace-all notification: delete `previous` cells at 0, insert `sorted` at 0.
pub fn replace_all_params(
    snapshot: &NotebookSnapshot,
    sorted: &[&CellSnapshot],
    previous: usize,
    closed: Vec<TextDocumentIdentifier>,
) -> DidChangeNotebookDocumentParams {
    let structure = NotebookDocumentCellChangeStructure {
        array: NotebookCellArrayChange {
            start: 0,
            delete_count: u32::try_from(previous).unwrap_or(u32::MAX),
            cells: Some(sorted.iter().map(|c| c.notebook_cell()).collect()),
        },
        did_open: Some(
            sorted
                .iter()
                .map(|c| c.text_document_item(snapshot.version))
                .collect(),
        ),
        did_close: (!closed.is_empty()).then_some(closed),
    };

    DidChangeNotebookDocumentParams {
        notebook_document: versioned_identifier(snapshot),
        change: NotebookDocumentChangeEvent {
            metadata: None,
            cells: Some(NotebookDocumentCellChange {
                structure: Some(structure),
                data: None,
                text_content: None,
            }),
        },
    }
}

/// Full-text replacement of the given cells, without structural changes.
pub fn text_change_params(
    snapshot: &NotebookSnapshot,
    cells: &[&CellSnapshot],
) -> DidChangeNotebookDocumentParams {
    let text_content = cells
        .iter()
        .map(|c| NotebookDocumentChangeTextContent {
            document: VersionedTextDocumentIdentifier::new(c.uri.clone(), snapshot.version),
            changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: c.text.clone(),
            }],
        })
        .collect();

    DidChangeNotebookDocumentParams {
        notebook_document: versioned_identifier(snapshot),
        change: NotebookDocumentChangeEvent {
            metadata: None,
            cells: Some(NotebookDocumentCellChange {
                structure: None,
                data: None,
                text_content: Some(text_content),
            }),
        },
    }
}

/// Notification for a closed notebook.
pub fn did_close_params(snapshot: &NotebookSnapshot) -> DidCloseNotebookDocumentParams {
    DidCloseNotebookDocumentParams {
        notebook_document: NotebookDocumentIdentifier {
            uri: snapshot.uri.clone(),
        },
        cell_text_documents: snapshot
            .code_cells()
            .map(|c| c.text_document_identifier())
            .collect(),
    }
}

fn versioned_identifier(snapshot: &NotebookSnapshot) -> VersionedNotebookDocumentIdentifier {
    VersionedNotebookDocumentIdentifier {
        version: snapshot.version,
        uri: snapshot.uri.clone(),
    }
}

/// Drives per-client notebook sync from editor and dependency events.
pub struct SyncEngine {
    workspace: Arc<Workspace>,
    documents: Arc<VirtualDocuments>,
    clients: Arc<ClientRegistry>,
}

impl SyncEngine {
    pub fn new(workspace: Arc<Workspace>, documents: Arc<VirtualDocuments>) -> Self {
        Self {
            workspace,
            documents,
            clients: Arc::new(ClientRegistry::new()),
        }
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    pub fn documents(&self) -> &Arc<VirtualDocuments> {
        &self.documents
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Register a backend client.
    ///
    /// Notebooks that are already open are opened for the new client right
    /// away. Dropping the returned registration unregisters the client.
    pub async fn register_client(&self, sync: Arc<dyn ClientNotebookSync>) -> ClientRegistration {
        let client = self.clients.register(sync);
        for state in self.workspace.notebooks() {
            self.open_for_client(&client, &state.snapshot.id).await;
        }
        ClientRegistration::new(client.id(), &self.clients)
    }

    pub fn unregister_client(&self, id: ClientId) -> bool {
        self.clients.unregister(id)
    }

    /// Start tracking a notebook and open it for every client.
    pub async fn open_notebook(&self, snapshot: NotebookSnapshot, edges: Vec<VariableEdge>) {
        let id = snapshot.id.clone();
        self.workspace.insert(NotebookState::new(snapshot, edges));
        self.rebuild_document(&id).await;

        let clients = self.clients.clients();
        join_all(clients.iter().map(|client| self.open_for_client(client, &id))).await;
    }

    /// Stop tracking a notebook and close it for every client tracking it.
    pub async fn close_notebook(&self, id: &NotebookId) -> ServerResult<()> {
        let state = self
            .workspace
            .remove(id)
            .ok_or_else(|| cellsync_core::Error::NotebookNotFound(id.clone()))?;

        if let Err(e) = self.documents.remove(id).await {
            tracing::warn!("Failed to remove virtual document for {}: {}", id, e);
        }

        let clients = self.clients.clients();
        join_all(
            clients
                .iter()
                .map(|client| self.close_for_client(client, &state.snapshot)),
        )
        .await;
        Ok(())
    }

    /// Apply a raw edit from the editor and sync every client.
    pub async fn apply_edit(&self, id: &NotebookId, edit: NotebookEdit) -> ServerResult<()> {
        let (_, (kind, removed)) = self.workspace.update(id, |current| {
            let applied = current.snapshot.apply(&edit)?;
            Ok((
                NotebookState::new(applied.snapshot, current.edges.clone()),
                (applied.kind, applied.removed),
            ))
        })?;
        self.rebuild_document(id).await;

        let clients = self.clients.clients();
        match kind {
            EditKind::Structural => {
                let closed: Vec<TextDocumentIdentifier> = removed
                    .iter()
                    .filter(|c| c.is_code())
                    .map(|c| c.text_document_identifier())
                    .collect();
                join_all(
                    clients
                        .iter()
                        .map(|client| self.sync_structure(client, id, closed.clone())),
                )
                .await;
            }
            EditKind::Text(cells) if !cells.is_empty() => {
                join_all(
                    clients
                        .iter()
                        .map(|client| self.sync_text(client, id, &cells)),
                )
                .await;
            }
            EditKind::Text(_) => {}
        }
        Ok(())
    }

    /// Replace a notebook's variable table and resync every client.
    pub async fn update_dependencies(
        &self,
        id: &NotebookId,
        edges: Vec<VariableEdge>,
    ) -> ServerResult<()> {
        self.workspace.update(id, |current| {
            let mut snapshot = current.snapshot.clone();
            snapshot.version = snapshot.version.saturating_add(1);
            Ok((NotebookState::new(snapshot, edges), ()))
        })?;
        self.rebuild_document(id).await;

        let clients = self.clients.clients();
        join_all(
            clients
                .iter()
                .map(|client| self.sync_structure(client, id, Vec::new())),
        )
        .await;
        Ok(())
    }

    async fn rebuild_document(&self, id: &NotebookId) {
        if let Err(e) = self.documents.refresh(&self.workspace, id).await {
            tracing::warn!("Failed to rebuild virtual document for {}: {}", id, e);
        }
    }

    /// Untracked → Tracked(k). A client already tracking the notebook gets a
    /// replace-all instead.
    async fn open_for_client(&self, client: &ManagedClient, id: &NotebookId) {
        let mut counts = client.lock_counts().await;
        let Some(state) = self.workspace.get(id) else {
            return;
        };

        if counts.contains_key(id) {
            Self::replace_all(client, &mut counts, &state, Vec::new()).await;
            return;
        }

        let sorted = state.sorted_cells();
        let params = did_open_params(&state.snapshot, &sorted);
        match client.sync().did_open_notebook(params).await {
            Ok(()) => {
                counts.insert(id.clone(), sorted.len());
                tracing::debug!("Opened {} for {} ({} cells)", id, client.name(), sorted.len());
            }
            Err(e) => {
                tracing::warn!("Failed to open {} for {}: {}", id, client.name(), e);
            }
        }
    }

    /// Tracked(_) → Untracked.
    async fn close_for_client(&self, client: &ManagedClient, snapshot: &NotebookSnapshot) {
        let mut counts = client.lock_counts().await;
        if counts.remove(&snapshot.id).is_none() {
            return;
        }

        if let Err(e) = client.sync().did_close_notebook(did_close_params(snapshot)).await {
            tracing::warn!("Failed to close {} for {}: {}", snapshot.id, client.name(), e);
        }
    }

    /// Tracked(prev) → Tracked(new) with one replace-all notification.
    async fn sync_structure(
        &self,
        client: &ManagedClient,
        id: &NotebookId,
        closed: Vec<TextDocumentIdentifier>,
    ) {
        let mut counts = client.lock_counts().await;
        let Some(state) = self.workspace.get(id) else {
            return;
        };
        Self::replace_all(client, &mut counts, &state, closed).await;
    }

    async fn replace_all(
        client: &ManagedClient,
        counts: &mut CellCountsMap,
        state: &NotebookState,
        closed: Vec<TextDocumentIdentifier>,
    ) {
        let id = &state.snapshot.id;
        let Some(&previous) = counts.get(id) else {
            return;
        };

        let sorted = state.sorted_cells();
        if previous == 0 && sorted.is_empty() {
            return;
        }

        let params = replace_all_params(&state.snapshot, &sorted, previous, closed);
        match client.sync().did_change_notebook(params).await {
            Ok(()) => {
                tracing::debug!(
                    "Synced {} for {}: deleted {}, inserted {}",
                    id,
                    client.name(),
                    previous,
                    sorted.len()
                );
                counts.insert(id.clone(), sorted.len());
            }
            Err(e) => {
                // Keep the previous count: the client never saw the new cells.
                tracing::warn!("Failed to sync {} for {}: {}", id, client.name(), e);
            }
        }
    }

    /// Forward text-only edits to a tracking client; counts are unchanged.
    ///
    /// A client whose cell array is behind (its last replace-all failed)
    /// gets a replace-all instead, since it does not know every edited cell.
    async fn sync_text(&self, client: &ManagedClient, id: &NotebookId, cells: &[CellId]) {
        let mut counts = client.lock_counts().await;
        let Some(&reported) = counts.get(id) else {
            return;
        };
        let Some(state) = self.workspace.get(id) else {
            return;
        };
        if reported != state.sorted_cells().len() {
            tracing::debug!("{} is behind on {}, resending all cells", client.name(), id);
            Self::replace_all(client, &mut counts, &state, Vec::new()).await;
            return;
        }

        let changed: Vec<&CellSnapshot> = cells
            .iter()
            .filter_map(|cell| state.snapshot.cell(cell))
            .filter(|c| c.is_code())
            .collect();
        if changed.is_empty() {
            return;
        }

        let params = text_change_params(&state.snapshot, &changed);
        if let Err(e) = client.sync().did_change_notebook(params).await {
            tracing::warn!("Failed to send text change of {} to {}: {}", id, client.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::cell_uri;
    use lsp_types::Url;

    fn snapshot() -> NotebookSnapshot {
        let uri = Url::parse("file:///work/nb.ipynb").unwrap();
        let cell = |id: &str, text: &str| {
            CellSnapshot::code(id, cell_uri(&uri, &CellId::new(id)), "python", text)
        };
        NotebookSnapshot {
            id: NotebookId::new("nb"),
            uri: uri.clone(),
            notebook_type: "jupyter-notebook".to_string(),
            version: 7,
            cells: vec![cell("B", "y = x + 1"), cell("A", "x = 1")],
        }
    }

    #[test]
    fn test_replace_all_params_shape() {
        let nb = snapshot();
        let sorted: Vec<&CellSnapshot> = vec![&nb.cells[1], &nb.cells[0]];
        let closed = vec![TextDocumentIdentifier::new(
            Url::parse("file:///work/nb.ipynb#gone").unwrap(),
        )];

        let params = replace_all_params(&nb, &sorted, 3, closed);
        assert_eq!(params.notebook_document.version, 7);

        let structure = params.change.cells.unwrap().structure.unwrap();
        assert_eq!(structure.array.start, 0);
        assert_eq!(structure.array.delete_count, 3);
        let inserted = structure.array.cells.unwrap();
        assert_eq!(inserted.len(), 2);
        assert_eq!(inserted[0].document.fragment(), Some("A"));

        let opened = structure.did_open.unwrap();
        assert_eq!(opened[0].text, "x = 1");
        assert_eq!(opened[1].text, "y = x + 1");
        assert_eq!(structure.did_close.unwrap().len(), 1);
    }

    #[test]
    fn test_replace_all_without_closed_cells() {
        let nb = snapshot();
        let params = replace_all_params(&nb, &[], 2, Vec::new());
        let structure = params.change.cells.unwrap().structure.unwrap();
        assert!(structure.did_close.is_none());
        assert_eq!(structure.array.cells.unwrap().len(), 0);
    }

    #[test]
    fn test_text_change_params() {
        let nb = snapshot();
        let params = text_change_params(&nb, &[&nb.cells[0]]);
        let cells = params.change.cells.unwrap();
        assert!(cells.structure.is_none());
        let content = cells.text_content.unwrap();
        assert_eq!(content[0].document.version, 7);
        assert_eq!(content[0].changes[0].text, "y = x + 1");
        assert!(content[0].changes[0].range.is_none());
    }

    #[test]
    fn test_did_open_and_close_params() {
        let nb = snapshot();
        let sorted: Vec<&CellSnapshot> = vec![&nb.cells[1], &nb.cells[0]];
        let open = did_open_params(&nb, &sorted);
        assert_eq!(open.notebook_document.notebook_type, "jupyter-notebook");
        assert_eq!(open.notebook_document.cells.len(), 2);
        assert_eq!(open.cell_text_documents[0].version, 7);

        let close = did_close_params(&nb);
        assert_eq!(close.cell_text_documents.len(), 2);
    }
}
