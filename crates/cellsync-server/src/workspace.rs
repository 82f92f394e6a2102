//! Open notebooks and their latest dependency tables.
//!
//! State is held as immutable `Arc` snapshots that are swapped on update, so
//! concurrent readers always see one consistent version.

use std::sync::Arc;

use cellsync_core::{CellId, Error as CoreError, NotebookId, VariableEdge};
use lsp_types::Url;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::ServerResult;
use crate::notebook::{CellSnapshot, NotebookSnapshot};

/// A notebook together with the variable edges last reported for it.
#[derive(Debug, Clone)]
pub struct NotebookState {
    pub snapshot: NotebookSnapshot,
    pub edges: Vec<VariableEdge>,
}

impl NotebookState {
    pub fn new(snapshot: NotebookSnapshot, edges: Vec<VariableEdge>) -> Self {
        Self { snapshot, edges }
    }

    /// Code cells in dependency order.
    pub fn sorted_cells(&self) -> Vec<&CellSnapshot> {
        self.snapshot.sorted_code_cells(&self.edges)
    }
}

/// Owning notebook and cell of a cell document.
#[derive(Debug, Clone)]
pub struct CellLocation {
    pub notebook: Arc<NotebookState>,
    pub cell_id: CellId,
}

/// Registry of open notebooks.
#[derive(Default)]
pub struct Workspace {
    notebooks: RwLock<FxHashMap<NotebookId, Arc<NotebookState>>>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a notebook.
    pub fn insert(&self, state: NotebookState) -> Arc<NotebookState> {
        let state = Arc::new(state);
        self.notebooks
            .write()
            .insert(state.snapshot.id.clone(), state.clone());
        state
    }

    pub fn remove(&self, id: &NotebookId) -> Option<Arc<NotebookState>> {
        self.notebooks.write().remove(id)
    }

    pub fn get(&self, id: &NotebookId) -> Option<Arc<NotebookState>> {
        self.notebooks.read().get(id).cloned()
    }

    pub fn contains(&self, id: &NotebookId) -> bool {
        self.notebooks.read().contains_key(id)
    }

    /// All open notebooks.
    pub fn notebooks(&self) -> Vec<Arc<NotebookState>> {
        self.notebooks.read().values().cloned().collect()
    }

    /// Replace a notebook's state through `update`, atomically.
    ///
    /// Updates to the same notebook never interleave: the closure sees the
    /// state left by the previous update.
    pub fn update<R>(
        &self,
        id: &NotebookId,
        update: impl FnOnce(&NotebookState) -> ServerResult<(NotebookState, R)>,
    ) -> ServerResult<(Arc<NotebookState>, R)> {
        let mut notebooks = self.notebooks.write();
        let current = notebooks
            .get(id)
            .ok_or_else(|| CoreError::NotebookNotFound(id.clone()))?;
        let (next, result) = update(current)?;
        let next = Arc::new(next);
        notebooks.insert(id.clone(), next.clone());
        Ok((next, result))
    }

    /// Find the notebook and cell a cell document belongs to.
    pub fn locate_cell(&self, uri: &Url) -> Option<CellLocation> {
        self.notebooks.read().values().find_map(|state| {
            state.snapshot.cell_by_uri(uri).map(|cell| CellLocation {
                notebook: state.clone(),
                cell_id: cell.id.clone(),
            })
        })
    }
}
