//! Host notebook model.
//!
//! Snapshots of the editor's notebook documents and the raw edits that move
//! them forward. Edits are pure: applying one returns a new snapshot.

use std::path::Path;

use cellsync_core::{CellId, Error as CoreError, NotebookId, VariableEdge, sort_cells};
use lsp_types::{TextDocumentIdentifier, TextDocumentItem, Url};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};
use crate::protocol::{NotebookCell, NotebookCellKind};

/// Kind of a notebook cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    /// Source code; takes part in ordering and analysis.
    #[default]
    Code,
    /// Markdown or other prose; skipped by language tooling.
    Markup,
}

/// One cell of a notebook as the host editor sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellSnapshot {
    pub id: CellId,
    /// Document URI of the cell (what the editor sends with requests).
    pub uri: Url,
    pub kind: CellKind,
    pub language_id: String,
    pub text: String,
}

impl CellSnapshot {
    /// Create a code cell.
    pub fn code(
        id: impl Into<CellId>,
        uri: Url,
        language_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            uri,
            kind: CellKind::Code,
            language_id: language_id.into(),
            text: text.into(),
        }
    }

    pub fn is_code(&self) -> bool {
        self.kind == CellKind::Code
    }

    /// The cell as an opened text document.
    pub fn text_document_item(&self, version: i32) -> TextDocumentItem {
        TextDocumentItem::new(
            self.uri.clone(),
            self.language_id.clone(),
            version,
            self.text.clone(),
        )
    }

    pub fn text_document_identifier(&self) -> TextDocumentIdentifier {
        TextDocumentIdentifier::new(self.uri.clone())
    }

    /// The cell as an entry of a notebook's cell array.
    pub fn notebook_cell(&self) -> NotebookCell {
        NotebookCell {
            kind: match self.kind {
                CellKind::Code => NotebookCellKind::Code,
                CellKind::Markup => NotebookCellKind::Markup,
            },
            document: self.uri.clone(),
            metadata: None,
            execution_summary: None,
        }
    }
}

/// A notebook document at one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotebookSnapshot {
    pub id: NotebookId,
    pub uri: Url,
    pub notebook_type: String,
    pub version: i32,
    /// Cells in document (display) order.
    pub cells: Vec<CellSnapshot>,
}

/// What an applied edit changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditKind {
    /// Cell count, order, kind or identity changed.
    Structural,
    /// Only the text of these cells changed.
    Text(Vec<CellId>),
}

/// Result of applying a [`NotebookEdit`].
#[derive(Debug, Clone)]
pub struct AppliedEdit {
    pub snapshot: NotebookSnapshot,
    pub kind: EditKind,
    /// Cells that are no longer part of the notebook.
    pub removed: Vec<CellSnapshot>,
}

/// A raw edit from the host editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotebookEdit {
    /// Insert cells before `index`.
    InsertCells { index: usize, cells: Vec<CellSnapshot> },
    /// Delete `count` cells starting at `start`.
    DeleteCells { start: usize, count: usize },
    /// Move the cell at `from` so it ends up at `to`.
    MoveCell { from: usize, to: usize },
    /// Replace the full text of one cell.
    ReplaceText { cell: CellId, text: String },
    /// Replace the whole cell list.
    ReplaceAll { cells: Vec<CellSnapshot> },
}

impl NotebookSnapshot {
    /// Code cells in document order.
    pub fn code_cells(&self) -> impl Iterator<Item = &CellSnapshot> {
        self.cells.iter().filter(|c| c.is_code())
    }

    pub fn cell(&self, id: &CellId) -> Option<&CellSnapshot> {
        self.cells.iter().find(|c| &c.id == id)
    }

    pub fn cell_by_uri(&self, uri: &Url) -> Option<&CellSnapshot> {
        self.cells.iter().find(|c| &c.uri == uri)
    }

    /// Code cells in dependency order.
    pub fn sorted_code_cells(&self, edges: &[VariableEdge]) -> Vec<&CellSnapshot> {
        let ids: Vec<CellId> = self.code_cells().map(|c| c.id.clone()).collect();
        sort_cells(&ids, edges)
            .iter()
            .filter_map(|id| self.cell(id))
            .collect()
    }

    /// Apply an edit, producing the next version of the notebook.
    pub fn apply(&self, edit: &NotebookEdit) -> ServerResult<AppliedEdit> {
        let mut cells = self.cells.clone();

        match edit {
            NotebookEdit::InsertCells { index, cells: inserted } => {
                if *index > cells.len() {
                    return Err(invalid(format!(
                        "insert index {} out of range for {} cells",
                        index,
                        cells.len()
                    )));
                }
                cells.splice(*index..*index, inserted.iter().cloned());
            }
            NotebookEdit::DeleteCells { start, count } => {
                let end = start.saturating_add(*count);
                if end > cells.len() {
                    return Err(invalid(format!(
                        "delete range {}..{} out of range for {} cells",
                        start,
                        end,
                        cells.len()
                    )));
                }
                cells.drain(*start..end);
            }
            NotebookEdit::MoveCell { from, to } => {
                if *from >= cells.len() || *to >= cells.len() {
                    return Err(invalid(format!(
                        "move {} -> {} out of range for {} cells",
                        from,
                        to,
                        cells.len()
                    )));
                }
                let cell = cells.remove(*from);
                cells.insert(*to, cell);
            }
            NotebookEdit::ReplaceText { cell, text } => {
                let target = cells
                    .iter_mut()
                    .find(|c| &c.id == cell)
                    .ok_or_else(|| CoreError::CellNotFound(cell.clone()))?;
                target.text = text.clone();
            }
            NotebookEdit::ReplaceAll { cells: replacement } => {
                cells = replacement.clone();
            }
        }

        let mut seen = FxHashSet::default();
        if let Some(dup) = cells.iter().find(|c| !seen.insert(&c.id)) {
            return Err(invalid(format!("duplicate cell id '{}'", dup.id)));
        }

        let kind = classify(&self.cells, &cells);
        let remaining: FxHashSet<&CellId> = cells.iter().map(|c| &c.id).collect();
        let removed = self
            .cells
            .iter()
            .filter(|c| !remaining.contains(&c.id))
            .cloned()
            .collect();

        Ok(AppliedEdit {
            snapshot: NotebookSnapshot {
                id: self.id.clone(),
                uri: self.uri.clone(),
                notebook_type: self.notebook_type.clone(),
                version: self.version.saturating_add(1),
                cells,
            },
            kind,
            removed,
        })
    }
}

fn invalid(message: String) -> ServerError {
    ServerError::Core(CoreError::InvalidEdit(message))
}

/// Compare two cell lists: structural if the (id, kind) sequence differs.
fn classify(before: &[CellSnapshot], after: &[CellSnapshot]) -> EditKind {
    let same_structure = before.len() == after.len()
        && before
            .iter()
            .zip(after)
            .all(|(a, b)| a.id == b.id && a.kind == b.kind);

    if !same_structure {
        return EditKind::Structural;
    }

    EditKind::Text(
        before
            .iter()
            .zip(after)
            .filter(|(a, b)| a.text != b.text)
            .map(|(_, b)| b.id.clone())
            .collect(),
    )
}

/// Build the URI of a cell from its notebook's URI.
///
/// The cell id becomes the fragment, mirroring how editors address cells.
pub fn cell_uri(notebook_uri: &Url, cell_id: &CellId) -> Url {
    let mut uri = notebook_uri.clone();
    uri.set_fragment(Some(cell_id.as_str()));
    uri
}

/// One cell entry of a notebook file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellEntry {
    pub id: CellId,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub kind: CellKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_id: Option<String>,
}

/// On-disk JSON description of a notebook plus its variable table.
///
/// Used by the command-line driver; editors feed snapshots directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotebookFile {
    pub uri: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_type: Option<String>,
    #[serde(default)]
    pub cells: Vec<CellEntry>,
    #[serde(default)]
    pub variables: Vec<VariableEdge>,
}

impl NotebookFile {
    /// Read a notebook file from disk.
    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| ServerError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(serde_json::from_str(&source)?)
    }

    pub fn notebook_id(&self) -> NotebookId {
        NotebookId::new(self.uri.as_str())
    }

    /// Cells as host snapshots, filling in defaults.
    pub fn cell_snapshots(&self, default_language_id: &str) -> Vec<CellSnapshot> {
        self.cells
            .iter()
            .map(|entry| CellSnapshot {
                id: entry.id.clone(),
                uri: cell_uri(&self.uri, &entry.id),
                kind: entry.kind,
                language_id: entry
                    .language_id
                    .clone()
                    .unwrap_or_else(|| default_language_id.to_string()),
                text: entry.text.clone(),
            })
            .collect()
    }

    /// The notebook as a snapshot at version 0.
    pub fn snapshot(&self, default_language_id: &str, default_notebook_type: &str) -> NotebookSnapshot {
        NotebookSnapshot {
            id: self.notebook_id(),
            uri: self.uri.clone(),
            notebook_type: self
                .notebook_type
                .clone()
                .unwrap_or_else(|| default_notebook_type.to_string()),
            version: 0,
            cells: self.cell_snapshots(default_language_id),
        }
    }
}
