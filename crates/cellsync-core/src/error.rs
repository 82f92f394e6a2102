//! Error types for cellsync-core.

use thiserror::Error;

use crate::graph::{CellId, NotebookId};

/// Result type for cellsync-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cellsync-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Cell is not part of the current virtual document.
    ///
    /// Happens when a cell was deleted between a rebuild and a pending
    /// request. Callers treat it as a stale request.
    #[error("cell not found: {0}")]
    CellNotFound(CellId),

    /// Notebook is not tracked.
    #[error("notebook not found: {0}")]
    NotebookNotFound(NotebookId),

    /// Edit cannot be applied to the notebook (e.g., index out of range).
    #[error("invalid edit: {0}")]
    InvalidEdit(String),
}

impl Error {
    /// Whether this error only means a request raced with a rebuild.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::CellNotFound(_) | Self::NotebookNotFound(_))
    }
}
