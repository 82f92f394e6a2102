//! Dependency graph for cell ordering.
//!
//! This module provides:
//! - Stable cell and notebook identifiers
//! - The variable declare/use edge model
//! - Topological ordering of cells

mod sorter;
mod types;

pub use sorter::{DependencyGraph, sort_cells};
pub use types::{CellId, NotebookId, VariableEdge};
