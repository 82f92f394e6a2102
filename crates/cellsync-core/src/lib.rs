//! Core building blocks for presenting reactive notebooks to linear-document
//! language tooling.
//!
//! This crate provides:
//! - Topological cell ordering from variable declare/use edges
//! - Virtual document construction with per-cell line offsets
//! - Position mapping between cell and virtual-document coordinates

pub mod document;
pub mod error;
pub mod graph;
pub mod mapper;

pub use document::{CellOffsetInfo, CellSource, VirtualDocInfo};
pub use error::{Error, Result};
pub use graph::{CellId, DependencyGraph, NotebookId, VariableEdge, sort_cells};
pub use mapper::PositionMapper;
