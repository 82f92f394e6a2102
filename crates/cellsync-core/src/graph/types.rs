//! Types for the dependency graph.

use serde::{Deserialize, Serialize};

/// Stable identifier for a cell within a notebook.
///
/// Survives reordering and is unrelated to the cell's position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CellId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Stable identifier for a notebook document.
///
/// Distinct from the document URI, which may change (e.g., on rename).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotebookId(String);

impl NotebookId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NotebookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NotebookId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NotebookId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Declarations and uses of one variable across the notebook.
///
/// Supplied by the kernel's analysis pass; one entry per variable name.
/// `declared_by` and `used_by` have set semantics, duplicates are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableEdge {
    /// Variable name.
    pub name: String,
    /// Cells that declare the variable.
    #[serde(default)]
    pub declared_by: Vec<CellId>,
    /// Cells that read the variable.
    #[serde(default)]
    pub used_by: Vec<CellId>,
}

impl VariableEdge {
    pub fn new(
        name: impl Into<String>,
        declared_by: impl IntoIterator<Item = impl Into<CellId>>,
        used_by: impl IntoIterator<Item = impl Into<CellId>>,
    ) -> Self {
        Self {
            name: name.into(),
            declared_by: declared_by.into_iter().map(Into::into).collect(),
            used_by: used_by.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_id_display() {
        assert_eq!(CellId::new("abc").to_string(), "abc");
        assert_eq!(CellId::from("abc"), CellId::new(String::from("abc")));
    }

    #[test]
    fn test_variable_edge_deserialize() {
        let json = r#"{"name": "x", "declared_by": ["A"], "used_by": ["B", "C"]}"#;
        let edge: VariableEdge = serde_json::from_str(json).unwrap();
        assert_eq!(edge, VariableEdge::new("x", ["A"], ["B", "C"]));
    }

    #[test]
    fn test_variable_edge_missing_sets() {
        let edge: VariableEdge = serde_json::from_str(r#"{"name": "unused"}"#).unwrap();
        assert!(edge.declared_by.is_empty());
        assert!(edge.used_by.is_empty());
    }
}
