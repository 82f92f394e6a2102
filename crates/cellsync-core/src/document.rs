//! Virtual document builder.
//!
//! Concatenates notebook cells in dependency order into one linear text
//! buffer and records where each cell landed, so that linear-document
//! tooling can analyze the notebook as if it were a single source file.

use lsp_types::Url;
use serde::Serialize;

use crate::graph::CellId;

/// Cell content handed to the builder, already in dependency order.
#[derive(Debug, Clone, Copy)]
pub struct CellSource<'a> {
    pub id: &'a CellId,
    pub text: &'a str,
}

impl<'a> CellSource<'a> {
    pub fn new(id: &'a CellId, text: &'a str) -> Self {
        Self { id, text }
    }
}

/// Where a cell's text lives inside the virtual document.
///
/// Line numbers are zero-based; `end_line` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellOffsetInfo {
    pub cell_id: CellId,
    /// Position of the cell within the virtual document.
    pub cell_index: usize,
    pub start_line: u32,
    pub end_line: u32,
    pub line_count: u32,
}

impl CellOffsetInfo {
    /// Whether a virtual-document line belongs to this cell.
    pub fn contains_line(&self, line: u32) -> bool {
        line >= self.start_line && line < self.end_line
    }
}

/// A notebook rendered as one linear document.
///
/// Never patched in place: every rebuild produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualDocInfo {
    pub uri: Url,
    pub content: String,
    pub cell_offsets: Vec<CellOffsetInfo>,
}

/// Number of `\n`-delimited lines in `text`. An empty cell still occupies one line.
fn count_lines(text: &str) -> u32 {
    let lines = text.bytes().filter(|&b| b == b'\n').count() + 1;
    u32::try_from(lines).unwrap_or(u32::MAX)
}

impl VirtualDocInfo {
    /// Build the virtual document from cells in dependency order.
    ///
    /// Cells are joined with a single newline, so each cell starts on the
    /// line right after the previous one ends.
    pub fn build<'a>(uri: Url, cells: impl IntoIterator<Item = CellSource<'a>>) -> Self {
        let mut content = String::new();
        let mut cell_offsets = Vec::new();
        let mut cursor = 0u32;

        for (cell_index, cell) in cells.into_iter().enumerate() {
            if cell_index > 0 {
                content.push('\n');
            }
            content.push_str(cell.text);

            let line_count = count_lines(cell.text);
            let start_line = cursor;
            cursor = cursor.saturating_add(line_count);

            cell_offsets.push(CellOffsetInfo {
                cell_id: cell.id.clone(),
                cell_index,
                start_line,
                end_line: cursor,
                line_count,
            });
        }

        Self {
            uri,
            content,
            cell_offsets,
        }
    }

    /// Offsets of a cell, if it is part of this document.
    pub fn offset_for(&self, cell_id: &CellId) -> Option<&CellOffsetInfo> {
        self.cell_offsets.iter().find(|o| &o.cell_id == cell_id)
    }

    /// The cell whose line span contains a virtual-document line.
    pub fn cell_at_line(&self, line: u32) -> Option<&CellOffsetInfo> {
        // Offsets are contiguous and sorted by start line.
        let index = self
            .cell_offsets
            .partition_point(|o| o.end_line <= line);
        self.cell_offsets
            .get(index)
            .filter(|o| o.contains_line(line))
    }

    /// Total number of lines in the document.
    pub fn line_count(&self) -> u32 {
        self.cell_offsets.last().map(|o| o.end_line).unwrap_or(0)
    }

    /// Cell ids in document order.
    pub fn cell_ids(&self) -> impl Iterator<Item = &CellId> {
        self.cell_offsets.iter().map(|o| &o.cell_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri() -> Url {
        Url::parse("file:///tmp/notebook.py").unwrap()
    }

    fn build(cells: &[(&str, &str)]) -> VirtualDocInfo {
        let ids: Vec<CellId> = cells.iter().map(|(id, _)| CellId::new(*id)).collect();
        VirtualDocInfo::build(
            uri(),
            ids.iter()
                .zip(cells)
                .map(|(id, (_, text))| CellSource::new(id, text)),
        )
    }

    #[test]
    fn test_two_cells_offsets() {
        let doc = build(&[("a", "x = 1\ny = 2\nz = 3"), ("b", "w = x\nprint(w)")]);

        assert_eq!(doc.content, "x = 1\ny = 2\nz = 3\nw = x\nprint(w)");
        assert_eq!(doc.cell_offsets.len(), 2);
        assert_eq!((doc.cell_offsets[0].start_line, doc.cell_offsets[0].end_line), (0, 3));
        assert_eq!((doc.cell_offsets[1].start_line, doc.cell_offsets[1].end_line), (3, 5));
        assert_eq!(doc.cell_offsets[1].cell_index, 1);
        assert_eq!(doc.line_count(), 5);
        assert_eq!(doc.content.split('\n').count(), 5);
    }

    #[test]
    fn test_offsets_are_contiguous() {
        let doc = build(&[("a", ""), ("b", "one\n"), ("c", "1\n2\n3"), ("d", "x")]);

        assert_eq!(doc.cell_offsets[0].start_line, 0);
        for pair in doc.cell_offsets.windows(2) {
            assert_eq!(pair[0].end_line, pair[1].start_line);
        }
        for offset in &doc.cell_offsets {
            assert_eq!(offset.end_line - offset.start_line, offset.line_count);
        }
        assert_eq!(doc.line_count() as usize, doc.content.split('\n').count());
    }

    #[test]
    fn test_empty_cell_occupies_one_line() {
        let doc = build(&[("a", "")]);
        assert_eq!(doc.cell_offsets[0].line_count, 1);
        assert_eq!(doc.content, "");
    }

    #[test]
    fn test_trailing_newline_adds_line() {
        let doc = build(&[("a", "x = 1\n"), ("b", "y")]);
        assert_eq!(doc.cell_offsets[0].line_count, 2);
        assert_eq!(doc.cell_offsets[1].start_line, 2);
        assert_eq!(doc.content, "x = 1\n\ny");
    }

    #[test]
    fn test_cell_at_line() {
        let doc = build(&[("a", "1\n2\n3"), ("b", "4\n5"), ("c", "6")]);
        assert_eq!(doc.cell_at_line(0).unwrap().cell_id.as_str(), "a");
        assert_eq!(doc.cell_at_line(2).unwrap().cell_id.as_str(), "a");
        assert_eq!(doc.cell_at_line(3).unwrap().cell_id.as_str(), "b");
        assert_eq!(doc.cell_at_line(5).unwrap().cell_id.as_str(), "c");
        assert!(doc.cell_at_line(6).is_none());
    }

    #[test]
    fn test_empty_document() {
        let doc = build(&[]);
        assert!(doc.content.is_empty());
        assert!(doc.cell_offsets.is_empty());
        assert_eq!(doc.line_count(), 0);
        assert!(doc.cell_at_line(0).is_none());
    }

    #[test]
    fn test_offset_for() {
        let doc = build(&[("a", "1"), ("b", "2")]);
        assert_eq!(doc.offset_for(&CellId::new("b")).unwrap().start_line, 1);
        assert!(doc.offset_for(&CellId::new("missing")).is_none());
    }
}
