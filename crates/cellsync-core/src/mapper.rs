//! Conversion between cell-local and virtual-document coordinates.

use lsp_types::{Position, Range};

use crate::document::{CellOffsetInfo, VirtualDocInfo};
use crate::error::{Error, Result};
use crate::graph::CellId;

/// Maps positions of one cell to and from its virtual document.
///
/// Only lines shift; characters are unchanged because every cell starts at
/// column zero of its own line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionMapper {
    start_line: u32,
    end_line: u32,
}

impl PositionMapper {
    /// Create a mapper for `cell_id` in `doc`.
    ///
    /// Fails with [`Error::CellNotFound`] when the cell is not part of the
    /// current document, which is expected for requests that raced with a
    /// rebuild.
    pub fn for_cell(doc: &VirtualDocInfo, cell_id: &CellId) -> Result<Self> {
        doc.offset_for(cell_id)
            .map(Self::from_offset)
            .ok_or_else(|| Error::CellNotFound(cell_id.clone()))
    }

    pub fn from_offset(offset: &CellOffsetInfo) -> Self {
        Self {
            start_line: offset.start_line,
            end_line: offset.end_line,
        }
    }

    /// Cell-local position to virtual-document position.
    pub fn to_virtual(&self, position: Position) -> Position {
        Position::new(self.start_line.saturating_add(position.line), position.character)
    }

    /// Virtual-document position to cell-local position.
    pub fn from_virtual(&self, position: Position) -> Position {
        Position::new(position.line.saturating_sub(self.start_line), position.character)
    }

    pub fn range_to_virtual(&self, range: Range) -> Range {
        Range::new(self.to_virtual(range.start), self.to_virtual(range.end))
    }

    pub fn range_from_virtual(&self, range: Range) -> Range {
        Range::new(self.from_virtual(range.start), self.from_virtual(range.end))
    }

    /// Whether a virtual-document position falls inside this cell.
    pub fn contains(&self, position: Position) -> bool {
        position.line >= self.start_line && position.line < self.end_line
    }
}
