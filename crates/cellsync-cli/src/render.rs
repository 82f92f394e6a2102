//! Render command implementation.
//!
//! Builds a notebook's virtual document offline, without a backend.

use std::path::Path;

use anyhow::Context;
use cellsync_core::{CellId, PositionMapper};
use cellsync_server::{Bridge, BridgeConfig, NotebookFile};
use lsp_types::Position;

use crate::colors;

/// Execute the render command.
pub async fn execute(
    notebook_path: &str,
    cell: Option<&str>,
    line: u32,
    character: u32,
    json: bool,
    config: BridgeConfig,
) -> anyhow::Result<()> {
    let path = Path::new(notebook_path);
    if !path.exists() {
        anyhow::bail!("Notebook not found: {}", notebook_path);
    }

    let file = NotebookFile::load(path)
        .with_context(|| format!("Failed to read notebook {}", path.display()))?;
    let bridge = Bridge::new(config);
    let id = bridge.open_file(&file).await;
    let doc = bridge
        .documents()
        .get(&id)
        .context("Virtual document could not be built")?;

    let mapped = match cell {
        Some(cell) => {
            let mapper = PositionMapper::for_cell(&doc, &CellId::new(cell))
                .with_context(|| format!("Cell not found: {}", cell))?;
            Some((cell, mapper.to_virtual(Position::new(line, character))))
        }
        None => None,
    };

    if json {
        let mut output = serde_json::to_value(doc.as_ref())?;
        if let Some((_, position)) = &mapped {
            output["position"] = serde_json::to_value(position)?;
        }
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "{}Virtual document{} {}{}{}",
        colors::BOLD,
        colors::RESET,
        colors::CYAN,
        doc.uri,
        colors::RESET
    );
    println!("{}", "─".repeat(50));
    for (number, text) in doc.content.split('\n').enumerate() {
        println!("{}{:>4} │{} {}", colors::DIM, number, colors::RESET, text);
    }
    println!("{}", "─".repeat(50));

    for offset in &doc.cell_offsets {
        let plural = if offset.line_count == 1 { "" } else { "s" };
        println!(
            "  {}◆ {}{}  lines {}..{} ({} line{})",
            colors::GREEN,
            offset.cell_id,
            colors::RESET,
            offset.start_line,
            offset.end_line,
            offset.line_count,
            plural
        );
    }

    if let Some((cell, position)) = mapped {
        println!();
        println!(
            "{} ({}, {}) → virtual ({}, {})",
            cell, line, character, position.line, position.character
        );
    }

    Ok(())
}
