//! End-to-end tests for cellsync CLI commands.

#![allow(deprecated)] // Command::cargo_bin

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

/// A notebook description in a temporary directory.
struct TestNotebook {
    temp_dir: TempDir,
    notebook_path: PathBuf,
}

impl TestNotebook {
    fn new(source: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let notebook_path = temp_dir.path().join("notebook.json");
        fs::write(&notebook_path, source).expect("Failed to write notebook");

        Self {
            temp_dir,
            notebook_path,
        }
    }

    fn path(&self) -> &str {
        self.notebook_path.to_str().unwrap()
    }

    fn write_config(&self, source: &str) -> PathBuf {
        let path = self.temp_dir.path().join("cellsync.json");
        fs::write(&path, source).expect("Failed to write config");
        path
    }
}

/// Cells in display order `B, A`; `B` uses `x` from `A`.
fn reordered_notebook() -> String {
    r#"{
    "uri": "file:///work/analysis.ipynb",
    "cells": [
        {"id": "B", "text": "y = x + 1\nprint(y)"},
        {"id": "notes", "text": "Some prose", "kind": "markup"},
        {"id": "A", "text": "import os\nx = 1\n"}
    ],
    "variables": [
        {"name": "x", "declared_by": ["A"], "used_by": ["B"]}
    ]
}"#
    .to_string()
}

fn cellsync() -> Command {
    Command::cargo_bin("cellsync").expect("Failed to find cellsync binary")
}

// =============================================================================
// cellsync render Tests
// =============================================================================

#[test]
fn test_render_nonexistent_notebook() {
    cellsync()
        .args(["render", "/nonexistent/notebook.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Notebook not found"));
}

#[test]
fn test_render_orders_by_dependencies() {
    let notebook = TestNotebook::new(&reordered_notebook());

    cellsync()
        .args(["render", notebook.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("import os"))
        .stdout(predicate::str::contains("A").and(predicate::str::contains("lines 0..3")))
        .stdout(predicate::str::contains("lines 3..5"))
        .stdout(predicate::str::contains("Some prose").not());
}

#[test]
fn test_render_json_offsets() {
    let notebook = TestNotebook::new(&reordered_notebook());

    let output = cellsync()
        .args(["render", notebook.path(), "--json"])
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success());

    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["content"], "import os\nx = 1\n\ny = x + 1\nprint(y)");
    let offsets = doc["cell_offsets"].as_array().unwrap();
    assert_eq!(offsets.len(), 2);
    assert_eq!(offsets[0]["cell_id"], "A");
    assert_eq!(offsets[0]["line_count"], 3);
    assert_eq!(offsets[1]["cell_id"], "B");
    assert_eq!(offsets[1]["start_line"], 3);
}

#[test]
fn test_render_maps_position() {
    let notebook = TestNotebook::new(&reordered_notebook());

    let output = cellsync()
        .args([
            "render",
            notebook.path(),
            "--json",
            "--cell",
            "B",
            "--line",
            "1",
            "--character",
            "2",
        ])
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success());

    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["position"], serde_json::json!({"line": 4, "character": 2}));
}

#[test]
fn test_render_unknown_cell() {
    let notebook = TestNotebook::new(&reordered_notebook());

    cellsync()
        .args(["render", notebook.path(), "--cell", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cell not found"));
}

#[test]
fn test_render_filesystem_store() {
    let notebook = TestNotebook::new(&reordered_notebook());
    let store_dir = notebook.temp_dir.path().join("virtual");
    let config = notebook.write_config(&format!(
        r#"{{"store": {{"kind": "filesystem", "dir": {}}}, "virtual_extension": "pyi"}}"#,
        serde_json::to_string(&store_dir).unwrap()
    ));

    cellsync()
        .args(["--config", config.to_str().unwrap(), "render", notebook.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains(".pyi"));

    let written: Vec<_> = fs::read_dir(&store_dir).unwrap().collect();
    assert_eq!(written.len(), 1);
}

#[test]
fn test_invalid_config() {
    let notebook = TestNotebook::new(&reordered_notebook());
    let config = notebook.write_config("{ not json");

    cellsync()
        .args(["--config", config.to_str().unwrap(), "render", notebook.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}

// =============================================================================
// cellsync query Tests
// =============================================================================

#[test]
fn test_query_missing_backend() {
    let notebook = TestNotebook::new(&reordered_notebook());

    cellsync()
        .args([
            "query",
            notebook.path(),
            "hover",
            "--cell",
            "B",
            "--backend",
            "cellsync-no-such-language-server",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_query_unknown_cell() {
    let notebook = TestNotebook::new(&reordered_notebook());

    cellsync()
        .args(["query", notebook.path(), "definition", "--cell", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cell not found"));
}
