//! Query command implementation.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use cellsync_core::CellId;
use cellsync_server::notebook::cell_uri;
use cellsync_server::{Bridge, BridgeConfig, NotebookFile, backend};
use clap::ValueEnum;
use lsp_types::Position;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Request kinds the proxy forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RequestKind {
    Hover,
    Completion,
    Definition,
    SignatureHelp,
}

/// Execute the query command.
pub async fn execute(
    notebook_path: &str,
    request: RequestKind,
    cell: &str,
    line: u32,
    character: u32,
    config: BridgeConfig,
) -> anyhow::Result<()> {
    let path = Path::new(notebook_path);
    if !path.exists() {
        anyhow::bail!("Notebook not found: {}", notebook_path);
    }
    let file = NotebookFile::load(path)
        .with_context(|| format!("Failed to read notebook {}", path.display()))?;

    let cell_id = CellId::new(cell);
    if !file.cells.iter().any(|entry| entry.id == cell_id) {
        anyhow::bail!("Cell not found: {}", cell);
    }

    let root = config.root_dir();
    let connection = Arc::new(
        backend::connect(&config.backend, &root)
            .await
            .with_context(|| format!("Failed to start {}", config.backend.name))?,
    );

    let bridge = Bridge::new(config);
    let proxy = bridge.set_backend(connection.clone());
    let registration = bridge.register_client(connection.clone()).await;
    let id = bridge.open_file(&file).await;

    // Ctrl+C abandons the request.
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let uri = cell_uri(&file.uri, &cell_id);
    let position = Position::new(line, character);
    let response: Value = match request {
        RequestKind::Hover => serde_json::to_value(proxy.hover(&uri, position, cancel).await)?,
        RequestKind::Completion => {
            serde_json::to_value(proxy.completion(&uri, position, None, cancel).await)?
        }
        RequestKind::Definition => {
            serde_json::to_value(proxy.definition(&uri, position, cancel).await)?
        }
        RequestKind::SignatureHelp => {
            serde_json::to_value(proxy.signature_help(&uri, position, None, cancel).await)?
        }
    };
    println!("{}", serde_json::to_string_pretty(&response)?);

    bridge.close_notebook(&id).await?;
    registration.dispose();
    connection.shutdown().await;
    Ok(())
}
