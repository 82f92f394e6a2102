//! Sync command implementation.
//!
//! Starts a backend language server, opens the notebook for it and pushes
//! every change of the notebook file until interrupted.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use cellsync_server::{Bridge, BridgeConfig, FileEvent, FileWatcher, NotebookFile, backend};

use crate::colors;

/// Execute the sync command.
pub async fn execute(notebook_path: &str, config: BridgeConfig) -> anyhow::Result<()> {
    let path = Path::new(notebook_path);
    if !path.exists() {
        anyhow::bail!("Notebook not found: {}", notebook_path);
    }
    let abs_path = path.canonicalize()?;
    let file = NotebookFile::load(&abs_path)
        .with_context(|| format!("Failed to read notebook {}", abs_path.display()))?;

    let root = config.root_dir();
    let connection = Arc::new(
        backend::connect(&config.backend, &root)
            .await
            .with_context(|| format!("Failed to start {}", config.backend.name))?,
    );

    let bridge = Bridge::new(config);
    bridge.set_backend(connection.clone());
    let registration = bridge.register_client(connection.clone()).await;
    let mut id = bridge.open_file(&file).await;

    println!(
        "\n{}cellsync{} - {}{}{}",
        colors::BOLD,
        colors::RESET,
        colors::CYAN,
        abs_path.display(),
        colors::RESET
    );
    println!("{}", "─".repeat(50));
    println!(
        "{}  ◆ Backend:{} {}",
        colors::CYAN,
        colors::RESET,
        connection.name()
    );
    println!(
        "{}Watching for changes... (Ctrl+C to stop){}",
        colors::DIM,
        colors::RESET
    );

    let mut watcher = FileWatcher::new(&abs_path)
        .map_err(|e| anyhow::anyhow!("Failed to create file watcher: {}", e))?;

    loop {
        tokio::select! {
            event = watcher.recv() => match event {
                Some(FileEvent::Modified(_)) => match NotebookFile::load(&abs_path) {
                    Ok(file) => match bridge.reload_file(&file).await {
                        Ok(synced) => {
                            if synced != id {
                                // The notebook was renamed inside the file.
                                bridge.close_notebook(&id).await?;
                                id = synced;
                            }
                            println!("{}Synced{}", colors::GREEN, colors::RESET);
                        }
                        Err(e) => eprintln!("{}Error:{} {}", colors::RED, colors::RESET, e),
                    },
                    Err(e) => eprintln!("{}Error:{} {}", colors::RED, colors::RESET, e),
                },
                Some(FileEvent::Removed(path)) => {
                    eprintln!(
                        "{}Warning:{} Notebook file removed: {}",
                        colors::YELLOW,
                        colors::RESET,
                        path.display()
                    );
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    bridge.close_notebook(&id).await?;
    registration.dispose();
    connection.shutdown().await;
    Ok(())
}
