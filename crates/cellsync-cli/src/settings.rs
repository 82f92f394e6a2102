//! Configuration loading and command-line overrides.

use std::path::{Path, PathBuf};

use anyhow::Context;
use cellsync_server::BridgeConfig;
use clap::Args;

/// Backend overrides shared by commands that talk to a language server.
#[derive(Args, Debug, Default)]
pub struct BackendArgs {
    /// Backend executable (name on PATH or path)
    #[arg(long = "backend")]
    pub command: Option<String>,

    /// Argument passed to the backend (repeatable)
    #[arg(long = "backend-arg", allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Workspace root announced to the backend
    #[arg(long)]
    pub root: Option<PathBuf>,
}

/// Load the configuration file, if any, then apply command-line overrides.
pub fn load(path: Option<&Path>, backend: Option<&BackendArgs>) -> anyhow::Result<BridgeConfig> {
    let mut config = match path {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    if let Some(backend) = backend {
        if let Some(command) = &backend.command {
            config.backend.command = command.clone();
            config.backend.name = Path::new(command)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| command.clone());
            // A different server does not take the default's arguments.
            config.backend.args.clear();
        }
        if !backend.args.is_empty() {
            config.backend.args = backend.args.clone();
        }
        if let Some(root) = &backend.root {
            config.root_dir = Some(root.clone());
        }
    }

    Ok(config)
}
