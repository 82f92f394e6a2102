//! Bridge configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// How to launch and address the backend language server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Display name used in logs.
    pub name: String,
    /// Executable name or path.
    pub command: String,
    /// Extra command-line arguments.
    pub args: Vec<String>,
    /// Notebook type announced to the backend, overriding the editor's.
    pub notebook_type: Option<String>,
    /// Language id of cells and virtual documents.
    pub language_id: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: "ruff".to_string(),
            command: "ruff".to_string(),
            args: vec!["server".to_string()],
            notebook_type: None,
            language_id: "python".to_string(),
        }
    }
}

/// Where virtual documents are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// In-process only; the backend sees content through the protocol.
    #[default]
    Memory,
    /// One file per notebook on disk.
    Filesystem,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Directory for [`StoreKind::Filesystem`]. Defaults to the user cache dir.
    pub dir: Option<PathBuf>,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub backend: BackendConfig,
    pub store: StoreConfig,
    /// File extension of virtual documents.
    pub virtual_extension: String,
    /// Workspace root announced to the backend.
    pub root_dir: Option<PathBuf>,
    /// Notebook type used when the notebook does not name one.
    pub notebook_type: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            store: StoreConfig::default(),
            virtual_extension: "py".to_string(),
            root_dir: None,
            notebook_type: "jupyter-notebook".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| ServerError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&source)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Workspace root, falling back to the current directory.
    pub fn root_dir(&self) -> PathBuf {
        self.root_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
