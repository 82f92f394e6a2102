//! Backend language server discovery and startup.
//!
//! Looks for the backend executable as given, then in the cellsync cache
//! directory, then on `PATH`.

use std::path::{Path, PathBuf};

use crate::config::BackendConfig;
use crate::error::{ServerError, ServerResult};
use crate::transport::LspConnection;

/// Directory holding cached backend binaries.
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cellsync")
        .join("bin")
}

/// Where a cached copy of `command` would live.
pub fn cached_binary_path(command: &str) -> PathBuf {
    let binary_name = if cfg!(windows) && !command.ends_with(".exe") {
        format!("{}.exe", command)
    } else {
        command.to_string()
    };
    cache_dir().join(binary_name)
}

/// Resolve the backend executable.
pub fn locate(command: &str) -> ServerResult<PathBuf> {
    let explicit = Path::new(command);
    if explicit.components().count() > 1 {
        return if explicit.exists() {
            Ok(explicit.to_path_buf())
        } else {
            Err(ServerError::Config(format!(
                "backend executable not found: {}",
                explicit.display()
            )))
        };
    }

    let cached = cached_binary_path(command);
    if cached.exists() {
        return Ok(cached);
    }

    which::which(command).map_err(|e| {
        ServerError::Config(format!(
            "backend '{}' not found in {} or PATH: {}",
            command,
            cache_dir().display(),
            e
        ))
    })
}

/// Start the backend and complete the initialize handshake.
pub async fn connect(config: &BackendConfig, root: &Path) -> ServerResult<LspConnection> {
    let program = locate(&config.command)?;
    tracing::info!("{} available at: {}", config.name, program.display());

    let connection = LspConnection::spawn(config, &program, root)?;
    connection.initialize(root).await?;
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_dir() {
        let dir = cache_dir();
        assert!(dir.ends_with("cellsync/bin"));
    }

    #[test]
    fn test_missing_explicit_path() {
        let err = locate("/nonexistent/dir/pyright-langserver").unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[test]
    fn test_unknown_command() {
        assert!(locate("cellsync-no-such-language-server").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_path_lookup() {
        let found = locate("sh").unwrap();
        assert!(found.is_absolute());
    }
}
