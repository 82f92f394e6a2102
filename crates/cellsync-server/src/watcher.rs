//! File watcher for notebook description files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify_debouncer_mini::{DebounceEventResult, new_debouncer, notify::RecursiveMode};
use tokio::sync::mpsc;

use crate::error::{ServerError, ServerResult};

/// Quiet period before a burst of writes is reported once.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// File change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// File was written or replaced.
    Modified(PathBuf),
    /// File was removed.
    Removed(PathBuf),
}

/// Watches a single file.
pub struct FileWatcher {
    /// Kept alive to keep watching.
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    rx: mpsc::UnboundedReceiver<FileEvent>,
}

impl FileWatcher {
    /// Watch `path`. Its parent directory is watched so editors that replace
    /// the file on save are still followed.
    pub fn new(path: impl AsRef<Path>) -> ServerResult<Self> {
        let target = std::path::absolute(path.as_ref()).map_err(|e| ServerError::Io {
            path: path.as_ref().to_path_buf(),
            message: e.to_string(),
        })?;
        let watch_dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        // Event paths are reported with symlinks resolved.
        let watch_dir = watch_dir.canonicalize().unwrap_or(watch_dir);
        let file = match target.file_name() {
            Some(name) => watch_dir.join(name),
            None => target.clone(),
        };

        let (tx, rx) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(DEBOUNCE, move |result: DebounceEventResult| {
            let events = match result {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!("Watch error: {}", e);
                    return;
                }
            };

            // One event per burst is enough.
            if !events.iter().any(|event| event.path == file) {
                return;
            }
            let event = if file.exists() {
                FileEvent::Modified(file.clone())
            } else {
                FileEvent::Removed(file.clone())
            };
            let _ = tx.send(event);
        })
        .map_err(|e| ServerError::Watch(e.to_string()))?;

        debouncer
            .watcher()
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| ServerError::Watch(e.to_string()))?;

        tracing::debug!("Watching {}", target.display());
        Ok(Self {
            _debouncer: debouncer,
            rx,
        })
    }

    /// Receive the next file event.
    pub async fn recv(&mut self) -> Option<FileEvent> {
        self.rx.recv().await
    }
}
