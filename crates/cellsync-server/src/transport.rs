//! JSON-RPC transport to a backend language server.
//!
//! Spawns the backend with piped stdio and speaks `Content-Length` framed
//! JSON-RPC 2.0 over it. A writer task owns stdin, a reader task owns stdout
//! and routes responses to waiting requests, and stderr is forwarded to the
//! debug log.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lsp_types::notification::{self, Notification};
use lsp_types::request::{self, Request};
use lsp_types::{
    ClientInfo, InitializeParams, InitializeResult, InitializedParams, Url, WorkspaceFolder,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex as TokioMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::ClientNotebookSync;
use crate::config::BackendConfig;
use crate::error::{ServerError, ServerResult};
use crate::protocol::{
    DidChangeNotebookDocument, DidChangeNotebookDocumentParams, DidCloseNotebookDocument,
    DidCloseNotebookDocumentParams, DidOpenNotebookDocument, DidOpenNotebookDocumentParams,
};
use crate::proxy::LanguageBackend;

/// How long to wait for a `shutdown` answer before killing the backend.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Error object of a JSON-RPC response.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    pub message: String,
}

type PendingMap = FxHashMap<i64, oneshot::Sender<Result<Value, RpcError>>>;

/// Write one framed message.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Value,
) -> std::io::Result<()> {
    let content = serde_json::to_string(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", content.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(content.as_bytes()).await?;
    writer.flush().await
}

/// Read one framed message. Returns `None` at end of stream.
pub async fn read_message<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<String>> {
    let mut content_length = None;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }

        let header = line.trim_end();
        if header.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }

        // Other headers (Content-Type) are ignored.
        if let Some(value) = header.strip_prefix("Content-Length:") {
            content_length = value.trim().parse::<usize>().ok();
        }
    }

    let mut content = vec![0u8; content_length.unwrap_or(0)];
    reader.read_exact(&mut content).await?;
    String::from_utf8(content)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Build a JSON-RPC message, omitting `params` when there are none.
fn rpc_message(id: Option<i64>, method: &str, params: Value) -> Value {
    let mut message = json!({ "jsonrpc": "2.0", "method": method });
    if let Some(id) = id {
        message["id"] = json!(id);
    }
    if !params.is_null() {
        message["params"] = params;
    }
    message
}

/// A live connection to one backend language server.
pub struct LspConnection {
    name: String,
    notebook_type: Option<String>,
    outgoing: mpsc::UnboundedSender<Value>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicI64,
    child: TokioMutex<Option<Child>>,
    tasks: Vec<JoinHandle<()>>,
}

impl LspConnection {
    /// Spawn the backend process and connect to its stdio.
    pub fn spawn(config: &BackendConfig, program: &Path, root: &Path) -> ServerResult<Self> {
        tracing::info!(
            "Starting {} ({}) for workspace: {}",
            config.name,
            program.display(),
            root.display()
        );

        let mut child = Command::new(program)
            .args(&config.args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ServerError::Transport(format!("Failed to start {}: {}", config.name, e))
            })?;

        let missing = |stream: &str| {
            ServerError::Transport(format!("{} has no {} pipe", config.name, stream))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let mut connection = Self::from_io(config.name.clone(), stdout, stdin);
        connection.notebook_type = config.notebook_type.clone();
        connection
            .tasks
            .push(tokio::spawn(log_stderr(config.name.clone(), stderr)));
        *connection.child.get_mut() = Some(child);
        Ok(connection)
    }

    /// Connect over an arbitrary byte stream pair.
    pub fn from_io<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let (outgoing, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(PendingMap::default()));

        let writer_task = tokio::spawn(write_loop(name.clone(), writer, rx));
        let reader_task = tokio::spawn(read_loop(
            name.clone(),
            BufReader::new(reader),
            pending.clone(),
            outgoing.clone(),
        ));

        Self {
            name,
            notebook_type: None,
            outgoing,
            pending,
            next_id: AtomicI64::new(1),
            child: TokioMutex::new(None),
            tasks: vec![writer_task, reader_task],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn closed(&self) -> ServerError {
        ServerError::Transport(format!("{} connection closed", self.name))
    }

    /// Send a request and wait for its result.
    ///
    /// Firing `cancel` sends `$/cancelRequest` and resolves with
    /// [`ServerError::Cancelled`]. There is no timeout.
    pub async fn request_value(
        &self,
        method: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> ServerResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.outgoing.send(rpc_message(Some(id), method, params)).is_err() {
            self.pending.lock().remove(&id);
            return Err(self.closed());
        }

        tokio::select! {
            outcome = rx => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(ServerError::BackendRequest {
                    method: method.to_string(),
                    message: format!("{} (code {})", error.message, error.code),
                }),
                Err(_) => Err(self.closed()),
            },
            _ = cancel.cancelled() => {
                self.pending.lock().remove(&id);
                let _ = self.outgoing.send(rpc_message(
                    None,
                    notification::Cancel::METHOD,
                    json!({ "id": id }),
                ));
                tracing::debug!("{}: cancelled {} (id {})", self.name, method, id);
                Err(ServerError::Cancelled)
            }
        }
    }

    pub fn notify_value(&self, method: &str, params: Value) -> ServerResult<()> {
        self.outgoing
            .send(rpc_message(None, method, params))
            .map_err(|_| self.closed())
    }

    /// Typed request.
    pub async fn request<R: Request>(
        &self,
        params: R::Params,
        cancel: CancellationToken,
    ) -> ServerResult<R::Result> {
        let value = self
            .request_value(R::METHOD, serde_json::to_value(params)?, cancel)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Typed notification.
    pub fn notify<N: Notification>(&self, params: N::Params) -> ServerResult<()> {
        self.notify_value(N::METHOD, serde_json::to_value(params)?)
    }

    /// Run the `initialize`/`initialized` handshake.
    #[allow(deprecated)] // root_uri: still read by many servers
    pub async fn initialize(&self, root: &Path) -> ServerResult<InitializeResult> {
        let root_uri = Url::from_directory_path(root).ok();
        let workspace_folders = root_uri.clone().map(|uri| {
            vec![WorkspaceFolder {
                uri,
                name: root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "workspace".to_string()),
            }]
        });

        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_uri,
            workspace_folders,
            client_info: Some(ClientInfo {
                name: "cellsync".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        };

        let result = self
            .request::<request::Initialize>(params, CancellationToken::new())
            .await?;
        self.notify::<notification::Initialized>(InitializedParams {})?;

        tracing::info!(
            "{} initialized (server: {})",
            self.name,
            result
                .server_info
                .as_ref()
                .map(|info| info.name.as_str())
                .unwrap_or("unknown")
        );
        Ok(result)
    }

    /// Ask the backend to shut down, then stop the process.
    pub async fn shutdown(&self) {
        let shutdown = self.request::<request::Shutdown>((), CancellationToken::new());
        match tokio::time::timeout(SHUTDOWN_GRACE, shutdown).await {
            Ok(Ok(())) => {
                let _ = self.notify::<notification::Exit>(());
            }
            Ok(Err(e)) => tracing::debug!("{}: shutdown failed: {}", self.name, e),
            Err(_) => tracing::debug!("{}: shutdown timed out", self.name),
        }

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        tracing::info!("{} stopped", self.name);
    }

    fn send_failure(&self, e: ServerError) -> ServerError {
        ServerError::ClientSend {
            client: self.name.clone(),
            message: e.to_string(),
        }
    }
}

impl Drop for LspConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl ClientNotebookSync for LspConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn did_open_notebook(
        &self,
        mut params: DidOpenNotebookDocumentParams,
    ) -> ServerResult<()> {
        if let Some(notebook_type) = &self.notebook_type {
            params.notebook_document.notebook_type = notebook_type.clone();
        }
        self.notify::<DidOpenNotebookDocument>(params)
            .map_err(|e| self.send_failure(e))
    }

    async fn did_change_notebook(
        &self,
        params: DidChangeNotebookDocumentParams,
    ) -> ServerResult<()> {
        self.notify::<DidChangeNotebookDocument>(params)
            .map_err(|e| self.send_failure(e))
    }

    async fn did_close_notebook(&self, params: DidCloseNotebookDocumentParams) -> ServerResult<()> {
        self.notify::<DidCloseNotebookDocument>(params)
            .map_err(|e| self.send_failure(e))
    }
}

#[async_trait]
impl LanguageBackend for LspConnection {
    async fn send_request(
        &self,
        method: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> ServerResult<Value> {
        self.request_value(method, params, cancel).await
    }

    async fn send_notification(&self, method: &str, params: Value) -> ServerResult<()> {
        self.notify_value(method, params)
    }
}

/// Task: drain queued messages into the backend's stdin.
async fn write_loop<W: AsyncWrite + Unpin>(
    name: String,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Value>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            tracing::warn!("{}: failed to write message: {}", name, e);
            break;
        }
    }
}

/// Task: route the backend's output to waiting requests.
async fn read_loop<R: AsyncBufRead + Unpin>(
    name: String,
    mut reader: R,
    pending: Arc<Mutex<PendingMap>>,
    outgoing: mpsc::UnboundedSender<Value>,
) {
    loop {
        let text = match read_message(&mut reader).await {
            Ok(Some(text)) => text,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("{}: failed to read message: {}", name, e);
                break;
            }
        };

        let message: Value = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("{}: ignoring malformed message: {}", name, e);
                continue;
            }
        };

        let method = message.get("method").and_then(Value::as_str);
        match (message.get("id"), method) {
            // Server-to-client request; nothing here needs answering with data.
            (Some(id), Some(method)) => {
                tracing::debug!("{}: answering {} with null", name, method);
                let _ = outgoing.send(json!({ "jsonrpc": "2.0", "id": id, "result": null }));
            }
            (None, Some(method)) => log_notification(&name, method, &message),
            (Some(id), None) => {
                let Some(id) = id.as_i64() else {
                    continue;
                };
                let Some(sender) = pending.lock().remove(&id) else {
                    // Already cancelled.
                    continue;
                };
                let outcome = match message.get("error") {
                    Some(error) => Err(serde_json::from_value(error.clone()).unwrap_or_else(|_| {
                        RpcError {
                            code: 0,
                            message: error.to_string(),
                        }
                    })),
                    None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = sender.send(outcome);
            }
            (None, None) => {}
        }
    }

    // Dropping the senders fails every request still waiting.
    pending.lock().clear();
    tracing::info!("{}: connection closed", name);
}

fn log_notification(name: &str, method: &str, message: &Value) {
    let params = message.get("params");
    match method {
        "window/logMessage" | "window/showMessage" => {
            let text = params
                .and_then(|p| p.get("message"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            tracing::debug!("{}: {}", name, text);
        }
        "textDocument/publishDiagnostics" => {
            let uri = params
                .and_then(|p| p.get("uri"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let count = params
                .and_then(|p| p.get("diagnostics"))
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            tracing::debug!("{}: {} diagnostics for {}", name, count, uri);
        }
        _ => tracing::trace!("{}: notification {}", name, method),
    }
}

/// Task: forward backend stderr to the debug log.
async fn log_stderr(name: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();

    while reader.read_line(&mut line).await.is_ok() {
        if line.is_empty() {
            break;
        }
        tracing::debug!("{} stderr: {}", name, line.trim());
        line.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

    /// The server side of an in-memory connection.
    struct FakeServer {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn recv(&mut self) -> Value {
            let text = read_message(&mut self.reader).await.unwrap().unwrap();
            serde_json::from_str(&text).unwrap()
        }

        async fn send(&mut self, message: Value) {
            write_message(&mut self.writer, &message).await.unwrap();
        }
    }

    fn connect() -> (LspConnection, FakeServer) {
        let (client_end, server_end) = duplex(64 * 1024);
        let (client_read, client_write) = split(client_end);
        let (server_read, server_write) = split(server_end);
        (
            LspConnection::from_io("fake", client_read, client_write),
            FakeServer {
                reader: BufReader::new(server_read),
                writer: server_write,
            },
        )
    }

    #[tokio::test]
    async fn test_framing_skips_extra_headers() {
        let raw = b"Content-Length: 2\r\nContent-Type: application/vscode-jsonrpc\r\n\r\n{}";
        let mut reader = BufReader::new(&raw[..]);
        assert_eq!(read_message(&mut reader).await.unwrap().as_deref(), Some("{}"));
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_message() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &json!({"a": 1})).await.unwrap();
        assert!(buffer.starts_with(b"Content-Length: 7\r\n\r\n"));

        let mut reader = BufReader::new(&buffer[..]);
        let text = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(text, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_request_response() {
        let (connection, mut server) = connect();

        let server_task = tokio::spawn(async move {
            let request = server.recv().await;
            assert_eq!(request["method"], "textDocument/hover");
            server
                .send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"ok": true}}))
                .await;
            server
        });

        let result = connection
            .request_value("textDocument/hover", json!({}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, json!({"ok": true}));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response() {
        let (connection, mut server) = connect();

        tokio::spawn(async move {
            let request = server.recv().await;
            server
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "error": {"code": -32601, "message": "method not found"}
                }))
                .await;
            server
        });

        let err = connection
            .request_value("custom/unknown", Value::Null, CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ServerError::BackendRequest { method, message } => {
                assert_eq!(method, "custom/unknown");
                assert!(message.contains("method not found"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_sends_cancel_request() {
        let (connection, mut server) = connect();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let server_task = tokio::spawn(async move {
            let request = server.recv().await;
            trigger.cancel();
            let notice = server.recv().await;
            assert_eq!(notice["method"], "$/cancelRequest");
            assert_eq!(notice["params"]["id"], request["id"]);
        });

        let err = connection
            .request_value("textDocument/completion", json!({}), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Cancelled));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_request_answered_with_null() {
        let (connection, mut server) = connect();

        server
            .send(json!({"jsonrpc": "2.0", "id": 99, "method": "workspace/configuration", "params": {}}))
            .await;
        let reply = server.recv().await;
        assert_eq!(reply["id"], 99);
        assert!(reply["result"].is_null());
        drop(connection);
    }

    #[tokio::test]
    async fn test_closed_connection_fails_pending_requests() {
        let (connection, mut server) = connect();

        tokio::spawn(async move {
            let _ = server.recv().await;
            drop(server);
        });

        let err = connection
            .request_value("textDocument/hover", json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Transport(_)));
    }

    #[tokio::test]
    async fn test_notification_omits_null_params() {
        let (connection, mut server) = connect();
        connection.notify::<notification::Exit>(()).unwrap();
        let message = server.recv().await;
        assert_eq!(message["method"], "exit");
        assert!(message.get("params").is_none());
        assert!(message.get("id").is_none());
    }

    #[tokio::test]
    async fn test_notebook_type_override() {
        let (mut connection, mut server) = connect();
        connection.notebook_type = Some("marimo-notebook".to_string());

        let params = DidOpenNotebookDocumentParams {
            notebook_document: crate::protocol::NotebookDocument {
                uri: Url::parse("file:///nb.ipynb").unwrap(),
                notebook_type: "jupyter-notebook".to_string(),
                version: 0,
                metadata: None,
                cells: Vec::new(),
            },
            cell_text_documents: Vec::new(),
        };
        connection.did_open_notebook(params).await.unwrap();

        let message = server.recv().await;
        assert_eq!(message["method"], "notebookDocument/didOpen");
        assert_eq!(message["params"]["notebookDocument"]["notebookType"], "marimo-notebook");
    }
}
