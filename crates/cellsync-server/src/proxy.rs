//! Completion, hover, definition and signature-help proxy.
//!
//! Requests arrive in cell-local coordinates. The proxy finds the owning
//! notebook, translates the position into its virtual document, forwards the
//! request to a linear-document backend and maps every position in the
//! answer back into cell coordinates.
//!
//! Nothing here surfaces an error to the caller: an unknown cell, a failed
//! or cancelled backend request all become `None`.

use std::sync::Arc;

use async_trait::async_trait;
use cellsync_core::{NotebookId, PositionMapper, VirtualDocInfo};
use lsp_types::notification::{
    DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument, Notification,
};
use lsp_types::request::{Completion, GotoDefinition, HoverRequest, Request, SignatureHelpRequest};
use lsp_types::{
    CompletionContext, CompletionItem, CompletionParams, CompletionResponse,
    CompletionTextEdit, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, GotoDefinitionParams, GotoDefinitionResponse, Hover, HoverParams,
    Location, LocationLink, Position, SignatureHelp, SignatureHelpContext, SignatureHelpParams,
    TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem,
    TextDocumentPositionParams, Url, VersionedTextDocumentIdentifier,
};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::documents::VirtualDocuments;
use crate::error::{ServerError, ServerResult};
use crate::workspace::{NotebookState, Workspace};

/// A linear-document language server the proxy forwards requests to.
#[async_trait]
pub trait LanguageBackend: Send + Sync {
    /// Send a request and wait for its result. Firing `cancel` abandons it.
    async fn send_request(
        &self,
        method: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> ServerResult<Value>;

    async fn send_notification(&self, method: &str, params: Value) -> ServerResult<()>;
}

/// What the backend was last told about one virtual document.
#[derive(Debug, Clone)]
struct MirroredDocument {
    version: i32,
    content: String,
}

/// A request resolved to its notebook, virtual document and cell mapper.
struct Target {
    notebook: Arc<NotebookState>,
    doc: Arc<VirtualDocInfo>,
    mapper: PositionMapper,
}

impl Target {
    fn position_params(&self, position: Position) -> TextDocumentPositionParams {
        TextDocumentPositionParams::new(
            TextDocumentIdentifier::new(self.doc.uri.clone()),
            self.mapper.to_virtual(position),
        )
    }
}

pub struct NotebookProxy {
    workspace: Arc<Workspace>,
    documents: Arc<VirtualDocuments>,
    backend: Arc<dyn LanguageBackend>,
    language_id: String,
    mirrored: Mutex<FxHashMap<Url, MirroredDocument>>,
}

impl NotebookProxy {
    pub fn new(
        workspace: Arc<Workspace>,
        documents: Arc<VirtualDocuments>,
        backend: Arc<dyn LanguageBackend>,
        language_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace,
            documents,
            backend,
            language_id: language_id.into(),
            mirrored: Mutex::new(FxHashMap::default()),
        }
    }

    pub async fn completion(
        &self,
        cell_uri: &Url,
        position: Position,
        context: Option<CompletionContext>,
        cancel: CancellationToken,
    ) -> Option<CompletionResponse> {
        let target = self.resolve(cell_uri).await?;
        let params = CompletionParams {
            text_document_position: target.position_params(position),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
            context,
        };

        let response = self.forward::<Completion>(params, cancel).await??;
        Some(map_completion_response(response, &target.mapper))
    }

    pub async fn hover(
        &self,
        cell_uri: &Url,
        position: Position,
        cancel: CancellationToken,
    ) -> Option<Hover> {
        let target = self.resolve(cell_uri).await?;
        let params = HoverParams {
            text_document_position_params: target.position_params(position),
            work_done_progress_params: Default::default(),
        };

        let mut hover = self.forward::<HoverRequest>(params, cancel).await??;
        hover.range = hover.range.map(|r| target.mapper.range_from_virtual(r));
        Some(hover)
    }

    pub async fn definition(
        &self,
        cell_uri: &Url,
        position: Position,
        cancel: CancellationToken,
    ) -> Option<GotoDefinitionResponse> {
        let target = self.resolve(cell_uri).await?;
        let params = GotoDefinitionParams {
            text_document_position_params: target.position_params(position),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        let response = self.forward::<GotoDefinition>(params, cancel).await??;
        Some(map_definition_response(response, &target))
    }

    /// Signature help carries no positions; the answer passes through.
    pub async fn signature_help(
        &self,
        cell_uri: &Url,
        position: Position,
        context: Option<SignatureHelpContext>,
        cancel: CancellationToken,
    ) -> Option<SignatureHelp> {
        let target = self.resolve(cell_uri).await?;
        let params = SignatureHelpParams {
            context,
            text_document_position_params: target.position_params(position),
            work_done_progress_params: Default::default(),
        };

        self.forward::<SignatureHelpRequest>(params, cancel).await?
    }

    /// Tell the backend a notebook's virtual document is gone.
    pub async fn release(&self, notebook: &NotebookId) {
        let Ok(uri) = self.documents.store().uri_for(notebook) else {
            return;
        };
        if self.mirrored.lock().await.remove(&uri).is_none() {
            return;
        }

        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier::new(uri),
        };
        if let Err(e) = self.notify::<DidCloseTextDocument>(params).await {
            tracing::debug!("Failed to release virtual document of {}: {}", notebook, e);
        }
    }

    async fn resolve(&self, cell_uri: &Url) -> Option<Target> {
        let Some(location) = self.workspace.locate_cell(cell_uri) else {
            tracing::debug!("{} is not a cell of any open notebook", cell_uri);
            return None;
        };

        let doc = match self.documents.get_or_build(&location.notebook).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::debug!("No virtual document for {}: {}", cell_uri, e);
                return None;
            }
        };

        let mapper = match PositionMapper::for_cell(&doc, &location.cell_id) {
            Ok(mapper) => mapper,
            Err(e) => {
                tracing::debug!("Skipping request for {}: {}", cell_uri, e);
                return None;
            }
        };

        if let Err(e) = self.mirror(&doc).await {
            tracing::debug!("Failed to update backend copy of {}: {}", doc.uri, e);
            return None;
        }

        Some(Target {
            notebook: location.notebook,
            doc,
            mapper,
        })
    }

    /// Bring the backend's copy of `doc` up to date, skipping identical content.
    async fn mirror(&self, doc: &VirtualDocInfo) -> ServerResult<()> {
        let mut mirrored = self.mirrored.lock().await;

        let version = match mirrored.get(&doc.uri) {
            Some(current) if current.content == doc.content => return Ok(()),
            Some(current) => {
                let version = current.version.saturating_add(1);
                self.notify::<DidChangeTextDocument>(DidChangeTextDocumentParams {
                    text_document: VersionedTextDocumentIdentifier::new(doc.uri.clone(), version),
                    content_changes: vec![TextDocumentContentChangeEvent {
                        range: None,
                        range_length: None,
                        text: doc.content.clone(),
                    }],
                })
                .await?;
                version
            }
            None => {
                self.notify::<DidOpenTextDocument>(DidOpenTextDocumentParams {
                    text_document: TextDocumentItem::new(
                        doc.uri.clone(),
                        self.language_id.clone(),
                        0,
                        doc.content.clone(),
                    ),
                })
                .await?;
                0
            }
        };

        mirrored.insert(
            doc.uri.clone(),
            MirroredDocument {
                version,
                content: doc.content.clone(),
            },
        );
        Ok(())
    }

    async fn notify<N: Notification>(&self, params: N::Params) -> ServerResult<()> {
        self.backend
            .send_notification(N::METHOD, serde_json::to_value(params)?)
            .await
    }

    async fn request<R: Request>(
        &self,
        params: R::Params,
        cancel: CancellationToken,
    ) -> ServerResult<R::Result> {
        let value = self
            .backend
            .send_request(R::METHOD, serde_json::to_value(params)?, cancel)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Typed request whose failure is logged and turned into `None`.
    async fn forward<R: Request>(
        &self,
        params: R::Params,
        cancel: CancellationToken,
    ) -> Option<R::Result> {
        match self.request::<R>(params, cancel).await {
            Ok(result) => Some(result),
            Err(ServerError::Cancelled) => {
                tracing::debug!("{} cancelled", R::METHOD);
                None
            }
            Err(e) => {
                tracing::debug!("{}", e);
                None
            }
        }
    }
}

fn map_completion_item(mut item: CompletionItem, mapper: &PositionMapper) -> CompletionItem {
    match item.text_edit.as_mut() {
        Some(CompletionTextEdit::Edit(edit)) => {
            edit.range = mapper.range_from_virtual(edit.range);
        }
        Some(CompletionTextEdit::InsertAndReplace(edit)) => {
            edit.insert = mapper.range_from_virtual(edit.insert);
            edit.replace = mapper.range_from_virtual(edit.replace);
        }
        None => {}
    }

    if let Some(edits) = item.additional_text_edits.as_mut() {
        // Edits aimed at other cells cannot be expressed in this cell.
        edits.retain(|edit| mapper.contains(edit.range.start));
        for edit in edits.iter_mut() {
            edit.range = mapper.range_from_virtual(edit.range);
        }
    }
    item
}

fn map_completion_response(
    response: CompletionResponse,
    mapper: &PositionMapper,
) -> CompletionResponse {
    match response {
        CompletionResponse::Array(items) => CompletionResponse::Array(
            items
                .into_iter()
                .map(|item| map_completion_item(item, mapper))
                .collect(),
        ),
        CompletionResponse::List(mut list) => {
            list.items = list
                .items
                .into_iter()
                .map(|item| map_completion_item(item, mapper))
                .collect();
            CompletionResponse::List(list)
        }
    }
}

/// Cell document and mapper of the cell holding a virtual-document line.
fn cell_at(target: &Target, line: u32) -> Option<(Url, PositionMapper)> {
    let offset = target.doc.cell_at_line(line)?;
    let cell = target.notebook.snapshot.cell(&offset.cell_id)?;
    Some((cell.uri.clone(), PositionMapper::from_offset(offset)))
}

/// Map a location into the cell it lands in. Locations in other files pass
/// through unchanged.
fn map_location(location: Location, target: &Target) -> Option<Location> {
    if location.uri != target.doc.uri {
        return Some(location);
    }
    let Some((uri, mapper)) = cell_at(target, location.range.start.line) else {
        tracing::debug!("Dropping location past the end of {}", target.doc.uri);
        return None;
    };
    Some(Location::new(uri, mapper.range_from_virtual(location.range)))
}

fn map_location_link(mut link: LocationLink, target: &Target) -> Option<LocationLink> {
    link.origin_selection_range = link
        .origin_selection_range
        .map(|r| target.mapper.range_from_virtual(r));

    if link.target_uri != target.doc.uri {
        return Some(link);
    }
    let Some((uri, mapper)) = cell_at(target, link.target_range.start.line) else {
        tracing::debug!("Dropping link past the end of {}", target.doc.uri);
        return None;
    };
    link.target_uri = uri;
    link.target_range = mapper.range_from_virtual(link.target_range);
    link.target_selection_range = mapper.range_from_virtual(link.target_selection_range);
    Some(link)
}

fn map_definition_response(
    response: GotoDefinitionResponse,
    target: &Target,
) -> GotoDefinitionResponse {
    match response {
        GotoDefinitionResponse::Scalar(location) => match map_location(location, target) {
            Some(location) => GotoDefinitionResponse::Scalar(location),
            None => GotoDefinitionResponse::Array(Vec::new()),
        },
        GotoDefinitionResponse::Array(locations) => GotoDefinitionResponse::Array(
            locations
                .into_iter()
                .filter_map(|l| map_location(l, target))
                .collect(),
        ),
        GotoDefinitionResponse::Link(links) => GotoDefinitionResponse::Link(
            links
                .into_iter()
                .filter_map(|l| map_location_link(l, target))
                .collect(),
        ),
    }
}
