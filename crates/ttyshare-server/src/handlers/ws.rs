//! WebSocket handler for viewer connections
//!
//! One task per viewer: attach to the session, then dispatch every inbound
//! frame until the transport closes. Binary frames carry terminal traffic,
//! text frames carry JSON control messages.

use crate::error::{RelayError, Result};
use crate::server::AppState;
use crate::session::Session;
use crate::snapshot::decompress;
use crate::upload::save_upload;
use crate::viewer::{self, Outbound, SharedSink, ViewerId, WsSink};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use ttyshare_proto::{ChunkAssembler, ClientMessage, InboundFrame, ServerMessage, TermSize};

#[derive(Debug, Default, Deserialize)]
pub struct AttachParams {
    /// Program selector; the configured default when absent
    pub program: Option<String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

impl AttachParams {
    fn initial_size(&self) -> Option<TermSize> {
        match (self.rows, self.cols) {
            (Some(rows), Some(cols)) => Some(TermSize::new(rows, cols)).filter(|s| !s.is_empty()),
            _ => None,
        }
    }
}

/// Handle WebSocket upgrade. Unknown programs are refused before upgrading.
pub async fn handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(params): Query<AttachParams>,
    State(state): State<AppState>,
) -> Response {
    let selector = params
        .program
        .clone()
        .unwrap_or_else(|| state.registry.config().default_program.clone());
    if let Err(e) = state.registry.config().program(&selector) {
        warn!("Refusing attach to {}: {}", session_id, e);
        return e.into_response();
    }

    let initial_size = params.initial_size();
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, selector, initial_size))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    selector: String,
    initial_size: Option<TermSize>,
) {
    let (sender, mut receiver) = socket.split();
    let sink = viewer::shared(WsSink::new(sender));

    let (session, viewer) =
        match attach(&state, &session_id, &selector, sink.clone(), initial_size).await {
            Ok(attached) => attached,
            Err(e) => {
                error!("Attach to session {} failed: {}", session_id, e);
                refuse(&sink, &e).await;
                return;
            }
        };

    let mut connection = Connection {
        state,
        session,
        viewer,
        assembler: ChunkAssembler::new(),
    };

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => connection.on_binary(Bytes::from(data)).await,
            Ok(Message::Text(text)) => connection.on_text(&text).await,
            Ok(Message::Close(_)) => {
                debug!("{} closed the connection", viewer);
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Axum answers pings itself
            }
            Err(e) => {
                debug!("{} transport error: {}", viewer, e);
                break;
            }
        }
    }

    connection.session.detach(viewer).await;
}

/// Resolve the session and attach. Retries once if the session ended between
/// lookup and attach, which yields a fresh one.
async fn attach(
    state: &AppState,
    session_id: &str,
    selector: &str,
    sink: SharedSink,
    initial_size: Option<TermSize>,
) -> Result<(Arc<Session>, ViewerId)> {
    for _ in 0..2 {
        let (session, is_new) = state.registry.resolve_or_create(session_id, selector)?;
        match session.attach(sink.clone(), initial_size, !is_new).await {
            Ok(viewer) => return Ok((session, viewer)),
            Err(RelayError::SessionClosed(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(RelayError::SessionClosed(session_id.to_string()))
}

/// Tell a viewer why it could not attach, then hang up
async fn refuse(sink: &SharedSink, error: &RelayError) {
    let mut sink = sink.lock().await;
    let notice = format!("\r\n[{}]\r\n", error);
    let _ = sink.send(Outbound::Binary(Bytes::from(notice))).await;
    let message = ServerMessage::Error {
        message: error.to_string(),
    };
    if let Ok(text) = message.to_text() {
        let _ = sink.send(Outbound::Text(text)).await;
    }
    let _ = sink.send(Outbound::Close).await;
}

struct Connection {
    state: AppState,
    session: Arc<Session>,
    viewer: ViewerId,
    /// Inbound chunk sequence in progress
    assembler: ChunkAssembler,
}

impl Connection {
    async fn on_binary(&mut self, data: Bytes) {
        let frame = match InboundFrame::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", self.viewer, e);
                return;
            }
        };

        match frame {
            InboundFrame::Resize(size) => {
                self.session.update_viewer_size(self.viewer, size).await;
            }
            InboundFrame::Upload { filename, content } => self.on_upload(&filename, &content).await,
            InboundFrame::Chunk(chunk) => match self.assembler.push(chunk) {
                Ok(Some(buf)) => match decompress(&buf) {
                    Ok(input) => self.write_input(input).await,
                    Err(e) => warn!("Dropping chunked input from {}: {}", self.viewer, e),
                },
                Ok(None) => {}
                Err(e) => warn!("Chunk sequence from {} reset: {}", self.viewer, e),
            },
            InboundFrame::Input(bytes) => self.write_input(bytes.to_vec()).await,
        }
    }

    async fn on_text(&mut self, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed message from {}: {}", self.viewer, e);
                return;
            }
        };

        match message {
            ClientMessage::Ping { extra } => {
                self.session.touch().await;
                self.session
                    .send_to(self.viewer, &ServerMessage::Pong { extra })
                    .await;
            }
            ClientMessage::Chat { user_name, text } => {
                debug!("Chat from {} in {}", user_name, self.session.id());
                self.session.chat(user_name, text).await;
            }
            ClientMessage::RenameSession { name } => {
                if let Err(e) = self.session.rename(&name).await {
                    warn!("Rename from {} rejected: {}", self.viewer, e);
                    self.session
                        .send_to(
                            self.viewer,
                            &ServerMessage::Error {
                                message: e.to_string(),
                            },
                        )
                        .await;
                }
            }
        }
    }

    async fn on_upload(&self, filename: &str, content: &[u8]) {
        let config = self.state.registry.config();
        let reply = match save_upload(
            &config.upload_dir,
            filename,
            content,
            config.max_upload_bytes,
        )
        .await
        {
            Ok(path) => {
                let path = path.to_string_lossy().to_string();
                info!("{} uploaded {}", self.viewer, path);
                self.write_input(path.clone().into_bytes()).await;
                ServerMessage::Upload {
                    success: true,
                    path: Some(path),
                    error: None,
                }
            }
            Err(e) => {
                warn!("Upload from {} rejected: {}", self.viewer, e);
                ServerMessage::Upload {
                    success: false,
                    path: None,
                    error: Some(e.to_string()),
                }
            }
        };
        self.session.send_to(self.viewer, &reply).await;
    }

    async fn write_input(&self, data: Vec<u8>) {
        if let Err(e) = self.session.write_input(data).await {
            debug!("Input from {} dropped: {}", self.viewer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_size_needs_both_dimensions() {
        let params = AttachParams {
            rows: Some(40),
            cols: Some(100),
            ..Default::default()
        };
        assert_eq!(params.initial_size(), Some(TermSize::new(40, 100)));

        let params = AttachParams {
            rows: Some(40),
            ..Default::default()
        };
        assert_eq!(params.initial_size(), None);

        let params = AttachParams {
            rows: Some(0),
            cols: Some(80),
            ..Default::default()
        };
        assert_eq!(params.initial_size(), None);
    }
}
