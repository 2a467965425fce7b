//! Agent websocket endpoint
//!
//! Each agent opens `GET /agentws?id=<target>&file=<file>` and pushes JSON
//! arrays of lines. The upgraded socket is wrapped into a [`FrameStream`] and
//! handed to the manager, which routes it to the target's client.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::{
    extract::{
        ConnectInfo, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::{
    api::state::ApiState,
    error::{Error, Result},
    transport::FrameStream,
};

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub file: String,
}

/// WebSocket upgrade handler
///
/// GET /agentws
pub async fn agent_handler(
    ws: Option<WebSocketUpgrade>,
    Query(query): Query<AgentQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<ApiState>,
) -> Response {
    if query.id.is_empty() || query.file.is_empty() {
        warn!("agent connected without id or file: {query:?}");
        return (StatusCode::BAD_REQUEST, "invalid agent id").into_response();
    }
    let Some(ws) = ws else {
        return (StatusCode::BAD_REQUEST, "expected websocket upgrade").into_response();
    };

    let peer = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    ws.on_upgrade(move |socket| async move {
        debug!(target_id = %query.id, file = %query.file, "agent connected from {peer}");
        let stream = Box::new(WsFrameStream::new(socket, peer));
        if let Err(e) = state
            .manager
            .bind_inbound_stream(&query.id, &query.file, stream)
            .await
        {
            warn!(target_id = %query.id, file = %query.file, "agent stream rejected: {e}");
        }
    })
}

/// [`FrameStream`] over an upgraded axum websocket
pub struct WsFrameStream {
    socket: WebSocket,
    peer: String,
    closed: bool,
}

impl WsFrameStream {
    pub fn new(socket: WebSocket, peer: String) -> Self {
        Self {
            socket,
            peer,
            closed: false,
        }
    }
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn recv_frame(&mut self) -> Option<Result<Vec<u8>>> {
        if self.closed {
            return None;
        }
        loop {
            let message = match self.socket.recv().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(Error::Transport(e.to_string()))),
            };
            match message {
                Message::Binary(frame) => return Some(Ok(frame)),
                Message::Text(text) => return Some(Ok(text.into_bytes())),
                Message::Close(_) => {
                    trace!("{} sent close", self.peer);
                    self.closed = true;
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.socket.send(Message::Close(None)).await;
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
