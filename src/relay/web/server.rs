//! Web server exposing the relay over WebSocket plus a few small HTTP endpoints.
//! Uses axum framework with tower middleware support.

use crate::error::AppError;
use crate::relay::classifier::InboundFrame;
use crate::relay::hub::{RelayHandle, RelayStatus};
use crate::relay::{ConnId, Outbound, RelayService};
use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{Json, Response},
    routing::{get, post},
};
use eyre::{Context, Result};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use tokio::sync::watch;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct RelayState {
    pub relay: RelayHandle,
}

/// Web server that accepts peer WebSocket connections and hands them to the relay hub.
pub struct WebServer {
    bind_addr: SocketAddr,
    relay: RelayHandle,
    shutdown: watch::Receiver<bool>,
}

impl WebServer {
    /// # Arguments
    /// * `bind_addr` - The address to bind the server to
    /// * `relay` - Handle to the running relay hub
    /// * `shutdown` - Flips to `true` when the listener should stop accepting
    pub fn new(bind_addr: SocketAddr, relay: RelayHandle, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            relay,
            shutdown,
        }
    }

    /// Build the application router with all routes
    fn build_router(&self) -> Router {
        let state = RelayState {
            relay: self.relay.clone(),
        };

        // Peers historically connect to the bare root; `/ws` is kept for newer clients
        let ws_router = Router::new()
            .route("/", get(relay_ws_handler))
            .route("/ws", get(relay_ws_handler));

        let api_router = Router::new()
            .route("/ingest", post(ingest_handler))
            .route("/api/relay/status", get(status_handler))
            .route("/health", get(health_handler));

        ws_router
            .merge(api_router)
            .with_state(state)
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::default().include_headers(true)),
            )
    }
}

#[async_trait::async_trait]
impl RelayService for WebServer {
    async fn run(&mut self) -> Result<()> {
        info!("Starting web server on {}", self.bind_addr);

        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(self.bind_addr)
            .await
            .context("Failed to bind to address")?;
        info!("Relay listening on {}", listener.local_addr()?);

        let mut shutdown = self.shutdown.clone();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("Shutting down web server...");
        })
        .await
        .context("Server error")?;

        Ok(())
    }
}

async fn relay_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> Response {
    info!("New WebSocket connection from {}", addr);
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state.relay))
}

async fn ingest_handler(
    State(state): State<RelayState>,
    body: String,
) -> Result<Json<Value>, AppError> {
    let frame = InboundFrame::decode(&body)?;
    state.relay.ingest(frame).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<RelayState>) -> Result<Json<RelayStatus>, AppError> {
    Ok(Json(state.relay.status().await?))
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Handles a single WebSocket message for a peer. Returns true if the connection should close.
#[tracing::instrument(skip_all, fields(conn_id = %conn_id, addr = %addr))]
fn handle_websocket_message(
    msg: Result<Message, axum::Error>,
    conn_id: ConnId,
    addr: SocketAddr,
    relay: &RelayHandle,
) -> bool {
    match msg {
        Ok(Message::Text(text)) => {
            relay.frame(conn_id, text.as_str().to_owned());
            false
        }
        Ok(Message::Binary(data)) => {
            match String::from_utf8(data.to_vec()) {
                Ok(text) => relay.frame(conn_id, text),
                Err(_) => warn!("Dropping non UTF-8 binary frame ({} bytes)", data.len()),
            }
            false
        }
        Ok(Message::Ping(_)) => {
            // the pong reply is queued by the socket itself
            debug!("Received ping");
            false
        }
        Ok(Message::Pong(_)) => {
            relay.pong(conn_id);
            false
        }
        Ok(Message::Close(_)) => {
            info!("Peer {} disconnected", addr);
            true
        }
        Err(e) => {
            warn!("WebSocket error from {}: {}", addr, e);
            true
        }
    }
}

/// Pumps one WebSocket: inbound frames go to the hub, the hub's [`Outbound`] queue
/// goes to the socket. Whichever side finishes first ends the connection.
#[tracing::instrument(skip_all, fields(addr = %addr))]
async fn handle_socket(socket: WebSocket, addr: SocketAddr, relay: RelayHandle) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut outbound) = relay.connect(addr);

    let mut output_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let (frame, last) = match msg {
                Outbound::Text(text) => (Message::Text(text.to_string().into()), false),
                Outbound::Ping => (Message::Ping(Default::default()), false),
                Outbound::Close => (Message::Close(None), true),
            };
            if let Err(e) = sender.send(frame).await {
                debug!(%conn_id, "Failed to write to peer: {}", e);
                break;
            }
            if last {
                break;
            }
        }
        debug!(%conn_id, "Output task finished");
    });

    let mut input_task = {
        let relay = relay.clone();
        tokio::spawn(async move {
            while let Some(msg) = receiver.next().await {
                if handle_websocket_message(msg, conn_id, addr, &relay) {
                    break;
                }
            }
            debug!(%conn_id, "Input task finished");
        })
    };

    tokio::select! {
        _ = &mut input_task => {}
        _ = &mut output_task => {}
    }
    // Safe to send even if the hub already evicted this peer
    relay.closed(conn_id);
    input_task.abort();
    output_task.abort();
}
