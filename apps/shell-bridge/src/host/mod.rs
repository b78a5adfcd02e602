//! Reference shell host: serves `/terminal` over WebSocket and runs one PTY per socket.

mod pty;

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use pty::PtySession;

use crate::endpoint::TERMINAL_PATH;
use crate::protocol::{self, Frame};
use crate::surface::Viewport;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:3001";

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(std::io::Error),
    #[error("pty error: {0}")]
    Pty(String),
    #[error("no command to run")]
    EmptyCommand,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub listen: SocketAddr,
    /// Program and arguments started for every connection.
    pub command: Vec<String>,
}

impl HostConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            command: vec![default_shell()],
        }
    }
}

/// `$SHELL`, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

#[derive(Clone)]
struct HostState {
    command: Arc<Vec<String>>,
    active: Arc<AtomicUsize>,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    sessions: usize,
}

pub fn router(config: &HostConfig) -> Router {
    let state = HostState {
        command: Arc::new(config.command.clone()),
        active: Arc::new(AtomicUsize::new(0)),
    };
    Router::new()
        .route(TERMINAL_PATH, get(terminal_handler))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Binds `config.listen` and serves until the process ends.
pub async fn serve(config: HostConfig) -> Result<(), HostError> {
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .map_err(|source| HostError::Bind {
            addr: config.listen,
            source,
        })?;
    let local = listener.local_addr().map_err(HostError::Serve)?;
    info!(
        target = "host",
        addr = %local,
        command = ?config.command,
        "shell host listening on ws://{local}{TERMINAL_PATH}"
    );
    axum::serve(listener, router(&config))
        .await
        .map_err(HostError::Serve)
}

async fn health_check(State(state): State<HostState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        sessions: state.active.load(Ordering::SeqCst),
    })
}

async fn terminal_handler(ws: WebSocketUpgrade, State(state): State<HostState>) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

type Outbound = SplitSink<WebSocket, Message>;

async fn run_session(socket: WebSocket, state: HostState) {
    let session_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let (mut shell, mut output) = match PtySession::spawn(&state.command, Viewport::DEFAULT) {
        Ok(spawned) => spawned,
        Err(err) => {
            warn!(target = "host", %session_id, error = %err, "failed to start shell");
            send_frame(&mut sender, &Frame::error(format!("failed to start shell: {err}"))).await;
            let _ = sender.close().await;
            return;
        }
    };

    state.active.fetch_add(1, Ordering::SeqCst);
    info!(target = "host", %session_id, "session started");
    let connected = Frame::Connected {
        session_id: Some(session_id.clone()),
    };
    if send_frame(&mut sender, &connected).await {
        loop {
            tokio::select! {
                chunk = output.recv() => match chunk {
                    Some(data) => {
                        if !send_frame(&mut sender, &Frame::output(data)).await {
                            break;
                        }
                    }
                    None => {
                        debug!(target = "host", %session_id, "shell exited");
                        break;
                    }
                },
                message = receiver.next() => {
                    let text = match message {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => {
                            String::from_utf8_lossy(&bytes).into_owned()
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            debug!(target = "host", %session_id, error = %err, "socket error");
                            break;
                        }
                    };
                    if let Some(reply) = apply_client_frame(&mut shell, &text) {
                        if !send_frame(&mut sender, &reply).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    drop(shell);
    let _ = sender.close().await;
    state.active.fetch_sub(1, Ordering::SeqCst);
    info!(target = "host", %session_id, "session ended");
}

/// Applies one client frame to the shell; returns an `error` frame to send back, if any.
fn apply_client_frame(shell: &mut PtySession, raw: &str) -> Option<Frame> {
    let frame = match protocol::decode(raw) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(target = "host", error = %err, "undecodable client frame");
            return Some(Frame::error(format!("invalid frame: {err}")));
        }
    };
    match frame {
        Frame::Input { data } => shell
            .write(&data)
            .err()
            .map(|err| Frame::error(err.to_string())),
        Frame::Resize { cols, rows } => match Viewport::new(cols, rows) {
            Ok(viewport) => shell
                .resize(viewport)
                .err()
                .map(|err| Frame::error(err.to_string())),
            Err(err) => Some(Frame::error(err.to_string())),
        },
        other => Some(Frame::error(format!(
            "unexpected {} frame from client",
            other.kind()
        ))),
    }
}

async fn send_frame(sender: &mut Outbound, frame: &Frame) -> bool {
    sender
        .send(Message::Text(protocol::encode(frame)))
        .await
        .is_ok()
}
