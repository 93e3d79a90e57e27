//! # Local Upstream Doubles
//!
//! Real network endpoints bound on 127.0.0.1 that stand in for the external
//! systems of the relay engine: an OAuth2 token endpoint served by `axum`, a
//! WebSocket event stream served by `tokio-tungstenite`, and an in-memory
//! database probe. The integration tests under `tests/` drive the engine
//! against them.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::{
    Form, Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::IntoResponse,
    routing::post,
};
use base64::{Engine as _, engine::general_purpose};
use futures_util::{SinkExt, StreamExt};
use lib_common::connections::{DatabaseProbe, DbError};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode as WsStatus;
use tokio_tungstenite::tungstenite::protocol::Message;

/// `Basic base64(user:password)` as sent by the engine.
pub fn basic_header(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        general_purpose::STANDARD.encode(format!("{}:{}", username, password))
    )
}

async fn bind_local() -> std::io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

// --- Token endpoint ---

#[derive(Clone)]
struct TokenState {
    expected_auth: String,
    expires_in: u64,
    calls: Arc<AtomicUsize>,
}

/// Client-credentials token endpoint issuing `token-<n>`.
pub struct TokenServer {
    pub url: String,
    calls: Arc<AtomicUsize>,
}

impl TokenServer {
    pub async fn spawn(client_id: &str, client_secret: &str, expires_in: u64) -> std::io::Result<Self> {
        let calls = Arc::new(AtomicUsize::new(0));
        let state = TokenState {
            expected_auth: basic_header(client_id, client_secret),
            expires_in,
            calls: calls.clone(),
        };
        let app = Router::new()
            .route("/oauth/token", post(issue_token))
            .with_state(state);

        let (listener, addr) = bind_local().await?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self {
            url: format!("http://{}/oauth/token", addr),
            calls,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn issue_token(
    State(state): State<TokenState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    let n = state.calls.fetch_add(1, Ordering::SeqCst) + 1;
    let authorized = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == state.expected_auth);
    let grant_ok = form.get("grant_type").map(String::as_str) == Some("client_credentials");

    if authorized && grant_ok {
        (
            StatusCode::OK,
            Json(json!({
                "access_token": format!("token-{n}"),
                "token_type": "bearer",
                "expires_in": state.expires_in,
            })),
        )
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid_client" })),
        )
    }
}

// --- Event stream ---

/// WebSocket upstream requiring a Basic credential on the handshake.
pub struct StreamServer {
    pub url: String,
    outbound: broadcast::Sender<Message>,
    kick: broadcast::Sender<()>,
    accepted: watch::Receiver<usize>,
    pongs: Arc<AtomicUsize>,
}

impl StreamServer {
    pub async fn spawn(username: &str, password: &str) -> std::io::Result<Self> {
        let (listener, addr) = bind_local().await?;
        let (outbound, _) = broadcast::channel(256);
        let (kick, _) = broadcast::channel(4);
        let (accepted_tx, accepted) = watch::channel(0usize);
        let pongs = Arc::new(AtomicUsize::new(0));
        let expected = basic_header(username, password);

        let (out, kicks, counter) = (outbound.clone(), kick.clone(), pongs.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(
                    stream,
                    expected.clone(),
                    out.subscribe(),
                    kicks.subscribe(),
                    accepted_tx.clone(),
                    counter.clone(),
                ));
            }
        });

        Ok(Self {
            url: format!("ws://{}/events", addr),
            outbound,
            kick,
            accepted,
            pongs,
        })
    }

    /// Waits until `n` handshakes have completed since the server started.
    pub async fn wait_for_connections(&self, n: usize) {
        let mut accepted = self.accepted.clone();
        let _ = accepted.wait_for(|count| *count >= n).await;
    }

    pub fn connections(&self) -> usize {
        *self.accepted.borrow()
    }

    pub fn send_text(&self, text: &str) {
        let _ = self.outbound.send(Message::Text(text.into()));
    }

    pub fn ping(&self, payload: &[u8]) {
        let _ = self.outbound.send(Message::Ping(payload.to_vec().into()));
    }

    /// Closes every open connection from the server side.
    pub fn drop_connections(&self) {
        let _ = self.kick.send(());
    }

    pub fn pongs(&self) -> usize {
        self.pongs.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    stream: TcpStream,
    expected: String,
    mut outbound: broadcast::Receiver<Message>,
    mut kick: broadcast::Receiver<()>,
    accepted: watch::Sender<usize>,
    pongs: Arc<AtomicUsize>,
) {
    let check_auth = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let presented = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        if presented == Some(expected.as_str()) {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("unauthorized".to_string()));
            *rejection.status_mut() = WsStatus::UNAUTHORIZED;
            Err(rejection)
        }
    };
    let Ok(ws) = accept_hdr_async(stream, check_auth).await else {
        return;
    };
    accepted.send_modify(|count| *count += 1);
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Ok(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = kick.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Pong(_))) => {
                    pongs.fetch_add(1, Ordering::SeqCst);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

// --- Database ---

/// Database probe whose health is switched by the test.
#[derive(Default)]
pub struct SwitchProbe {
    pub down: AtomicBool,
    pub pings: AtomicUsize,
}

impl SwitchProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DatabaseProbe for SwitchProbe {
    async fn ping(&self) -> Result<(), DbError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Err(DbError::QueryError("server closed the connection".into()))
        } else {
            Ok(())
        }
    }

    async fn reconnect(&self) -> Result<(), DbError> {
        if self.down.load(Ordering::SeqCst) {
            Err(DbError::ConnectionError("connection refused".into()))
        } else {
            Ok(())
        }
    }
}
