use anyhow::Result;
use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use futures_util::StreamExt;
use lib_common::core::{Component, ConnectionStatus, Orchestrator};
use lib_common::errors::ErrorFilter;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

pub type AppState = Arc<Orchestrator>;

pub fn router(engine: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/events", get(events_handler))
        .route("/health", get(health_handler))
        .route("/errors", get(errors_handler))
        .route("/errors/acknowledged", delete(clear_acknowledged_handler))
        .route("/errors/{id}/acknowledge", post(acknowledge_handler))
        .route("/reconnect/{component}", post(reconnect_handler))
        .with_state(engine)
}

pub async fn run(port: u16, engine: AppState, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Downstream server listening on {}", addr);

    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(engine): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| relay_socket(socket, engine))
}

/// Forwards relay envelopes to one subscriber until either side closes.
async fn relay_socket(mut socket: WebSocket, engine: AppState) {
    let (id, mut envelopes) = engine.relay().attach_channel();

    loop {
        tokio::select! {
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            Some(text) = envelopes.recv() => {
                if socket.send(Message::Text(text.to_string().into())).await.is_err() {
                    break; // client disconnected
                }
            }
        }
    }

    engine.relay().detach(id);
}

async fn events_handler(ws: WebSocketUpgrade, State(engine): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| dashboard_socket(socket, engine))
}

/// Streams dashboard notifications, starting with the current snapshot.
async fn dashboard_socket(mut socket: WebSocket, engine: AppState) {
    let mut events = engine.subscribe();
    let snapshot = json!({ "type": "snapshot", "data": engine.status() }).to_string();
    if socket.send(Message::Text(snapshot.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Dashboard client lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn health_handler(State(engine): State<AppState>) -> impl IntoResponse {
    let status = engine.status();
    let code = if status.values().any(|s| s.status == ConnectionStatus::Error) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(status))
}

async fn errors_handler(State(engine): State<AppState>, Query(filter): Query<ErrorFilter>) -> impl IntoResponse {
    Json(json!({
        "errors": engine.errors().get_errors(&filter),
        "statistics": engine.errors().get_statistics(),
    }))
}

async fn acknowledge_handler(State(engine): State<AppState>, Path(id): Path<u64>) -> impl IntoResponse {
    if engine.errors().acknowledge_error(id) {
        StatusCode::NO_CONTENT
    } else if engine.errors().contains(id) {
        StatusCode::CONFLICT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn clear_acknowledged_handler(State(engine): State<AppState>) -> impl IntoResponse {
    Json(json!({ "removed": engine.errors().clear_acknowledged() }))
}

async fn reconnect_handler(State(engine): State<AppState>, Path(component): Path<String>) -> impl IntoResponse {
    match component.parse::<Component>() {
        Ok(component) => {
            let success = engine.reconnect(component).await;
            (StatusCode::OK, Json(json!({ "component": component, "success": success })))
        }
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({ "error": e }))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_common::configs::{HealthConfig, RelayConfig};
    use lib_common::core::{HttpTokenExchange, Upstreams, WsConnector};
    use lib_common::errors::Severity;
    use project_tests::{StreamServer, SwitchProbe, TokenServer};
    use serde_json::Value;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct App {
        base: String,
        engine: AppState,
        probe: Arc<SwitchProbe>,
        stream: StreamServer,
        _tokens: TokenServer,
    }

    async fn start() -> App {
        let tokens = TokenServer::spawn("relay", "hunter2", 3600).await.expect("token server");
        let stream = StreamServer::spawn("relay", "s3cret").await.expect("stream server");
        let probe = SwitchProbe::new();
        let upstreams = Upstreams {
            database: probe.clone(),
            token_exchange: Arc::new(
                HttpTokenExchange::new(&tokens.url, "relay", "hunter2", Duration::from_secs(5)).expect("token url"),
            ),
            stream_connector: Arc::new(WsConnector::new(stream.url.clone()).with_basic_auth("relay", "s3cret")),
            cache: None,
        };
        // Cycles are driven explicitly through check_now.
        let config = RelayConfig {
            health: HealthConfig {
                check_interval_ms: 600_000,
                check_timeout_ms: 2_000,
                ..HealthConfig::default()
            },
            ..RelayConfig::default()
        };
        let engine = Arc::new(Orchestrator::initialize(config, upstreams).await.expect("engine"));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        let app = router(engine.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });

        App {
            base,
            engine,
            probe,
            stream,
            _tokens: tokens,
        }
    }

    async fn wait_for_subscribers(engine: &AppState, n: usize) {
        timeout(WAIT, async {
            while engine.relay().subscriber_count() != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriber count in time");
    }

    #[tokio::test]
    async fn health_is_unavailable_while_a_component_errors() {
        let app = start().await;
        let client = reqwest::Client::new();

        app.engine.monitor().check_now().await;
        let ok = client.get(format!("{}/health", app.base)).send().await.expect("health");
        assert_eq!(ok.status(), reqwest::StatusCode::OK);

        app.probe.down.store(true, Ordering::SeqCst);
        app.engine.monitor().check_now().await;
        let down = client.get(format!("{}/health", app.base)).send().await.expect("health");
        assert_eq!(down.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = down.json().await.expect("json");
        assert_eq!(body["database"]["status"], "error");
        assert_eq!(body["stream"]["status"], "connected");
        app.engine.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_reports_success_and_rejects_unknown_components() {
        let app = start().await;
        let client = reqwest::Client::new();

        let unknown = client.post(format!("{}/reconnect/mainframe", app.base)).send().await.expect("reconnect");
        assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);

        let known = client.post(format!("{}/reconnect/database", app.base)).send().await.expect("reconnect");
        assert_eq!(known.status(), reqwest::StatusCode::OK);
        let body: Value = known.json().await.expect("json");
        assert_eq!(body, json!({ "component": "database", "success": true }));

        app.probe.down.store(true, Ordering::SeqCst);
        let failed: Value = client
            .post(format!("{}/reconnect/database", app.base))
            .send()
            .await
            .expect("reconnect")
            .json()
            .await
            .expect("json");
        assert_eq!(failed["success"], false);
        app.engine.shutdown().await;
    }

    #[tokio::test]
    async fn errors_can_be_listed_acknowledged_and_cleared() {
        let app = start().await;
        let client = reqwest::Client::new();
        let tracker = app.engine.errors();
        let first = tracker.log_error("database", Severity::Error, "gone", None);
        tracker.log_error("stream", Severity::Warning, "dropped", None);

        let listed: Value = client
            .get(format!("{}/errors?component=database&limit=5", app.base))
            .send()
            .await
            .expect("errors")
            .json()
            .await
            .expect("json");
        assert_eq!(listed["errors"].as_array().map(Vec::len), Some(1));
        assert_eq!(listed["errors"][0]["message"], "gone");
        assert!(listed["statistics"]["total"].as_u64() >= Some(2));

        let ack = |id: u64| client.post(format!("{}/errors/{}/acknowledge", app.base, id)).send();
        assert_eq!(ack(999_999).await.expect("ack").status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(ack(first).await.expect("ack").status(), reqwest::StatusCode::NO_CONTENT);
        assert_eq!(ack(first).await.expect("ack").status(), reqwest::StatusCode::CONFLICT);

        let cleared: Value = client
            .delete(format!("{}/errors/acknowledged", app.base))
            .send()
            .await
            .expect("clear")
            .json()
            .await
            .expect("json");
        assert_eq!(cleared, json!({ "removed": 1 }));
        assert!(!tracker.contains(first));
        app.engine.shutdown().await;
    }

    #[tokio::test]
    async fn relay_socket_receives_events_and_detaches_on_close() {
        let app = start().await;
        app.stream.wait_for_connections(1).await;
        let url = format!("{}/ws", app.base.replacen("http", "ws", 1));
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.expect("ws");
        wait_for_subscribers(&app.engine, 1).await;

        app.stream.send_text(r#"{"call":"c-9"}"#);
        let frame = timeout(WAIT, socket.next()).await.expect("in time").expect("open").expect("frame");
        let envelope: Value = serde_json::from_str(frame.to_text().expect("text")).expect("json");
        assert_eq!(envelope["type"], "call_event");
        assert_eq!(envelope["data"]["call"], "c-9");

        socket.close(None).await.expect("close");
        wait_for_subscribers(&app.engine, 0).await;
        app.engine.shutdown().await;
    }
}
