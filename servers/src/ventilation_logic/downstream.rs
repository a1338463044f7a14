use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use lib_vent::fanout::session::{ClientConnection, ClientSession, ClientSink, SessionError, READ_TIMEOUT};
use lib_vent::fanout::wire::MAX_MESSAGE_SIZE;
use lib_vent::{EventBus, Origin, Settings};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::timeout;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct WebState {
    bus: Arc<EventBus>,
    settings: Arc<Settings>,
}

impl WebState {
    pub fn new(bus: Arc<EventBus>, settings: Arc<Settings>) -> Self {
        Self { bus, settings }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SockQuery {
    token: Option<String>,
}

pub fn router(state: WebState) -> Router {
    let mut app = Router::new()
        .route("/sock", get(ws_handler))
        .route("/health", get(health_handler));
    if let Some(dir) = &state.settings.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }
    app.layer(CorsLayer::permissive()).with_state(state)
}

pub async fn run(state: WebState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.settings.port));
    let shutdown = state.bus.on_shutdown();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Downstream server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.await;
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<SockQuery>,
    State(state): State<WebState>,
) -> impl IntoResponse {
    let origin = if state.settings.is_local_token(query.token.as_deref()) {
        Origin::Local
    } else {
        Origin::Remote
    };
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state.bus, origin))
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl ClientSink for WsSink {
    async fn send_text(&mut self, text: Arc<str>) -> Result<(), SessionError> {
        self.0
            .send(Message::Text(text.as_ref().into()))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), SessionError> {
        self.0
            .send(Message::Ping(Default::default()))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
        let _ = self.0.close().await;
    }
}

async fn handle_socket(socket: WebSocket, bus: Arc<EventBus>, origin: Origin) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let (sink, mut stream) = socket.split();
    let (connection, replies) = ClientConnection::open(client_id, Arc::clone(&bus), origin);
    let mut session = tokio::spawn(ClientSession::new(client_id, bus, WsSink(sink), replies).run());
    let mut session_done = false;

    loop {
        tokio::select! {
            _ = &mut session => {
                session_done = true;
                break;
            }
            msg = timeout(READ_TIMEOUT, stream.next()) => match msg {
                Err(_) => {
                    log::info!("Client {} read timeout", client_id);
                    break;
                }
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Ok(Message::Text(text)))) => {
                    if let Err(e) = connection.handle_text(text.as_str()).await {
                        log::debug!("Client {} sent an unusable message: {}", client_id, e);
                    }
                }
                // Pongs and anything else only count as liveness.
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    // Dropping the connection closes the reply queue, which ends the writer.
    drop(connection);
    if !session_done {
        let _ = session.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint_answers_ok() {
        let state = WebState::new(Arc::new(EventBus::new()), Arc::new(Settings::default()));
        let response = router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn static_dir_is_served_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>vent</h1>").unwrap();
        let settings = Settings { static_dir: Some(dir.path().to_path_buf()), ..Settings::default() };
        let state = WebState::new(Arc::new(EventBus::new()), Arc::new(settings));
        let response = router(state)
            .oneshot(Request::builder().uri("/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
