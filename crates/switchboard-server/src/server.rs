//! `SwitchboardServer`: Axum HTTP + WebSocket gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{SessionBridge, SessionStore};
use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse, RegistryCounts};
use crate::limiter::ConnectionSlots;
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::event_bridge::{ChangeEvent, EventBridge};
use crate::websocket::handler::ConnectionHandler;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::router::MessageRouter;
use crate::websocket::session::{SessionOptions, run_ws_session};

/// Capacity of the in-process change channel.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Header carrying the change-hook key.
const API_KEY_HEADER: &str = "x-api-key";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Envelope router.
    pub router: Arc<MessageRouter>,
    /// Document-change bridge.
    pub event_bridge: Arc<EventBridge>,
    /// Upgrade authentication.
    pub session_bridge: Arc<SessionBridge>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Slots bounding concurrent sessions.
    pub slots: ConnectionSlots,
    /// Prometheus handle for `/metrics`, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// Body returned by `POST /changes`.
#[derive(Debug, Serialize)]
pub struct ChangeReceipt {
    /// Connections the change was queued to.
    pub recipients: usize,
}

/// The Switchboard server.
pub struct SwitchboardServer {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    event_bridge: Arc<EventBridge>,
    session_bridge: Arc<SessionBridge>,
    shutdown: Arc<ShutdownCoordinator>,
    slots: ConnectionSlots,
    changes: broadcast::Sender<ChangeEvent>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl SwitchboardServer {
    /// Create a server resolving sessions through `store`.
    pub fn new(config: ServerConfig, store: Arc<dyn SessionStore>, metrics: Option<PrometheusHandle>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(MessageRouter::new(registry.clone(), config.max_dropped_messages));
        let event_bridge = Arc::new(EventBridge::new(router.clone()));
        let session_bridge = Arc::new(SessionBridge::new(
            config.cookie_name.clone(),
            config.cookie_secret.clone(),
            store,
        ));
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let slots = ConnectionSlots::new(config.max_connections);
        Self {
            config: Arc::new(config),
            registry,
            router,
            event_bridge,
            session_bridge,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            slots,
            changes,
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            router: self.router.clone(),
            event_bridge: self.event_bridge.clone(),
            session_bridge: self.session_bridge.clone(),
            shutdown: self.shutdown.clone(),
            config: self.config.clone(),
            slots: self.slots.clone(),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/changes", post(changes_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Also starts the event bridge over [`Self::change_sender`]. Returns the
    /// bound address and a handle that completes once the listener and the
    /// bridge have stopped.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let bridge = self.event_bridge.clone();
        let bridge_rx = self.changes.subscribe();
        let bridge_cancel = self.shutdown.token();
        let bridge_task = tokio::spawn(async move { bridge.run(bridge_rx, bridge_cancel).await });

        let app = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server error");
            }
            let _ = bridge_task.await;
        });

        info!(%local_addr, "switchboard listening");
        Ok((local_addr, handle))
    }

    /// Sender for in-process document layers; events reach clients once
    /// [`Self::listen`] has started the bridge.
    pub fn change_sender(&self) -> broadcast::Sender<ChangeEvent> {
        self.changes.clone()
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the message router.
    pub fn message_router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Get the event bridge.
    pub fn event_bridge(&self) -> &Arc<EventBridge> {
        &self.event_bridge
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the connection slots.
    pub fn connection_slots(&self) -> &ConnectionSlots {
        &self.slots
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /ws
///
/// Reserves a connection slot, then authenticates before upgrading, so a
/// refused request never registers a connection. The slot is held until the
/// session ends.
async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let Some(permit) = state.slots.try_reserve() else {
        warn!(max = state.slots.capacity(), "connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let principal = match state.session_bridge.authenticate_upgrade(&headers).await {
        Ok(p) => p,
        Err(failure) => return failure.into_response(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let mut handler = ConnectionHandler::new(state.registry.clone(), state.router.clone());
    if let Err(e) = handler.authenticate(principal) {
        error!(error = %e, "fresh handler refused authentication");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let options = SessionOptions::from(state.config.as_ref());
    let close = state.shutdown.child_token();

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            run_ws_session(socket, handler, options, close).await;
            drop(permit);
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let counts = RegistryCounts {
        connections: state.registry.connection_count(),
        principals: state.registry.principal_count(),
        channels: state.registry.channel_count(),
    };
    Json(health::health_check(state.start_time, counts, state.shutdown.is_shutting_down()))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// POST /changes
///
/// The key is checked before the body is parsed.
async fn changes_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChangeEvent>, JsonRejection>,
) -> Response {
    if let Some(expected) = &state.config.change_hook_key {
        let presented = headers.get(API_KEY_HEADER).map(|v| v.as_bytes()).unwrap_or_default();
        if !bool::from(presented.ct_eq(expected.as_bytes())) {
            warn!("change hook called with a missing or wrong key");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    let Json(event) = match body {
        Ok(body) => body,
        Err(rejection) => return rejection.into_response(),
    };
    let recipients = state.event_bridge.dispatch(&event);
    Json(ChangeReceipt { recipients }).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemorySessionStore;
    use crate::websocket::connection::ClientConnection;
    use axum::body::Body;
    use axum::http::Request;
    use axum::http::header::{CONTENT_TYPE, COOKIE};
    use serde_json::{Value, json};
    use switchboard_core::Principal;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn make_server_with(config: ServerConfig) -> SwitchboardServer {
        let store = MemorySessionStore::new();
        store.insert("sid-alice", "alice");
        SwitchboardServer::new(config, Arc::new(store), None)
    }

    fn make_server() -> SwitchboardServer {
        make_server_with(ServerConfig::default())
    }

    async fn body_json(resp: Response) -> Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn change_request(body: &Value, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/changes")
            .header(CONTENT_TYPE, "application/json");
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[test]
    fn server_with_default_config() {
        let server = make_server();
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.config().port, 0);
        assert_eq!(server.registry().connection_count(), 0);
        assert!(!server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn health_endpoint_reports_counts() {
        let server = make_server();
        let (tx, _rx) = mpsc::channel(1);
        let conn = Arc::new(ClientConnection::new(Principal::from("alice"), tx, CancellationToken::new()));
        server.registry().admit(conn);

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 1);
        assert_eq!(parsed["principals"], 1);
        assert_eq!(parsed["channels"], 0);
    }

    #[tokio::test]
    async fn health_reports_shutdown() {
        let server = make_server();
        server.shutdown().shutdown();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let parsed = body_json(server.router().oneshot(req).await.unwrap()).await;
        assert_eq!(parsed["status"], "shutting_down");
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let server = make_server();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ws_without_cookie_is_401() {
        let server = make_server();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(server.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn ws_with_unknown_session_is_401() {
        let server = make_server();
        let req = Request::builder()
            .uri("/ws")
            .header(COOKIE, "_redis=nope")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ws_authenticated_but_not_an_upgrade() {
        let server = make_server();
        let req = Request::builder()
            .uri("/ws")
            .header(COOKIE, "_redis=sid-alice")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
        assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(server.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn ws_refused_at_connection_limit() {
        let server = make_server_with(ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        });
        let req = Request::builder()
            .uri("/ws")
            .header(COOKIE, "_redis=sid-alice")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ws_refused_while_every_slot_is_held() {
        let server = make_server_with(ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        });
        let held = server.connection_slots().try_reserve().unwrap();
        let req = Request::builder()
            .uri("/ws")
            .header(COOKIE, "_redis=sid-alice")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(server.registry().connection_count(), 0);

        drop(held);
        assert_eq!(server.connection_slots().available(), 1);
    }

    #[tokio::test]
    async fn refused_upgrade_returns_its_slot() {
        let server = make_server_with(ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        });
        for cookie in ["_redis=nope", "_redis=sid-alice"] {
            let req = Request::builder()
                .uri("/ws")
                .header(COOKIE, cookie)
                .body(Body::empty())
                .unwrap();
            let resp = server.router().oneshot(req).await.unwrap();
            assert_ne!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
        assert_eq!(server.connection_slots().available(), 1);
    }

    #[tokio::test]
    async fn ws_refused_while_shutting_down() {
        let server = make_server();
        server.shutdown().shutdown();
        let req = Request::builder()
            .uri("/ws")
            .header(COOKIE, "_redis=sid-alice")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn change_hook_routes_to_connections() {
        let server = make_server();
        let (tx, mut rx) = mpsc::channel(4);
        let conn = Arc::new(ClientConnection::new(Principal::from("alice"), tx, CancellationToken::new()));
        server.registry().admit(conn);

        let body = json!({"action": "create", "collection": "Todo", "document": {"title": "milk"}});
        let resp = server.router().oneshot(change_request(&body, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["recipients"], 1);

        let frame: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["response"]["title"], "milk");
        assert_eq!(frame["httpRequest"], true);
    }

    #[tokio::test]
    async fn change_hook_requires_key_when_configured() {
        let server = make_server_with(ServerConfig {
            change_hook_key: Some("secret".into()),
            ..ServerConfig::default()
        });
        let body = json!({"action": "update", "collection": "Todo", "document": {}});

        let resp = server.router().oneshot(change_request(&body, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = server
            .router()
            .oneshot(change_request(&body, Some("wrong")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = server
            .router()
            .oneshot(change_request(&body, Some("secret")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["recipients"], 0);
    }

    #[tokio::test]
    async fn change_hook_checks_key_before_body() {
        let server = make_server_with(ServerConfig {
            change_hook_key: Some("secret".into()),
            ..ServerConfig::default()
        });
        let malformed = |key: Option<&str>| {
            let mut builder = Request::builder()
                .method("POST")
                .uri("/changes")
                .header(CONTENT_TYPE, "application/json");
            if let Some(key) = key {
                builder = builder.header(API_KEY_HEADER, key);
            }
            builder.body(Body::from("not json")).unwrap()
        };

        let resp = server.router().oneshot(malformed(None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = server.router().oneshot(malformed(Some("secre"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = server.router().oneshot(malformed(Some("secret"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_and_stops_on_shutdown() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);

        server.shutdown().shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn listen_reports_bind_failure() {
        let server = make_server_with(ServerConfig {
            host: "not a host".into(),
            ..ServerConfig::default()
        });
        let err = server.listen().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
    }
}
