//! `ChatServer`: axum HTTP + WebSocket front of the hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use trackspace_core::HandshakeError;
use trackspace_telemetry::{MetricsRecorder, MetricsSnapshot};

use crate::config::ServerConfig;
use crate::errors::Result;
use crate::health::{self, HealthResponse, HubState, Totals};
use crate::hub::{metric, HubHandle, HubSettings};
use crate::identity::{HeaderIdentity, IdentityResolver};
use crate::shutdown::ShutdownCoordinator;

/// How long `/health` waits for the dispatcher before reporting busy.
const PRESENCE_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub config: Arc<ServerConfig>,
    pub identity: Arc<dyn IdentityResolver>,
    pub start_time: Instant,
}

/// The chat server. Owns the running hub and the tasks to drain on shutdown.
pub struct ChatServer {
    config: Arc<ServerConfig>,
    hub: HubHandle,
    identity: Arc<dyn IdentityResolver>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatServer {
    /// Validate `config` and start the dispatcher. Must run inside a tokio runtime.
    pub fn new(config: ServerConfig, metrics: Arc<MetricsRecorder>) -> Result<Self> {
        config.validate()?;
        let identity: Arc<dyn IdentityResolver> =
            Arc::new(HeaderIdentity::new(&config.identity_header)?);
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let (hub, dispatcher) =
            HubHandle::spawn(HubSettings::from(&config), metrics, shutdown.token());

        Ok(Self {
            config: Arc::new(config),
            hub,
            identity,
            shutdown,
            start_time: Instant::now(),
            tasks: Mutex::new(vec![dispatcher]),
        })
    }

    /// Replace the identity resolver.
    #[must_use]
    pub fn with_identity_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.identity = resolver;
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            config: self.config.clone(),
            identity: self.identity.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route(&self.config.ws_path, get(ws_handler))
            .route("/health", get(health_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind and serve until shutdown. Returns the bound address.
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        let serve = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = result {
                error!(error = %e, "http server failed");
            }
        });
        self.tasks.lock().push(serve);

        info!(%addr, ws_path = %self.config.ws_path, "chat server listening");
        Ok(addr)
    }

    /// Stop accepting, close every connection and drain tracked tasks.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> ShutdownReport {
        let handles = std::mem::take(&mut *self.tasks.lock());
        let drained = self.shutdown.graceful_shutdown(handles, timeout).await;
        ShutdownReport {
            drained,
            metrics: self.hub.metrics().snapshot(),
        }
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }
}

/// Outcome of [`ChatServer::shutdown`].
#[derive(Debug)]
pub struct ShutdownReport {
    /// Every tracked task finished within the drain window.
    pub drained: bool,
    /// Final value of every metric series.
    pub metrics: Vec<MetricsSnapshot>,
}

/// A refused handshake rendered as an HTTP error.
#[derive(Debug)]
pub struct Rejection(pub HandshakeError);

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": self.0.error_kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Accept when no origins are configured, when the request carries no
/// `Origin`, or when the origin is listed (`"*"` matches any).
pub fn check_origin(allowed: &[String], headers: &HeaderMap) -> std::result::Result<(), HandshakeError> {
    if allowed.is_empty() {
        return Ok(());
    }
    let Some(origin) = headers.get(header::ORIGIN) else {
        return Ok(());
    };
    let origin = origin
        .to_str()
        .map_err(|_| HandshakeError::OriginRejected("<non-ascii>".into()))?;
    if allowed.iter().any(|a| a == "*" || a.eq_ignore_ascii_case(origin)) {
        Ok(())
    } else {
        Err(HandshakeError::OriginRejected(origin.to_owned()))
    }
}

fn refuse(state: &AppState, err: HandshakeError) -> Response {
    state.hub.record_rejection(&err);
    debug!(kind = err.error_kind(), error = %err, "handshake refused");
    Rejection(err).into_response()
}

/// GET `{ws_path}`
async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            return refuse(&state, HandshakeError::NotUpgrade(rejection.body_text()));
        }
    };
    if let Err(err) = check_origin(&state.config.allowed_origins, &headers) {
        return refuse(&state, err);
    }
    let permit = match state.hub.try_reserve() {
        Ok(permit) => permit,
        Err(err) => {
            warn!(kind = err.error_kind(), "refusing connection");
            return refuse(&state, err);
        }
    };
    let identity = state.identity.resolve(&headers);
    let hub = state.hub.clone();

    upgrade
        .max_message_size(state.config.max_message_size)
        .on_failed_upgrade(|error| warn!(%error, "websocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            if let Err(err) = hub.accept(permit, sink, stream, identity).await {
                hub.record_rejection(&err);
                warn!(error = %err, "upgraded socket dropped");
            }
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let answer = tokio::time::timeout(PRESENCE_TIMEOUT, state.hub.presence()).await;
    let hub = match &answer {
        Ok(Ok(presence)) => HubState::Running(presence),
        Ok(Err(_)) => HubState::Stopped,
        Err(_) => {
            warn!(timeout = ?PRESENCE_TIMEOUT, "dispatcher did not answer presence in time");
            HubState::Busy
        }
    };
    let metrics = state.hub.metrics();
    let totals = Totals {
        broadcasts: metrics.counter_total(metric::BROADCASTS_TOTAL),
        write_failures: metrics.counter_total(metric::WRITE_FAILURES_TOTAL),
    };
    let resp = health::health_check(state.start_time, hub, totals);
    let status = if resp.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(resp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use tower::ServiceExt;

    fn make_server() -> ChatServer {
        ChatServer::new(ServerConfig::default(), Arc::new(MetricsRecorder::new())).unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn origin(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(header::ORIGIN, HeaderValue::from_static(value));
        headers
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["named_users"], 0);
    }

    #[tokio::test]
    async fn health_after_shutdown_is_unavailable() {
        let server = make_server();
        let app = server.router();
        assert!(server.shutdown(Some(Duration::from_secs(5))).await.drained);

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["status"], "shutting_down");
    }

    #[tokio::test]
    async fn plain_get_on_ws_path_is_bad_request() {
        let server = make_server();
        let req = Request::builder().uri("/ts").body(Body::empty()).unwrap();

        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "not_upgrade");
        assert_eq!(
            server
                .hub()
                .metrics()
                .counter_get(metric::HANDSHAKE_REJECTED, &[("kind", "not_upgrade")]),
            1
        );
    }

    #[tokio::test]
    async fn custom_ws_path_is_routed() {
        let config = ServerConfig {
            ws_path: "/chat".into(),
            ..ServerConfig::default()
        };
        let server = ChatServer::new(config, Arc::new(MetricsRecorder::new())).unwrap();

        let req = Request::builder().uri("/chat").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = Request::builder().uri("/ts").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();

        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        };
        assert!(ChatServer::new(config, Arc::new(MetricsRecorder::new())).is_err());
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port() {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let server = ChatServer::new(config, Arc::new(MetricsRecorder::new())).unwrap();
        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.shutdown(Some(Duration::from_secs(5))).await.drained);
        assert!(server.shutdown_coordinator().is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_reports_final_metrics() {
        let server = make_server();
        let req = Request::builder().uri("/ts").body(Body::empty()).unwrap();
        let _ = server.router().oneshot(req).await.unwrap();

        let report = server.shutdown(Some(Duration::from_secs(5))).await;
        assert!(report.drained);
        let rejected = report
            .metrics
            .iter()
            .find(|m| m.name == metric::HANDSHAKE_REJECTED)
            .expect("rejection counter missing from report");
        assert_eq!(rejected.value, 1.0);
        assert_eq!(rejected.labels.as_deref(), Some(r#"{"kind":"not_upgrade"}"#));
    }

    #[tokio::test(start_paused = true)]
    async fn health_reports_busy_when_dispatcher_is_stalled() {
        let (hub, _queue) = HubHandle::stalled(HubSettings {
            queue_capacity: 1,
            ..HubSettings::default()
        });
        let state = AppState {
            hub,
            config: Arc::new(ServerConfig::default()),
            identity: Arc::new(crate::identity::Anonymous),
            start_time: Instant::now(),
        };

        let (status, Json(body)) = health_handler(State(state.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "busy");

        // Queue now full: the second call must not block either.
        let (status, Json(body)) = health_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "busy");
    }

    #[test]
    fn any_origin_when_unconfigured() {
        assert!(check_origin(&[], &origin("http://anywhere.example")).is_ok());
    }

    #[test]
    fn missing_origin_is_allowed() {
        let allowed = vec!["http://app.example".to_owned()];
        assert!(check_origin(&allowed, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn listed_origin_is_allowed() {
        let allowed = vec!["http://app.example".to_owned()];
        assert!(check_origin(&allowed, &origin("http://app.example")).is_ok());
    }

    #[test]
    fn wildcard_origin_is_allowed() {
        let allowed = vec!["*".to_owned()];
        assert!(check_origin(&allowed, &origin("http://evil.example")).is_ok());
    }

    #[test]
    fn unlisted_origin_is_rejected() {
        let allowed = vec!["http://app.example".to_owned()];
        let err = check_origin(&allowed, &origin("http://evil.example")).unwrap_err();
        assert_eq!(err, HandshakeError::OriginRejected("http://evil.example".into()));
    }

    #[tokio::test]
    async fn rejection_renders_status_and_kind() {
        let resp = Rejection(HandshakeError::AtCapacity(4)).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["error"], "at_capacity");
        assert_eq!(parsed["message"], "connection limit reached (4)");

        let resp = Rejection(HandshakeError::OriginRejected("x".into())).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
