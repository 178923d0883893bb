//! `FanoutServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use fanout_core::{HandshakeFailure, ValueChangeEvent};
use fanout_settings::ServerSettings;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::health::{self, HealthResponse};
use crate::metrics::WS_HANDSHAKE_REJECTIONS_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::source::{ChannelEventSource, EventSource, run_event_pump};
use crate::websocket::broadcast::{BroadcastEngine, BroadcastResult};
use crate::websocket::ingest::run_ingest_session;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::supervisor::{LifecycleSupervisor, SessionConfig};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Subscriber lifecycle.
    pub supervisor: Arc<LifecycleSupervisor>,
    /// Broadcast engine (for health diagnostics).
    pub engine: Arc<BroadcastEngine>,
    /// Where ingest frames are emitted.
    pub source: Arc<dyn EventSource>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus handle for `/metrics`.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
    /// Inbound WebSocket message size limit.
    pub max_message_size: usize,
    /// Close handshake bound for ingest sessions.
    pub close_timeout: Duration,
}

/// The fan-out server: registry, engine, supervisor and HTTP surface.
pub struct FanoutServer {
    settings: ServerSettings,
    registry: Arc<ConnectionRegistry>,
    engine: Arc<BroadcastEngine>,
    supervisor: Arc<LifecycleSupervisor>,
    shutdown: Arc<ShutdownCoordinator>,
    source: ChannelEventSource,
    events: Mutex<Option<mpsc::UnboundedReceiver<ValueChangeEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics: PrometheusHandle,
    start_time: Instant,
}

impl FanoutServer {
    /// Create a server from settings.
    pub fn new(settings: ServerSettings, metrics: PrometheusHandle) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let engine = Arc::new(BroadcastEngine::new(
            registry.clone(),
            settings.send_timeout(),
        ));
        let supervisor = Arc::new(LifecycleSupervisor::new(
            registry.clone(),
            SessionConfig::from(&settings),
            shutdown.token(),
        ));
        let (source, events) = ChannelEventSource::new();
        Self {
            settings,
            registry,
            engine,
            supervisor,
            shutdown,
            source,
            events: Mutex::new(Some(events)),
            tasks: Mutex::new(Vec::new()),
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            supervisor: self.supervisor.clone(),
            engine: self.engine.clone(),
            source: Arc::new(self.source.clone()),
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
            max_message_size: self.settings.max_message_size,
            close_timeout: self.settings.close_timeout(),
        };

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route(&self.settings.endpoint_path, get(subscribe_handler));
        if let Some(ingest_path) = &self.settings.ingest_path {
            router = router.route(ingest_path, get(ingest_handler));
        }
        router.with_state(state).layer(TraceLayer::new_for_http())
    }

    /// Bind, start the event pump and the stale-entry reaper, and serve
    /// until shutdown.
    ///
    /// Returns the bound address and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener =
            TcpListener::bind((self.settings.host.as_str(), self.settings.port)).await?;
        let addr = listener.local_addr()?;

        let events = self.events.lock().take();
        if let Some(events) = events {
            let engine = self.engine.clone();
            let token = self.shutdown.token();
            self.tasks.lock().push(tokio::spawn(async move {
                let _ = run_event_pump(events, engine, token).await;
            }));
        }
        let reaper = self
            .supervisor
            .spawn_reaper(self.settings.heartbeat_interval());
        self.tasks.lock().push(reaper);

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
        });

        info!(
            %addr,
            endpoint = %self.settings.endpoint_path,
            ingest = ?self.settings.ingest_path,
            "fanout server listening"
        );
        Ok((addr, handle))
    }

    /// Publish a value directly, bypassing the event pump.
    pub async fn publish(&self, value: impl Into<String>) -> fanout_core::Result<BroadcastResult> {
        self.engine.publish(ValueChangeEvent::new(value)).await
    }

    /// Stop accepting subscribers, close every session and wait (bounded by
    /// the shutdown timeout) for background tasks and sessions to finish.
    ///
    /// Returns `true` if everything wound down in time.
    pub async fn stop(&self) -> bool {
        let timeout = self.settings.shutdown_timeout();
        self.registry.close();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let tasks_done = self.shutdown.graceful_shutdown(tasks, timeout).await;

        let drained = tokio::time::timeout(timeout, async {
            while !self.registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                remaining = self.registry.count(),
                "sessions still open after shutdown timeout"
            );
        }
        info!("fanout server stopped");
        tasks_done && drained
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Broadcast engine.
    pub fn engine(&self) -> &Arc<BroadcastEngine> {
        &self.engine
    }

    /// Lifecycle supervisor.
    pub fn supervisor(&self) -> &Arc<LifecycleSupervisor> {
        &self.supervisor
    }

    /// In-process event source drained by the pump.
    pub fn source(&self) -> &ChannelEventSource {
        &self.source
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

fn reject(failure: &HandshakeFailure) -> Response {
    let reason = match failure {
        HandshakeFailure::ShuttingDown => "shutting_down",
        HandshakeFailure::CapacityReached { .. } => "capacity",
    };
    warn!(error = %failure, "rejecting websocket upgrade");
    counter!(WS_HANDSHAKE_REJECTIONS_TOTAL, "reason" => reason).increment(1);
    let status =
        StatusCode::from_u16(failure.status_code()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    (status, failure.to_string()).into_response()
}

/// GET {endpoint_path}
async fn subscribe_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if let Err(failure) = state.supervisor.admit() {
        return reject(&failure);
    }
    let supervisor = state.supervisor.clone();
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move { supervisor.serve(socket).await })
}

/// GET {ingest_path}
async fn ingest_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return reject(&HandshakeFailure::ShuttingDown);
    }
    let source = state.source.clone();
    let token = state.shutdown.token();
    let close_timeout = state.close_timeout;
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| run_ingest_session(socket, source, token, close_timeout))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let shutting_down = state.shutdown.is_shutting_down();
    let resp = health::health_check(
        state.start_time,
        state.supervisor.registry().count(),
        state.engine.last_sequence(),
        shutting_down,
    );
    let status = if shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(resp))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    crate::metrics::render(&state.metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_server() -> FanoutServer {
        FanoutServer::new(ServerSettings::default(), crate::metrics::detached_handle())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn status_of(app: Router, uri: &str) -> StatusCode {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        app.oneshot(req).await.unwrap().status()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["last_sequence"], 0);
    }

    #[tokio::test]
    async fn health_reports_last_sequence() {
        let server = make_server();
        let _ = server.publish("a").await.unwrap();
        let result = server.publish("b").await.unwrap();
        assert_eq!(result.sequence, 2);

        let (_, body) = get_json(server.router(), "/health").await;
        assert_eq!(body["last_sequence"], 2);
    }

    #[tokio::test]
    async fn health_during_shutdown_is_unavailable() {
        let server = make_server();
        server.shutdown().shutdown();
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "shutting_down");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_text() {
        let server = make_server();
        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn plain_get_on_subscriber_endpoint_is_not_upgraded() {
        let server = make_server();
        let status = status_of(server.router(), "/ws/value-change").await;
        assert_ne!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(status.is_client_error(), "{status}");
    }

    #[tokio::test]
    async fn custom_endpoint_path_is_routed() {
        let settings = ServerSettings {
            endpoint_path: "/updates".into(),
            ..ServerSettings::default()
        };
        let server = FanoutServer::new(settings, crate::metrics::detached_handle());
        assert_ne!(status_of(server.router(), "/updates").await, StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(server.router(), "/ws/value-change").await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn ingest_route_can_be_disabled() {
        let settings = ServerSettings {
            ingest_path: None,
            ..ServerSettings::default()
        };
        let server = FanoutServer::new(settings, crate::metrics::detached_handle());
        assert_eq!(
            status_of(server.router(), "/ws/ingest").await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        assert_eq!(
            status_of(server.router(), "/nonexistent").await,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn reject_maps_to_503() {
        let resp = reject(&HandshakeFailure::CapacityReached { max: 1 });
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let resp = reject(&HandshakeFailure::ShuttingDown);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn publish_after_stop_is_unavailable() {
        let server = make_server();
        assert!(server.stop().await);
        let err = server.publish("late").await.unwrap_err();
        assert!(matches!(err, fanout_core::FanoutError::RegistryUnavailable));
        assert!(server.supervisor().admit().is_err());
    }

    #[tokio::test]
    async fn zero_heartbeat_interval_keeps_background_tasks_running() {
        let settings = ServerSettings {
            host: "127.0.0.1".into(),
            port: 0,
            heartbeat_interval_ms: 0,
            heartbeat_timeout_ms: 0,
            ..ServerSettings::default()
        };
        let server = FanoutServer::new(settings, crate::metrics::detached_handle());
        let (_addr, handle) = server.listen().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(server.tasks.lock().iter().all(|task| !task.is_finished()));
        assert!(server.stop().await);
        handle.await.unwrap();
    }

    #[test]
    fn accessors() {
        let server = make_server();
        assert_eq!(server.settings().port, 8080);
        assert!(server.registry().is_empty());
        assert_eq!(server.engine().last_sequence(), 0);
        assert!(!server.shutdown().is_shutting_down());
        assert!(server.source().is_open());
    }
}
