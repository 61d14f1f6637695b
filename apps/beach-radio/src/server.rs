use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer, services::ServeDir, set_header::SetResponseHeader, trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::config::RadioConfig;
use crate::engine::{EngineFactory, WebRtcEngineFactory};
use crate::producer::{ProcessLauncher, ProducerLauncher};
use crate::protocol::SignalMessage;
use crate::session::{ChannelError, Session, SignalChannel};
use crate::telemetry::{METRIC_SESSIONS_ACTIVE, METRIC_UPGRADES_REJECTED};

const NO_CACHE: &str = "no-store, no-cache, must-revalidate, max-age=0";

pub struct AppState {
    launcher: Arc<dyn ProducerLauncher>,
    engines: Arc<dyn EngineFactory>,
    admission: Admission,
    metrics: Option<PrometheusHandle>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        launcher: Arc<dyn ProducerLauncher>,
        engines: Arc<dyn EngineFactory>,
        max_sessions: Option<usize>,
    ) -> Self {
        Self {
            launcher,
            engines,
            admission: Admission::new(max_sessions),
            metrics: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn active_sessions(&self) -> usize {
        self.admission.active()
    }

    /// Cancelling this token ends every running session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Optional cap on concurrent sessions. The semaphore enforces the cap and
/// the counter tracks live sessions for health and the gauge.
struct Admission {
    limit: Option<Arc<Semaphore>>,
    active: Arc<AtomicUsize>,
}

impl Admission {
    fn new(limit: Option<usize>) -> Self {
        Self {
            limit: limit.map(|permits| Arc::new(Semaphore::new(permits))),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn try_acquire(&self) -> Option<AdmissionPermit> {
        let slot = match &self.limit {
            Some(semaphore) => Some(Arc::clone(semaphore).try_acquire_owned().ok()?),
            None => None,
        };
        let previous = self.active.fetch_add(1, Ordering::SeqCst);
        gauge!(METRIC_SESSIONS_ACTIVE, (previous + 1) as f64);
        Some(AdmissionPermit {
            _slot: slot,
            active: Arc::clone(&self.active),
        })
    }
}

struct AdmissionPermit {
    _slot: Option<OwnedSemaphorePermit>,
    active: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let previous = self.active.fetch_sub(1, Ordering::SeqCst);
        gauge!(METRIC_SESSIONS_ACTIVE, previous.saturating_sub(1) as f64);
    }
}

pub fn router(state: Arc<AppState>, static_dir: Option<&Path>) -> Router {
    let mut app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    if let Some(dir) = static_dir {
        app = app.fallback_service(SetResponseHeader::overriding(
            ServeDir::new(dir),
            header::CACHE_CONTROL,
            HeaderValue::from_static(NO_CACHE),
        ));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves on an already bound listener until `shutdown` resolves.
pub async fn serve_on<F>(
    listener: TcpListener,
    state: Arc<AppState>,
    static_dir: Option<&Path>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state, static_dir);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

pub async fn run(config: RadioConfig, metrics: PrometheusHandle) -> Result<()> {
    let launcher = Arc::new(ProcessLauncher::new(config.producer.clone()));
    let engines = Arc::new(WebRtcEngineFactory::new(config.engine.clone()));
    let state = Arc::new(AppState::new(launcher, engines, config.max_sessions).with_metrics(metrics));
    let sessions = state.shutdown_token();

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(
        addr = %config.listen_addr,
        producer = ?config.producer.backend,
        mode = ?config.producer.mode,
        "beach-radio listening"
    );

    serve_on(
        listener,
        state,
        config.static_dir.as_deref(),
        shutdown_signal(),
    )
    .await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; closing sessions"
    );
    sessions.cancel();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "active_sessions": state.active_sessions(),
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(permit) = state.admission.try_acquire() else {
        counter!(METRIC_UPGRADES_REJECTED, 1);
        warn!(%remote_addr, "rejecting websocket upgrade: session limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "session limit reached").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr, permit))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    remote_addr: SocketAddr,
    _permit: AdmissionPermit,
) {
    let (mut sender, receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to encode outbound message");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let session = Session::new(
        Arc::clone(&state.launcher),
        Arc::clone(&state.engines),
        state.shutdown.child_token(),
    );
    let session_id = session.id();
    info!(%remote_addr, %session_id, "websocket connected");

    match session.run(WsChannel { receiver }, tx).await {
        Ok(report) => info!(%session_id, end = ?report.end, "websocket session closed"),
        Err(err) => warn!(%session_id, error = %err, "websocket session ended with error"),
    }

    if let Err(err) = writer.await {
        warn!(%session_id, error = %err, "websocket writer task failed");
    }
}

/// Text frames from the browser. Binary frames carrying UTF-8 are treated as
/// text; control frames are skipped.
struct WsChannel {
    receiver: SplitStream<WebSocket>,
}

#[async_trait]
impl SignalChannel for WsChannel {
    async fn recv(&mut self) -> Option<Result<String, ChannelError>> {
        loop {
            match self.receiver.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(err) => warn!(error = %err, "ignoring non-utf8 binary frame"),
                },
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "websocket close frame received");
                    return None;
                }
                Err(err) => return Some(Err(ChannelError(err.to_string()))),
            }
        }
    }
}
