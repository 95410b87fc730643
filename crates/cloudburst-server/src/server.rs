//! HTTP surface: health, job trigger and the reclaim callback.

use std::{future::IntoFuture, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Extension, Json, Router,
    body::{Body, Bytes},
    extract::MatchedPath,
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{
    add_extension::AddExtensionLayer, classify::ServerErrorsFailureClass, trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::handlers::{
    HandlerError, HandlerErrorKind, JobTrigger, PreemptionReceiver, validate_reclaim_request,
};

const HEALTHZ_PATH: &str = "/v1/healthz";
const JOBS_PATH: &str = "/v1/jobs";
const HEALTHZ_STATUS: &str = "ok";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
}

#[derive(Debug, Copy, Clone)]
enum ShutdownSignal {
    Interrupt,
    Terminate,
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    id: String,
}

#[derive(Debug, Serialize)]
struct ResultBody {
    result: String,
}

#[derive(Debug, Clone, Serialize)]
struct ApiErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

/// Application callbacks wired into the HTTP routes.
#[derive(Clone)]
pub struct ApiHandlers {
    pub trigger: Arc<dyn JobTrigger>,
    pub reclaim: Arc<dyn PreemptionReceiver>,
}

type ApiStateHandle = Arc<ApiState>;

struct ApiState {
    handlers: ApiHandlers,
    nonce_header: String,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("reclaim path `{path}` must start with `/` and not shadow a built-in route")]
    InvalidReclaimPath { path: String },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ApiErrorBody {
                error: message.into(),
            },
        }
    }

    /// Reclaim callbacks report every failure, validation included, as a 500.
    fn reclaim(error: HandlerError) -> Self {
        if error.kind == HandlerErrorKind::Internal {
            tracing::error!(message = %error.message, "reclaim handling failed");
        } else {
            tracing::warn!(message = %error.message, "rejected reclaim callback");
        }
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, error.message)
    }
}

impl From<HandlerError> for ApiError {
    fn from(error: HandlerError) -> Self {
        match error.kind {
            HandlerErrorKind::InvalidRequest => ApiError::new(StatusCode::BAD_REQUEST, error.message),
            HandlerErrorKind::NotFound => ApiError::new(StatusCode::NOT_FOUND, error.message),
            HandlerErrorKind::Internal => {
                tracing::error!(message = %error.message, "job trigger failed");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, error.message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn build_api_router(config: &ServerConfig, handlers: ApiHandlers) -> Result<Router, ServerError> {
    let reclaim_path = config.reclaim_path.trim();
    if !reclaim_path.starts_with('/') || reclaim_path == HEALTHZ_PATH || reclaim_path == JOBS_PATH {
        return Err(ServerError::InvalidReclaimPath {
            path: config.reclaim_path.clone(),
        });
    }

    let state: ApiStateHandle = Arc::new(ApiState {
        handlers,
        nonce_header: config.nonce_header.trim().to_ascii_lowercase(),
    });

    let router = Router::new()
        .route(
            HEALTHZ_PATH,
            get(healthz).fallback(wrong_method),
        )
        .route(
            JOBS_PATH,
            post(trigger_job).fallback(wrong_method),
        )
        .route(
            reclaim_path,
            post(reclaim_scheduled).fallback(wrong_method),
        )
        .fallback(unknown_route)
        .layer(AddExtensionLayer::new(state));
    Ok(router)
}

/// Bind the listener and serve until SIGINT or SIGTERM, then drain for at most
/// [`DRAIN_TIMEOUT`].
pub async fn serve(config: ServerConfig, handlers: ApiHandlers) -> Result<(), ServerError> {
    let listen_addr = parse_listen_addr(&config.listen_addr)?;
    let app = with_request_tracing(build_api_router(&config, handlers)?);
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: listen_addr.to_string(),
            source,
        })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, reclaim_path = %config.reclaim_path, "cloudburst server listening");

    let (signal_tx, mut signal_rx) = watch::channel(None::<ShutdownSignal>);
    let graceful = async move {
        let signal = shutdown_signal().await;
        signal_tx.send_replace(Some(signal));
    };
    let server = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(graceful)
        .into_future();
    let deadline = async {
        if signal_rx.changed().await.is_err() {
            return std::future::pending().await;
        }
        tracing::info!("draining open connections");
        tokio::time::sleep(DRAIN_TIMEOUT).await;
    };

    tokio::select! {
        result = server => result.map_err(|source| ServerError::Serve { source })?,
        () = deadline => {
            tracing::warn!(seconds = DRAIN_TIMEOUT.as_secs(), "drain deadline passed; dropping connections");
        }
    }
    Ok(())
}

fn with_request_tracing(router: Router) -> Router {
    let layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let route = request
                .extensions()
                .get::<MatchedPath>()
                .map_or_else(|| request.uri().path().to_string(), |m| m.as_str().to_string());
            tracing::info_span!("http.request", method = %request.method(), route = %route)
        })
        .on_response(
            |response: &axum::response::Response, latency: Duration, span: &tracing::Span| {
                let elapsed_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
                tracing::info!(parent: span, status = response.status().as_u16(), elapsed_ms, "served");
            },
        )
        .on_failure(
            |failure: ServerErrorsFailureClass, latency: Duration, span: &tracing::Span| {
                let elapsed_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
                tracing::error!(parent: span, elapsed_ms, %failure, "request failed");
            },
        );
    router.layer(layer)
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
    })
}

async fn trigger_job(
    Extension(state): Extension<ApiStateHandle>,
    body: Bytes,
) -> Result<Json<ResultBody>, ApiError> {
    let request: TriggerRequest = serde_json::from_slice(&body).map_err(|err| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("expected a JSON body with an `id` field: {err}"),
        )
    })?;
    let job_id = request.id.trim().to_string();
    if job_id.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "`id` must not be empty"));
    }
    tracing::info!(%job_id, "job trigger received");
    let result = state.handlers.trigger.trigger(job_id).await?;
    Ok(Json(ResultBody { result }))
}

async fn reclaim_scheduled(
    Extension(state): Extension<ApiStateHandle>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ResultBody>, ApiError> {
    let notice =
        validate_reclaim_request(&headers, &state.nonce_header, &body).map_err(ApiError::reclaim)?;
    tracing::warn!(
        target_id = %notice.id,
        event = %notice.event,
        timestamp = %notice.timestamp,
        "instance reclaim scheduled"
    );
    let result = state
        .handlers
        .reclaim
        .reclaim(notice)
        .await
        .map_err(ApiError::reclaim)?;
    Ok(Json(ResultBody { result }))
}

async fn wrong_method(request: Request<Body>) -> ApiError {
    ApiError::new(
        StatusCode::METHOD_NOT_ALLOWED,
        format!("method `{}` not allowed for `{}`", request.method(), request.uri().path()),
    )
}

async fn unknown_route(request: Request<Body>) -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        format!("no route for `{}`", request.uri().path()),
    )
}

async fn shutdown_signal() -> ShutdownSignal {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "ctrl-c handler unavailable");
            return std::future::pending().await;
        }
        ShutdownSignal::Interrupt
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                ShutdownSignal::Terminate
            }
            Err(error) => {
                tracing::warn!(%error, "SIGTERM handler unavailable");
                std::future::pending().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<ShutdownSignal>();

    let signal = tokio::select! {
        signal = interrupt => signal,
        signal = terminate => signal,
    };
    tracing::info!(?signal, "shutdown requested");
    signal
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }
    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}
