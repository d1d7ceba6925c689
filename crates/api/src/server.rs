use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use cohort_indexer::control::{self, ControlError, IntersectionQuery, RegisterRequest};
use cohort_indexer::storage::{CursorPatch, FailedRange, Storage, SyncCursor};
use serde::Serialize;
use std::net::SocketAddr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

#[derive(Clone)]
struct AppState {
    storage: Storage,
}

/// Runtime configuration for the Cohort API server.
#[derive(Debug, Clone)]
pub struct ApiRuntimeConfig {
    database_url: String,
    port: u16,
}

impl ApiRuntimeConfig {
    /// Build runtime configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://cohort.db".to_string());
        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        Ok(Self { database_url, port })
    }

    /// Build test configuration over `database_url`.
    pub fn for_test(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            port: 0,
        }
    }
}

async fn build_state(config: &ApiRuntimeConfig) -> anyhow::Result<AppState> {
    let storage = Storage::new(&config.database_url, None, None).await?;
    storage.run_migrations().await?;
    Ok(AppState { storage })
}

fn router_for_state(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sync", post(register_sync))
        .route("/sync/:protocol", get(get_sync).patch(patch_sync))
        .route("/sync/:protocol/failures", get(get_failures))
        .route("/event", post(post_event))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Build an in-process API router from explicit runtime config.
pub async fn build_app(config: &ApiRuntimeConfig) -> anyhow::Result<Router> {
    let state = build_state(config).await?;
    Ok(router_for_state(state))
}

/// Run the API server with explicit runtime configuration.
pub async fn run_with_config(config: ApiRuntimeConfig) -> anyhow::Result<()> {
    let state = build_state(&config).await?;
    let storage_for_shutdown = state.storage.clone();
    let app = router_for_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Cohort API server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    storage_for_shutdown.close().await;
    info!("Cohort API server shutdown complete");
    Ok(())
}

/// Run the API server using environment-driven configuration.
pub async fn run_from_env() -> anyhow::Result<()> {
    run_with_config(ApiRuntimeConfig::from_env()?).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

async fn health(State(_state): State<AppState>) -> &'static str {
    "OK"
}

const ERROR_CODE_INVALID_REQUEST: &str = "invalid_request";
const ERROR_CODE_NOT_FOUND: &str = "not_found";
const ERROR_CODE_CONFLICT: &str = "conflict";
const ERROR_CODE_INTERNAL_ERROR: &str = "internal_error";

#[derive(Serialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorInfo,
}

#[derive(Serialize)]
struct ErrorInfo {
    code: &'static str,
    message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<DataResponse<T>>, ApiError>;

fn api_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorInfo {
                code,
                message: message.into(),
            },
        }),
    )
}

fn control_error(err: ControlError) -> ApiError {
    match err {
        ControlError::AlreadyRegistered(_) => {
            api_error(StatusCode::CONFLICT, ERROR_CODE_CONFLICT, err.to_string())
        }
        ControlError::NotFound(_) => {
            api_error(StatusCode::NOT_FOUND, ERROR_CODE_NOT_FOUND, err.to_string())
        }
        ControlError::Invalid(_) => api_error(
            StatusCode::BAD_REQUEST,
            ERROR_CODE_INVALID_REQUEST,
            err.to_string(),
        ),
        ControlError::Storage(e) => {
            error!("Storage error: {:#}", e);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ERROR_CODE_INTERNAL_ERROR,
                format!("Internal error: {}", e),
            )
        }
    }
}

/// Unwrap a JSON body, answering malformed input in the error envelope.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value).map_err(|rejection| {
        api_error(
            StatusCode::BAD_REQUEST,
            ERROR_CODE_INVALID_REQUEST,
            rejection.body_text(),
        )
    })
}

fn data<T>(data: T) -> ApiResult<T> {
    Ok(Json(DataResponse { data }))
}

async fn register_sync(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<SyncCursor> {
    let request = json_body(body)?;
    let cursor = control::register_cursor(&state.storage, &request)
        .await
        .map_err(control_error)?;
    info!(protocol = %cursor.protocol, block = cursor.block_number, "Registered sync cursor");
    data(cursor)
}

async fn patch_sync(
    State(state): State<AppState>,
    Path(protocol): Path<String>,
    body: Result<Json<CursorPatch>, JsonRejection>,
) -> ApiResult<CursorPatch> {
    let patch = json_body(body)?;
    let cursor = control::patch_cursor(&state.storage, &protocol, &patch)
        .await
        .map_err(control_error)?;
    warn!(
        protocol = %cursor.protocol,
        block = cursor.block_number,
        syncing = cursor.syncing,
        "Sync cursor patched by operator"
    );
    data(patch)
}

async fn get_sync(
    State(state): State<AppState>,
    Path(protocol): Path<String>,
) -> ApiResult<SyncCursor> {
    let cursor = control::get_cursor(&state.storage, &protocol)
        .await
        .map_err(control_error)?;
    data(cursor)
}

async fn get_failures(
    State(state): State<AppState>,
    Path(protocol): Path<String>,
) -> ApiResult<Vec<FailedRange>> {
    let failures = control::list_failures(&state.storage, &protocol)
        .await
        .map_err(control_error)?;
    data(failures)
}

async fn post_event(
    State(state): State<AppState>,
    body: Result<Json<IntersectionQuery>, JsonRejection>,
) -> ApiResult<Vec<usize>> {
    let query = json_body(body)?;
    let result = control::intersect(&state.storage, &query)
        .await
        .map_err(control_error)?;
    data(result.sizes())
}
