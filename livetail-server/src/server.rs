use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::Context;
use axum::{
    Extension, Router,
    http::{HeaderValue, Method, StatusCode, header},
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::config::server::{Config, DatabaseConfig, LogFormat, StorageBackend};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    app_state::AppState,
    db::bootstrap,
    middleware::request_context::{self, RequestIdState},
    routes::{self, openapi::openapi_routes},
    services::multiplexer::SharedMultiplexer,
    tracer,
};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide Prometheus handle. Installs the recorder on first use; if
/// another recorder already owns the global slot the handle still renders,
/// just without samples.
pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if metrics::set_global_recorder(recorder).is_err() {
                warn!("a metrics recorder is already installed");
            }
            handle
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber; returns the configured level.
///
/// A second call (tests, embedded use) keeps the first subscriber.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

pub async fn create_database_pool(db: &DatabaseConfig) -> Result<sqlx::PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .connect(&db.url)
        .await?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(db.max_connections));
    Ok(pool)
}

/// Build the application state for the configured storage backend,
/// bootstrapping Postgres when selected.
pub async fn create_app_state(config: Arc<Config>) -> anyhow::Result<Arc<AppState>> {
    match config.storage.backend {
        StorageBackend::Memory => {
            info!("using in-memory storage backend");
            let (state, _stores) = AppState::in_memory(config);
            Ok(Arc::new(state))
        }
        StorageBackend::Postgres => {
            let pool = create_database_pool(&config.db)
                .await
                .context("failed to connect to Postgres")?;
            bootstrap::ensure_liveness(&pool)
                .await
                .context("database liveness check failed")?;
            let applied = bootstrap::run(&pool, &config.db)
                .await
                .context("database bootstrap failed")?;
            bootstrap::ensure_readiness(&pool)
                .await
                .context("database readiness check failed")?;
            info!(applied, "postgres storage backend ready");
            Ok(Arc::new(AppState::with_postgres(config, pool)))
        }
    }
}

pub fn create_cors_layer(config: &Config) -> CorsLayer {
    let mut cors = CorsLayer::new()
        .allow_methods(AllowMethods::list([
            Method::GET,
            Method::POST,
            Method::OPTIONS,
        ]))
        .allow_headers(AllowHeaders::any())
        .allow_credentials(config.server.cors.allow_credentials)
        .max_age(Duration::from_secs(config.server.cors.max_age_seconds));

    if config.server.cors.allowed_origins.is_empty() {
        cors = cors.allow_origin(AllowOrigin::any());
    } else {
        let origins = config
            .server
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect::<Vec<_>>();
        cors = cors.allow_origin(AllowOrigin::list(origins));
    }

    cors
}

/// Routes nested under `/api`.
pub fn create_api_router(state: &AppState) -> Router<Arc<AppState>> {
    Router::new()
        .merge(routes::admin::create_router_admin(state.auth.clone()))
        .merge(routes::chat::create_router_chat(state.auth.clone()))
}

/// The full application router with middleware.
pub fn create_app_router(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let cors = create_cors_layer(&state.config);
    let request_id_state = RequestIdState::from_config(&state.config);

    Router::new()
        .nest("/api", create_api_router(&state))
        .merge(routes::health::create_health_router())
        .route("/metrics", get(metrics_endpoint))
        .merge(openapi_routes())
        .layer(Extension(metrics_handle))
        .layer(cors)
        .layer(tracer::create_trace_layer())
        .layer(axum::middleware::from_fn_with_state(
            request_id_state,
            request_context::assign_request_id,
        ))
        .with_state(state)
}

/// Resolves on Ctrl+C, after asking every tail session to close so their
/// streams end and graceful shutdown can complete.
pub async fn create_shutdown_signal(multiplexer: SharedMultiplexer) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl+C; shutting down");
    }
    let closed = multiplexer.shutdown_all().await;
    info!(closed, "shutting down");
}

/// Starts the server and serves until shutdown.
pub async fn run(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    info!(profile = ?config.profile, "starting livetail server");

    let metrics_handle = metrics_handle();
    let config = Arc::new(config);
    let state = create_app_state(Arc::clone(&config)).await?;
    let multiplexer = state.multiplexer();
    let app = create_app_router(state, metrics_handle);

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("invalid server.host '{}'", config.server.host))?;
    let addr = SocketAddr::from((host, config.server.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    serve(listener, app)
        .with_graceful_shutdown(create_shutdown_signal(multiplexer))
        .await
        .context("server terminated unexpectedly")?;

    Ok(())
}
