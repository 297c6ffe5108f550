//! HTTP control plane for the wirescope sensor
//!
//! Read-only views of taps, input streams, policies and stream handlers,
//! per-handler metric snapshots, and (in admin mode) policy creation and
//! removal at runtime.

mod api;

pub use api::{ApiError, ApiResult};

use axum::{
    response::Json,
    routing::get,
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use wirescope_core::{CoreRegistry, SensorSettings};

/// Web server configuration
#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    /// Mount the policy create/delete routes
    pub admin_api: bool,
    /// Serve Prometheus metrics at `/metrics`
    pub prometheus: bool,
    /// `instance` label put on every Prometheus sample
    pub prom_instance: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self::from(&SensorSettings::default())
    }
}

impl From<&SensorSettings> for WebConfig {
    fn from(settings: &SensorSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            admin_api: settings.admin_api,
            prometheus: settings.prometheus,
            prom_instance: settings.prom_instance.clone(),
        }
    }
}

/// Shared application state
pub struct AppState {
    pub registry: Arc<CoreRegistry>,
    pub prom_instance: Option<String>,
}

/// Build the API router
pub fn router(registry: Arc<CoreRegistry>, config: &WebConfig) -> Router {
    let state = Arc::new(AppState {
        registry,
        prom_instance: config.prom_instance.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut policies = get(api::list_policies);
    let mut policy = get(api::get_policy);
    if config.admin_api {
        policies = policies.post(api::create_policies);
        policy = policy.delete(api::delete_policy);
    }

    let mut app = Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/plugins", get(api::list_plugins))
        .route("/api/v1/taps", get(api::list_taps))
        .route("/api/v1/inputs", get(api::list_inputs))
        .route("/api/v1/handlers", get(api::list_handlers))
        .route("/api/v1/policies", policies)
        .route("/api/v1/policies/{name}", policy)
        .route(
            "/api/v1/inputs/{input_type}/{input_name}/handlers/{handler_type}/{handler_name}",
            get(api::get_handler),
        )
        .route(
            "/api/v1/inputs/{input_type}/{input_name}/handlers/{handler_type}/{handler_name}/bucket/{bucket}",
            get(api::get_handler_bucket),
        );
    if config.prometheus {
        app = app.route("/metrics", get(api::get_metrics_prometheus));
    }

    app.layer(cors).with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn start_server<F>(
    config: WebConfig,
    registry: Arc<CoreRegistry>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(registry, &config);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Control API available at http://{}", addr);
    if config.admin_api {
        info!("  - admin routes enabled (POST/DELETE /api/v1/policies)");
    }
    if config.prometheus {
        info!("  - Prometheus metrics at /metrics");
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Control API stopped");
    Ok(())
}

/// Health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "wirescope",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
