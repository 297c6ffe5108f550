//! REST API handlers

use crate::AppState;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use wirescope_core::config::parse_document;
use wirescope_core::{
    CoreError, ErrorKind, Module, ModuleGuard, ModuleStore, PrometheusText, StreamHandler,
};

/// Error returned by an API handler, rendered as `{"error": message}`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => ApiError::NotFound(message),
            ErrorKind::InvalidConfig | ErrorKind::TypeMismatch | ErrorKind::ChainIncompatible => {
                ApiError::BadRequest(message)
            }
            ErrorKind::NameConflict | ErrorKind::InUse => ApiError::Conflict(message),
            ErrorKind::RuntimeStartFailure => ApiError::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "API request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
pub struct ModulesResponse {
    pub total: usize,
    pub modules: Vec<Value>,
}

#[derive(Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub description: String,
}

#[derive(Serialize)]
pub struct PluginsResponse {
    pub inputs: Vec<PluginInfo>,
    pub handlers: Vec<PluginInfo>,
}

#[derive(Serialize)]
pub struct PoliciesCreated {
    pub created: Vec<String>,
}

/// Info snapshot of every module in a store, in insertion order.
/// Each module is locked on its own, one at a time.
async fn snapshot<M: Module + ?Sized>(store: &ModuleStore<M>) -> ModulesResponse {
    let mut modules = Vec::with_capacity(store.len());
    for handle in store.enumerate() {
        modules.push(handle.lock().await.info_json());
    }
    ModulesResponse {
        total: modules.len(),
        modules,
    }
}

pub async fn list_taps(State(state): State<Arc<AppState>>) -> Json<ModulesResponse> {
    Json(snapshot(state.registry.tap_manager().taps()).await)
}

pub async fn list_policies(State(state): State<Arc<AppState>>) -> Json<ModulesResponse> {
    Json(snapshot(state.registry.policy_manager().policies()).await)
}

pub async fn list_inputs(State(state): State<Arc<AppState>>) -> Json<ModulesResponse> {
    Json(snapshot(state.registry.input_manager().streams()).await)
}

pub async fn list_handlers(State(state): State<Arc<AppState>>) -> Json<ModulesResponse> {
    Json(snapshot(state.registry.handler_manager().handlers()).await)
}

pub async fn list_plugins(State(state): State<Arc<AppState>>) -> Json<PluginsResponse> {
    let describe = |entries: Vec<(String, String)>| {
        entries
            .into_iter()
            .map(|(name, description)| PluginInfo { name, description })
            .collect()
    };
    let plugins = state.registry.plugins();
    Json(PluginsResponse {
        inputs: describe(plugins.describe_inputs()),
        handlers: describe(plugins.describe_handlers()),
    })
}

pub async fn get_policy(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let policy = state
        .registry
        .policy_manager()
        .module_get_locked(&name)
        .await
        .map_err(|_| ApiError::NotFound(format!("policy '{}' does not exist", name)))?;
    Ok(Json(policy.info_json()))
}

/// Check that the input exists and has the expected type
async fn check_input(state: &AppState, input_type: &str, input_name: &str) -> ApiResult<()> {
    let input = state
        .registry
        .input_manager()
        .streams()
        .get_locked(input_name)
        .await
        .map_err(|_| ApiError::NotFound("input name does not exist".to_string()))?;
    if input.input_type() != input_type {
        return Err(ApiError::BadRequest(format!(
            "input stream is not {}",
            input_type
        )));
    }
    Ok(())
}

/// Lock a handler after checking both it and its input stream exist with
/// the expected types
async fn locked_handler(
    state: &AppState,
    input_type: &str,
    input_name: &str,
    handler_type: &str,
    handler_name: &str,
) -> ApiResult<ModuleGuard<dyn StreamHandler>> {
    check_input(state, input_type, input_name).await?;
    let handler = state
        .registry
        .handler_manager()
        .handlers()
        .get_locked(handler_name)
        .await
        .map_err(|_| ApiError::NotFound("handler name does not exist".to_string()))?;
    if handler.schema_key() != handler_type {
        return Err(ApiError::BadRequest(format!(
            "handler stream is not {}",
            handler_type
        )));
    }
    Ok(handler)
}

pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Path((input_type, input_name, handler_type, handler_name)): Path<(
        String,
        String,
        String,
        String,
    )>,
) -> ApiResult<Json<Value>> {
    let handler = locked_handler(
        &state,
        &input_type,
        &input_name,
        &handler_type,
        &handler_name,
    )
    .await?;
    Ok(Json(handler.info_json()))
}

pub async fn get_handler_bucket(
    State(state): State<Arc<AppState>>,
    Path((input_type, input_name, handler_type, handler_name, bucket)): Path<(
        String,
        String,
        String,
        String,
        usize,
    )>,
) -> ApiResult<Json<Value>> {
    let handler = locked_handler(
        &state,
        &input_type,
        &input_name,
        &handler_type,
        &handler_name,
    )
    .await?;
    match handler.window_json(bucket) {
        Ok(window) => Ok(Json(window)),
        Err(CoreError::NotFound(msg)) => Err(ApiError::NotFound(msg)),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

/// Handler metrics of every policy in Prometheus text format
pub async fn get_metrics_prometheus(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut out = PrometheusText::new();
    for handle in state.registry.policy_manager().policies().enumerate() {
        let (policy, input, handlers) = {
            let policy = handle.lock().await;
            (
                policy.name().to_string(),
                policy.input_name().to_string(),
                policy.modules().to_vec(),
            )
        };

        let mut labels = Vec::with_capacity(3);
        if let Some(instance) = &state.prom_instance {
            labels.push(("instance", instance.as_str()));
        }
        labels.push(("policy", policy.as_str()));
        labels.push(("input", input.as_str()));

        for handler in handlers {
            handler.lock().await.prometheus(&mut out, &labels);
        }
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        out.render(),
    )
}

/// Load the `policies` section of a YAML document
pub async fn create_policies(
    State(state): State<Arc<AppState>>,
    body: String,
) -> ApiResult<(StatusCode, Json<PoliciesCreated>)> {
    let document = parse_document(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let policies = document.policies.ok_or_else(|| {
        ApiError::BadRequest("configuration has no 'policies' section".to_string())
    })?;

    match state.registry.policy_manager().load(&policies).await {
        Ok(created) => {
            info!(policies = ?created, "Policies created over the API");
            Ok((StatusCode::CREATED, Json(PoliciesCreated { created })))
        }
        Err(e) => {
            warn!(error = %e, "Policy creation over the API failed");
            Err(e.into())
        }
    }
}

pub async fn delete_policy(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    state.registry.policy_manager().remove_policy(&name).await?;
    info!(policy = %name, "Policy removed over the API");
    Ok(Json(json!({ "removed": name })))
}
