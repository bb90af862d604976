//! HTTP control plane: rule CRUD, alert queries, node listing and the
//! on-demand flamegraph trigger. JSON in, JSON out; no rendering.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use podwatch_store::{NewRule, RuleUpdate, StoreError};

use crate::registry::{RegistryError, PROFILE_TIMEOUT};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/:key", get(node_snapshot))
        .route("/api/rules", post(create_rule))
        .route(
            "/api/rules/:key",
            get(list_rules).put(update_rule).delete(delete_rule),
        )
        .route("/api/alerts/:key", get(firing_alerts))
        .route("/api/alerts/:key/history", get(alert_history))
        .route("/api/alerts/:key/dismiss", post(dismiss_alert))
        .route("/api/flamegraph", get(flamegraph))
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) => StatusCode::BAD_REQUEST,
            StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<podwatch_alert::EvaluatorError> for ApiError {
    fn from(e: podwatch_alert::EvaluatorError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

async fn list_nodes(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "nodes": state.registry.connected_nodes() }))
}

async fn node_snapshot(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .latest_snapshot(&key)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no snapshot for node {key}")))
}

async fn create_rule(
    State(state): State<AppState>,
    Json(rule): Json<NewRule>,
) -> Result<impl IntoResponse, ApiError> {
    let rule = state.store.insert_rule(rule)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn list_rules(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_rules_by_node(&key)?))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(update): Json<RuleUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_no_firing_alert(&state, &key, "update")?;
    Ok(Json(state.store.update_rule(&key, update)?))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_no_firing_alert(&state, &key, "delete")?;
    state.store.soft_delete_rule(&key)?;
    Ok(StatusCode::NO_CONTENT)
}

/// A rule with a firing alert may not be mutated; the incident has to
/// resolve or be dismissed first.
fn ensure_no_firing_alert(state: &AppState, rule_id: &str, action: &str) -> Result<(), ApiError> {
    let Some(rule) = state.store.get_rule(rule_id)? else {
        // Missing rules fall through to the store's NotFound.
        return Ok(());
    };
    if state
        .store
        .get_firing_by_rule(&rule.id, &rule.target, rule.metric)?
        .is_some()
    {
        return Err(ApiError::conflict(format!(
            "cannot {action} rule {rule_id} with an active alert; resolve or dismiss it first"
        )));
    }
    Ok(())
}

async fn firing_alerts(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_firing_by_node(&key)?))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_days")]
    days: i64,
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_days() -> i64 {
    7
}

fn default_history_limit() -> usize {
    100
}

async fn alert_history(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .store
            .list_history_by_node(&key, query.days, query.limit)?,
    ))
}

async fn dismiss_alert(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.evaluator.dismiss(&key)? {
        Ok(Json(json!({ "dismissed": key })))
    } else {
        Err(ApiError::not_found(format!("no firing alert {key}")))
    }
}

#[derive(Deserialize)]
struct FlamegraphQuery {
    node_name: String,
    pod_name: String,
    #[serde(default = "default_profile_duration")]
    duration: i32,
}

fn default_profile_duration() -> i32 {
    30
}

/// Dispatches a profile command over the node's stream and relays the tree.
async fn flamegraph(
    State(state): State<AppState>,
    Query(query): Query<FlamegraphQuery>,
) -> Response {
    let result = state
        .registry
        .dispatch_profile(
            &query.node_name,
            &query.pod_name,
            query.duration,
            PROFILE_TIMEOUT,
        )
        .await;

    match result {
        Ok(response) if response.error.is_empty() => (
            [(header::CONTENT_TYPE, "application/json")],
            response.payload,
        )
            .into_response(),
        Ok(response) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": response.error })),
        )
            .into_response(),
        Err(e @ RegistryError::NotConnected(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(e @ RegistryError::Timeout) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
