use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use super::models::{InstanceFilter, InstanceStatus, Stage, StagePosition};
use super::orchestrator::Orchestrator;
use super::ws;
use crate::errors::WorkflowError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orch: Orchestrator,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub stage: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub stage: Option<String>,
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AdvanceRequest {
    pub stage: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError(pub WorkflowError);

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            WorkflowError::Validation { .. } => StatusCode::BAD_REQUEST,
            WorkflowError::NotFound { .. } => StatusCode::NOT_FOUND,
            WorkflowError::ResourceConflict { .. } | WorkflowError::Integration { .. } => {
                StatusCode::CONFLICT
            }
            WorkflowError::TransientIo { .. } => StatusCode::SERVICE_UNAVAILABLE,
            WorkflowError::Database(_) | WorkflowError::LockPoisoned | WorkflowError::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, kind = self.0.kind(), "request failed");
        }
        let mut body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
            "instance_id": self.0.instance_id(),
        });
        if let WorkflowError::Integration { conflicts, .. } = &self.0 {
            body["conflicts"] = serde_json::json!(conflicts);
        }
        (status, Json(body)).into_response()
    }
}

fn parse_param<T: FromStr>(name: &str, value: Option<&str>, id: Option<&str>) -> Result<Option<T>, ApiError>
where
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.parse::<T>().map_err(|e| {
                ApiError(WorkflowError::validation(id, format!("invalid {}: {}", name, e)))
            })
        })
        .transpose()
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/instances", get(list_instances).post(trigger_instance))
        .route(
            "/api/instances/{id}",
            get(get_instance).delete(delete_instance),
        )
        .route("/api/instances/{id}/merge", post(merge_instance))
        .route("/api/instances/{id}/advance", post(advance_instance))
        .route("/api/instances/{id}/logs", get(get_logs))
        .route("/api/instances/{id}/activity", get(get_activity))
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_instances(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = InstanceFilter {
        status: parse_param::<InstanceStatus>("status", query.status.as_deref(), None)?,
        stage: parse_param::<StagePosition>("stage", query.stage.as_deref(), None)?,
    };
    let instances = state.orch.list(filter).await?;
    Ok(Json(instances))
}

async fn trigger_instance(
    State(state): State<SharedState>,
    Json(req): Json<super::models::TriggerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = state.orch.trigger(req).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn get_instance(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orch.get(&id).await?))
}

async fn delete_instance(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orch.delete(&id).await?))
}

async fn merge_instance(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orch.merge(&id).await?))
}

async fn advance_instance(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<AdvanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stage = parse_param::<Stage>("stage", Some(&req.stage), Some(&id))?
        .ok_or_else(|| ApiError(WorkflowError::validation(Some(&id), "stage is required")))?;
    Ok(Json(state.orch.advance(&id, stage).await?))
}

async fn get_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let stage = parse_param::<Stage>("stage", query.stage.as_deref(), Some(&id))?;
    let view = state
        .orch
        .logs(&id, stage, query.since, query.limit)
        .await?;
    Ok(Json(view))
}

async fn get_activity(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<ActivityQuery>,
) -> Result<impl IntoResponse, ApiError> {
    // Existence check so unknown ids are a 404 rather than an empty list.
    state.orch.get(&id).await?;
    Ok(Json(state.orch.activity(&id, query.limit).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::orchestrator::test_support::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    fn test_app(h: &Harness) -> Router {
        let state = Arc::new(AppState {
            orch: h.orch.clone(),
        });
        api_router().with_state(state)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_check() {
        let h = harness(true);
        let app = test_app(&h);
        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_trigger_then_get_and_list() {
        let h = harness(true);
        let app = test_app(&h);

        let (status, created) = send(
            &app,
            "POST",
            "/api/instances",
            Some(json!({"recipe_name": "plan_build", "instance_id": "wf-1", "external_ticket_ref": "T-9"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["id"], "wf-1");
        assert_eq!(created["current_stage"], "plan");
        assert_eq!(created["ticket_ref"], "T-9");

        wait_for(&h.orch, "wf-1", |i| i.status == InstanceStatus::InProgress).await;
        let (status, detail) = send(&app, "GET", "/api/instances/wf-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["status"], "in_progress");
        assert!(detail["activity"].as_array().unwrap().len() >= 2);

        let (status, listed) = send(&app, "GET", "/api/instances?status=in_progress&stage=plan", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (_, none) = send(&app, "GET", "/api/instances?stage=ready_to_merge", None).await;
        assert!(none.as_array().unwrap().is_empty());
        h.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_error_bodies_carry_kind_and_instance() {
        let h = harness(true);
        let app = test_app(&h);

        let (status, body) = send(
            &app,
            "POST",
            "/api/instances",
            Some(json!({"recipe_name": "plan_deploy", "instance_id": "wf-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
        assert_eq!(body["instance_id"], "wf-1");

        let (status, body) = send(&app, "GET", "/api/instances/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
        assert_eq!(body["instance_id"], "ghost");

        let (status, _) = send(&app, "GET", "/api/instances?status=sleeping", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        send(&app, "POST", "/api/instances", Some(json!({"recipe_name": "plan", "instance_id": "wf-2"}))).await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/instances",
            Some(json!({"recipe_name": "plan", "instance_id": "wf-2"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "resource_conflict");
        h.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_merge_conflict_is_409_with_files() {
        let h = harness(true);
        h.copies.merge_conflict.store(true, Ordering::SeqCst);
        h.runner.allow(1);
        let app = test_app(&h);
        send(&app, "POST", "/api/instances", Some(json!({"recipe_name": "plan", "instance_id": "wf-m"}))).await;
        wait_for(&h.orch, "wf-m", |i| i.status == InstanceStatus::Completed).await;

        let (status, body) = send(&app, "POST", "/api/instances/wf-m/merge", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "integration");
        assert_eq!(body["conflicts"], json!(["README.md"]));
    }

    #[tokio::test]
    async fn test_merge_and_delete_lifecycle() {
        let h = harness(true);
        h.runner.allow(1);
        let app = test_app(&h);
        send(&app, "POST", "/api/instances", Some(json!({"recipe_name": "plan", "instance_id": "wf-l"}))).await;
        wait_for(&h.orch, "wf-l", |i| i.status == InstanceStatus::Completed).await;

        let (status, merged) = send(&app, "POST", "/api/instances/wf-l/merge", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(merged["status"], "merged");
        let (_, listed) = send(&app, "GET", "/api/instances", None).await;
        assert_eq!(listed[0]["status"], "merged");

        let (status, report) = send(&app, "DELETE", "/api/instances/wf-l", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["instance_id"], "wf-l");
        let (_, listed) = send(&app, "GET", "/api/instances", None).await;
        assert!(listed.as_array().unwrap().is_empty());

        let (status, tombstone) = send(&app, "GET", "/api/instances/wf-l", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(tombstone["deleted_reason"], "deleted");
    }

    #[tokio::test]
    async fn test_advance_and_logs_endpoints() {
        let h = harness(false);
        let app = test_app(&h);
        send(&app, "POST", "/api/instances", Some(json!({"recipe_name": "plan_build", "instance_id": "wf-x"}))).await;
        wait_for(&h.orch, "wf-x", |i| i.status == InstanceStatus::InProgress).await;

        let (status, body) = send(&app, "GET", "/api/instances/wf-x/logs?stage=review", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");

        let (status, view) = send(&app, "GET", "/api/instances/wf-x/logs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["instance_id"], "wf-x");
        assert_eq!(view["degraded"], false);

        let (status, _) = send(&app, "POST", "/api/instances/wf-x/advance", Some(json!({"stage": "build"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, moved) = send(&app, "POST", "/api/instances/wf-x/advance", Some(json!({"stage": "plan"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(moved["current_stage"], "build");

        let (status, activity) = send(&app, "GET", "/api/instances/wf-x/activity?limit=2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(activity.as_array().unwrap().len(), 2);
        h.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_advance_conflicts_with_builtin_runner() {
        let h = harness(true);
        let app = test_app(&h);
        send(&app, "POST", "/api/instances", Some(json!({"recipe_name": "plan_build", "instance_id": "wf-r"}))).await;
        wait_for(&h.orch, "wf-r", |i| i.status == InstanceStatus::InProgress).await;

        let (status, body) = send(&app, "POST", "/api/instances/wf-r/advance", Some(json!({"stage": "plan"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["instance_id"], "wf-r");
        h.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_ws_rejects_unknown_instance_before_upgrade() {
        let h = harness(true);
        let app = test_app(&h);
        let (status, body) = send(&app, "GET", "/ws?instance_id=ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["instance_id"], "ghost");
    }
}
