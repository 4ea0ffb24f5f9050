//! Task endpoints.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use super::envelope::{error_response, not_found, Envelope, Pagination};
use super::{authenticate, AppState};
use crate::error::ExecutionError;
use crate::runtime::Cancel;
use crate::storage::{SortField, SortOrder, TaskQuery};
use crate::types::{Task, TaskStatus};

const MAX_STEPS_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub url: String,
    pub navigation_goal: String,
    #[serde(default)]
    pub extraction_goal: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub extracted_data_schema: Option<Value>,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub retries_per_step: Option<u32>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default)]
    pub proxy_location: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub totp_url: Option<String>,
}

pub async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateTaskRequest>,
) -> Response {
    let (org, request_id) = match authenticate(&state, &headers, "POST /tasks").await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    if let Err(e) = validate_create(&request) {
        return error_response(&request_id, &e);
    }

    let mut task = Task::new(&org.organization_id, &request.url, &request.navigation_goal);
    task.extraction_goal = request.extraction_goal;
    task.payload = request.payload;
    task.extracted_data_schema = request.extracted_data_schema;
    task.max_steps = request.max_steps.unwrap_or(10);
    task.retries_per_step = request.retries_per_step.unwrap_or(2);
    task.max_duration_secs = request.max_duration_secs;
    task.proxy_location = request.proxy_location;
    task.webhook_url = request.webhook_url;
    task.totp_url = request.totp_url;
    task.request_id = Some(request_id.clone());

    if let Err(e) = state.storage.create_task(&task).await {
        return error_response(&request_id, &e);
    }

    if let Some(url) = task.webhook_url.clone() {
        let notifier = state.webhooks.clone();
        let payload = serde_json::to_value(&task).unwrap_or(Value::Null);
        let rid = task.request_id.clone();
        tokio::spawn(async move {
            let _ = notifier.deliver(&url, "task.created", payload, rid).await;
        });
    }

    // Enqueue for the engine: the run gate bounds global and per-tenant
    // concurrency.
    let cancel = Cancel::new();
    state.cancels.insert(task.task_id.clone(), cancel.clone());
    let spawn_state = state.clone();
    let task_id = task.task_id.clone();
    let org_id = org.organization_id.clone();
    tokio::spawn(async move {
        let _permits = spawn_state.run_gate.acquire(&org_id).await;
        if let Err(e) = spawn_state.engine.execute_task(&org_id, &task_id, cancel).await {
            error!(task_id, "task execution errored: {}", e);
        }
        spawn_state.cancels.remove(&task_id);
    });

    Json(Envelope::ok(&request_id, task)).into_response()
}

fn validate_create(request: &CreateTaskRequest) -> crate::error::Result<()> {
    url::Url::parse(&request.url)
        .map_err(|e| ExecutionError::Validation(format!("invalid url: {}", e)))?;
    if request.navigation_goal.trim().is_empty() {
        return Err(ExecutionError::Validation("navigation_goal is required".into()));
    }
    if request.max_steps.unwrap_or(10) > MAX_STEPS_LIMIT {
        return Err(ExecutionError::Validation(format!(
            "max_steps exceeds limit of {}",
            MAX_STEPS_LIMIT
        )));
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTasksParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_after: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub created_before: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub sort_by: Option<SortField>,
    #[serde(default)]
    pub order: Option<SortOrder>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListTasksParams>,
) -> Response {
    let (org, request_id) = match authenticate(&state, &headers, "GET /tasks").await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let statuses = match parse_statuses(params.status.as_deref()) {
        Ok(statuses) => statuses,
        Err(e) => return error_response(&request_id, &e),
    };
    let query = TaskQuery {
        statuses,
        created_after: params.created_after,
        created_before: params.created_before,
        search: params.search,
        sort_by: params.sort_by.unwrap_or(SortField::CreatedAt),
        order: params.order.unwrap_or(SortOrder::Desc),
        page: params.page.unwrap_or(1),
        page_size: params.page_size.unwrap_or(20).clamp(1, 100),
    };

    match state.storage.list_tasks(&org.organization_id, &query).await {
        Ok(page) => {
            let pagination = Pagination {
                page: page.page,
                page_size: page.page_size,
                total: page.total,
            };
            Json(Envelope::ok_paginated(&request_id, page.items, pagination)).into_response()
        }
        Err(e) => error_response(&request_id, &e),
    }
}

fn parse_statuses(raw: Option<&str>) -> crate::error::Result<Vec<TaskStatus>> {
    let raw = match raw {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(Vec::new()),
    };
    raw.split(',')
        .map(|token| {
            serde_json::from_value(Value::String(token.trim().to_string()))
                .map_err(|_| ExecutionError::Validation(format!("unknown status '{}'", token)))
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
pub struct ExpandParams {
    #[serde(default)]
    pub include: Option<String>,
}

pub async fn get_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Query(params): Query<ExpandParams>,
) -> Response {
    let (org, request_id) = match authenticate(&state, &headers, "GET /tasks/{id}").await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let task = match state.storage.get_task(&org.organization_id, &task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => return not_found(&request_id, "TASK_NOT_FOUND", "no such task"),
        Err(e) => return error_response(&request_id, &e),
    };

    let include = params.include.unwrap_or_default();
    let mut data = json!({ "task": task });
    if include.contains("steps") {
        match state.storage.list_steps(&task_id).await {
            Ok(steps) => data["steps"] = json!(steps),
            Err(e) => return error_response(&request_id, &e),
        }
    }
    if include.contains("artifacts") {
        match state.storage.list_artifacts_for_task(&task_id).await {
            Ok(artifacts) => data["artifacts"] = json!(artifacts),
            Err(e) => return error_response(&request_id, &e),
        }
    }
    Json(Envelope::ok(&request_id, data)).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelTaskRequest {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub force: Option<bool>,
}

pub async fn cancel_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Option<Json<CancelTaskRequest>>,
) -> Response {
    let (org, request_id) = match authenticate(&state, &headers, "POST /tasks/{id}/cancel").await {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    let request = body.map(|Json(b)| b).unwrap_or_default();

    let mut task = match state.storage.get_task(&org.organization_id, &task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => return not_found(&request_id, "TASK_NOT_FOUND", "no such task"),
        Err(e) => return error_response(&request_id, &e),
    };

    if task.status.is_terminal() {
        return Json(Envelope::ok(&request_id, task)).into_response();
    }

    // Signal the running engine; it cancels at the next safe point.
    if let Some(entry) = state.cancels.get(&task_id) {
        entry.value().fire();
    } else {
        // Not yet picked up: flip directly.
        task.status = TaskStatus::Canceled;
        task.failure_reason = Some(ExecutionError::Canceled.failure_reason());
        task.completed_at = Some(chrono::Utc::now());
        if let Err(e) = state.storage.update_task(&task).await {
            return error_response(&request_id, &e);
        }
    }

    if request.force.unwrap_or(false) {
        // Force closes the live browser immediately.
        state.sessions.cleanup_for_task(&task_id).await;
    }

    Json(Envelope::ok(
        &request_id,
        json!({ "task_id": task_id, "reason": request.reason, "status": task.status }),
    ))
    .into_response()
}

pub async fn get_task_steps(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Query(params): Query<ExpandParams>,
) -> Response {
    let (org, request_id) = match authenticate(&state, &headers, "GET /tasks/{id}/steps").await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    if let Ok(None) | Err(_) = state.storage.get_task(&org.organization_id, &task_id).await {
        return not_found(&request_id, "TASK_NOT_FOUND", "no such task");
    }
    let steps = match state.storage.list_steps(&task_id).await {
        Ok(steps) => steps,
        Err(e) => return error_response(&request_id, &e),
    };

    let include = params.include.unwrap_or_default();
    if include.contains("artifacts") || include.contains("screenshots") {
        let mut expanded = Vec::with_capacity(steps.len());
        for step in steps {
            let artifacts = state
                .storage
                .list_artifacts_for_step(&step.step_id)
                .await
                .unwrap_or_default();
            expanded.push(json!({ "step": step, "artifacts": artifacts }));
        }
        return Json(Envelope::ok(&request_id, expanded)).into_response();
    }
    Json(Envelope::ok(&request_id, steps)).into_response()
}
