//! Workflow and workflow-run endpoints.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::error;

use super::envelope::{error_response, not_found, Envelope};
use super::task_handlers::ExpandParams;
use super::{authenticate, AppState};
use crate::runtime::Cancel;
use crate::types::{Workflow, WorkflowDefinition, WorkflowRun};
use crate::workflow::validate_definition;

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub definition: WorkflowDefinition,
}

pub async fn create_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateWorkflowRequest>,
) -> Response {
    let (org, request_id) = match authenticate(&state, &headers, "POST /workflows").await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    if let Err(e) = validate_definition(&request.definition) {
        return error_response(&request_id, &e);
    }

    let mut workflow = Workflow::new(&org.organization_id, &request.title, request.definition);
    workflow.description = request.description;
    if let Err(e) = state.storage.create_workflow(&workflow).await {
        return error_response(&request_id, &e);
    }
    Json(Envelope::ok(&request_id, workflow)).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRunRequest {
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

pub async fn start_workflow_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(workflow_id): Path<String>,
    Json(request): Json<StartRunRequest>,
) -> Response {
    let (org, request_id) =
        match authenticate(&state, &headers, "POST /workflows/{id}/runs").await {
            Ok(auth) => auth,
            Err(response) => return response,
        };

    let workflow = match state.storage.get_workflow(&org.organization_id, &workflow_id).await {
        Ok(Some(workflow)) => workflow,
        Ok(None) => return not_found(&request_id, "WORKFLOW_NOT_FOUND", "no such workflow"),
        Err(e) => return error_response(&request_id, &e),
    };

    let mut run = WorkflowRun::new(&workflow, request.parameters);
    run.webhook_url = request.webhook_url;
    run.max_duration_secs = request.max_duration_secs;
    run.request_id = Some(request_id.clone());
    if let Err(e) = state.storage.create_workflow_run(&run).await {
        return error_response(&request_id, &e);
    }

    let cancel = Cancel::new();
    state.cancels.insert(run.workflow_run_id.clone(), cancel.clone());
    let spawn_state = state.clone();
    let run_id = run.workflow_run_id.clone();
    let org_id = org.organization_id.clone();
    tokio::spawn(async move {
        let _permits = spawn_state.run_gate.acquire(&org_id).await;
        if let Err(e) = spawn_state
            .orchestrator
            .execute_run(&org_id, &run_id, cancel)
            .await
        {
            error!(run_id, "workflow run errored: {}", e);
        }
        spawn_state.cancels.remove(&run_id);
    });

    Json(Envelope::ok(&request_id, run)).into_response()
}

pub async fn get_workflow_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((workflow_id, run_id)): Path<(String, String)>,
    Query(params): Query<ExpandParams>,
) -> Response {
    let (org, request_id) =
        match authenticate(&state, &headers, "GET /workflows/{id}/runs/{rid}").await {
            Ok(auth) => auth,
            Err(response) => return response,
        };

    let run = match state.storage.get_workflow_run(&org.organization_id, &run_id).await {
        Ok(Some(run)) => run,
        Ok(None) => return not_found(&request_id, "WORKFLOW_RUN_NOT_FOUND", "no such run"),
        Err(e) => return error_response(&request_id, &e),
    };
    if run.workflow_id != workflow_id && run.workflow_permanent_id != workflow_id {
        return not_found(&request_id, "WORKFLOW_RUN_NOT_FOUND", "no such run");
    }

    let include = params.include.unwrap_or_default();
    if include.contains("blocks") {
        let blocks = state
            .storage
            .list_workflow_run_blocks(&run_id)
            .await
            .unwrap_or_default();
        return Json(Envelope::ok(&request_id, json!({ "run": run, "blocks": blocks })))
            .into_response();
    }
    Json(Envelope::ok(&request_id, run)).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRunRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn cancel_workflow_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((_workflow_id, run_id)): Path<(String, String)>,
    body: Option<Json<CancelRunRequest>>,
) -> Response {
    let (org, request_id) =
        match authenticate(&state, &headers, "POST /workflows/{id}/runs/{rid}/cancel").await {
            Ok(auth) => auth,
            Err(response) => return response,
        };
    let request = body.map(|Json(b)| b).unwrap_or_default();

    let run = match state.storage.get_workflow_run(&org.organization_id, &run_id).await {
        Ok(Some(run)) => run,
        Ok(None) => return not_found(&request_id, "WORKFLOW_RUN_NOT_FOUND", "no such run"),
        Err(e) => return error_response(&request_id, &e),
    };
    if let Some(entry) = state.cancels.get(&run_id) {
        entry.value().fire();
    }
    Json(Envelope::ok(
        &request_id,
        json!({ "workflow_run_id": run.workflow_run_id, "reason": request.reason }),
    ))
    .into_response()
}
