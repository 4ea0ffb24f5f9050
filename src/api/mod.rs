//! REST surface: router, application state, authentication and quotas.

pub mod envelope;
pub mod rate_limit;
mod session_handlers;
mod task_handlers;
mod workflow_handlers;

use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::{TaskEngine, WebhookNotifier};
use crate::error::ExecutionError;
use crate::runtime::Cancel;
use crate::session::BrowserSessionManager;
use crate::storage::Storage;
use crate::types::Organization;
use crate::workflow::WorkflowOrchestrator;

use envelope::{error_response, request_id_from};
pub use rate_limit::RateLimiter;

/// Bounds concurrent run execution: global and per-tenant.
pub struct RunGate {
    global: Arc<Semaphore>,
    per_tenant: usize,
    tenants: DashMap<String, Arc<Semaphore>>,
}

impl RunGate {
    pub fn new(global_concurrent_runs: usize, tenant_concurrent_runs: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_concurrent_runs)),
            per_tenant: tenant_concurrent_runs,
            tenants: DashMap::new(),
        }
    }

    /// Queue until both a global and a tenant slot are free.
    pub async fn acquire(&self, tenant: &str) -> (OwnedSemaphorePermit, OwnedSemaphorePermit) {
        let tenant_sem = self
            .tenants
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_tenant)))
            .clone();
        let global = self
            .global
            .clone()
            .acquire_owned()
            .await
            .expect("run gate closed");
        let tenant = tenant_sem.acquire_owned().await.expect("run gate closed");
        (global, tenant)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub sessions: Arc<BrowserSessionManager>,
    pub engine: Arc<TaskEngine>,
    pub orchestrator: Arc<WorkflowOrchestrator>,
    pub webhooks: Arc<WebhookNotifier>,
    pub rate_limiter: Arc<RateLimiter>,
    pub run_gate: Arc<RunGate>,
    /// Cancel signals for in-flight tasks and runs, keyed by entity id.
    pub cancels: Arc<DashMap<String, Cancel>>,
}

impl AppState {
    pub fn new(
        storage: Arc<dyn Storage>,
        sessions: Arc<BrowserSessionManager>,
        engine: Arc<TaskEngine>,
        orchestrator: Arc<WorkflowOrchestrator>,
        global_concurrent_runs: usize,
        tenant_concurrent_runs: usize,
    ) -> Self {
        Self {
            storage,
            sessions,
            engine,
            orchestrator,
            webhooks: Arc::new(WebhookNotifier::default()),
            rate_limiter: Arc::new(RateLimiter::new()),
            run_gate: Arc::new(RunGate::new(global_concurrent_runs, tenant_concurrent_runs)),
            cancels: Arc::new(DashMap::new()),
        }
    }
}

/// Resolve the API key to an organization and charge the quota. The request
/// id is propagated from `x-request-id` or minted here.
pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    endpoint: &str,
) -> Result<(Organization, String), Response> {
    let request_id = request_id_from(headers);
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| error_response(&request_id, &ExecutionError::Unauthorized))?;
    let org = match state.storage.resolve_api_key(api_key).await {
        Ok(Some(org)) => org,
        Ok(None) => return Err(error_response(&request_id, &ExecutionError::Unauthorized)),
        Err(e) => return Err(error_response(&request_id, &e)),
    };
    state
        .rate_limiter
        .check(&org.organization_id, endpoint, &org.tier)
        .map_err(|e| error_response(&request_id, &e))?;
    Ok((org, request_id))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/tasks",
            post(task_handlers::create_task).get(task_handlers::list_tasks),
        )
        .route("/api/v1/tasks/:task_id", get(task_handlers::get_task))
        .route("/api/v1/tasks/:task_id/cancel", post(task_handlers::cancel_task))
        .route("/api/v1/tasks/:task_id/steps", get(task_handlers::get_task_steps))
        .route("/api/v1/workflows", post(workflow_handlers::create_workflow))
        .route(
            "/api/v1/workflows/:workflow_id/runs",
            post(workflow_handlers::start_workflow_run),
        )
        .route(
            "/api/v1/workflows/:workflow_id/runs/:run_id",
            get(workflow_handlers::get_workflow_run),
        )
        .route(
            "/api/v1/workflows/:workflow_id/runs/:run_id/cancel",
            post(workflow_handlers::cancel_workflow_run),
        )
        .route(
            "/api/v1/browser-sessions",
            post(session_handlers::create_browser_session),
        )
        .route(
            "/api/v1/browser-sessions/:session_id",
            get(session_handlers::get_browser_session)
                .delete(session_handlers::delete_browser_session),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
