//! Persistent browser-session endpoints.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::envelope::{error_response, not_found, Envelope};
use super::{authenticate, AppState};
use crate::types::SessionState;

const DEFAULT_SESSION_TTL_SECS: u64 = 15 * 60;

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

pub async fn create_browser_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<CreateSessionRequest>>,
) -> Response {
    let (org, request_id) = match authenticate(&state, &headers, "POST /browser-sessions").await {
        Ok(auth) => auth,
        Err(response) => return response,
    };
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let ttl = Duration::from_secs(request.ttl_secs.unwrap_or(DEFAULT_SESSION_TTL_SECS));

    match state.sessions.create_persistent(&org.organization_id, ttl).await {
        Ok(session_id) => Json(Envelope::ok(
            &request_id,
            json!({ "browser_session_id": session_id, "ttl_secs": ttl.as_secs() }),
        ))
        .into_response(),
        Err(e) => error_response(&request_id, &e),
    }
}

pub async fn get_browser_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    let (org, request_id) = match authenticate(&state, &headers, "GET /browser-sessions/{id}").await
    {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let record = match state
        .storage
        .get_browser_session(&org.organization_id, &session_id)
        .await
    {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(&request_id, "SESSION_NOT_FOUND", "no such session"),
        Err(e) => return error_response(&request_id, &e),
    };
    let health = state.sessions.health_check(&session_id).await.ok();
    Json(Envelope::ok(
        &request_id,
        json!({ "session": record, "health": health }),
    ))
    .into_response()
}

pub async fn delete_browser_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    let (org, request_id) =
        match authenticate(&state, &headers, "DELETE /browser-sessions/{id}").await {
            Ok(auth) => auth,
            Err(response) => return response,
        };

    let record = match state
        .storage
        .get_browser_session(&org.organization_id, &session_id)
        .await
    {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(&request_id, "SESSION_NOT_FOUND", "no such session"),
        Err(e) => return error_response(&request_id, &e),
    };

    if let Err(e) = state.sessions.release(&session_id, true).await {
        return error_response(&request_id, &e);
    }
    let mut record = record;
    record.state = SessionState::Released;
    if let Err(e) = state.storage.upsert_browser_session(&record, None).await {
        return error_response(&request_id, &e);
    }
    Json(Envelope::ok(&request_id, json!({ "released": session_id }))).into_response()
}
