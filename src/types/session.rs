//! Browser session records: the storage-owned view of a live session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ids;

/// What a session is bound to and how long it lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionScope {
    /// Dies with its task.
    Task,
    /// Shared by all tasks of one workflow run.
    WorkflowRun,
    /// Outlives any single task; released explicitly or by TTL.
    Persistent,
}

/// Session lifecycle.
///
/// ```text
/// creating -> active -> in_use -> active -> idle -> released
///                    \-> paused -/
/// any -> errored -> released
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Creating,
    Active,
    InUse,
    Idle,
    Paused,
    Released,
    Errored,
}

impl SessionState {
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Active | Self::InUse | Self::Idle | Self::Paused
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Persisted identity of a browser session. Holds enough to relaunch an
/// equivalent browser and restore cookies/local storage; the live driver
/// handle is never persisted. Guarded by optimistic concurrency on
/// `modified_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSessionRecord {
    pub browser_session_id: String,
    pub organization_id: String,
    pub scope: SessionScope,
    pub state: SessionState,
    /// Task or workflow-run id the session is bound to, per scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_location: Option<String>,
    /// Cookie snapshot for identity-preserving reconstruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_storage: Option<Value>,
    /// Idle TTL in seconds for persistent sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl BrowserSessionRecord {
    pub fn new(organization_id: &str, scope: SessionScope, run_ref: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            browser_session_id: ids::browser_session_id(),
            organization_id: organization_id.to_string(),
            scope,
            state: SessionState::Creating,
            run_ref,
            proxy_location: None,
            cookies: None,
            local_storage: None,
            ttl_secs: None,
            last_activity: now,
            created_at: now,
            modified_at: now,
        }
    }
}

/// Tenant boundary; the cascade root for every other entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub organization_id: String,
    pub name: String,
    /// Rate-limit tier: free, pro or enterprise.
    pub tier: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(name: &str, tier: &str) -> Self {
        let now = Utc::now();
        Self {
            organization_id: ids::organization_id(),
            name: name.to_string(),
            tier: tier.to_string(),
            created_at: now,
            modified_at: now,
        }
    }
}
