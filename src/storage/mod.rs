//! Storage, blob store, secrets and email capabilities.
//!
//! The core depends on these abstract interfaces; the in-memory
//! implementations back the test suite and the dev server. A production
//! deployment supplies database- and object-store-backed implementations.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::types::{
    Artifact, BrowserSessionRecord, Organization, Step, Task, TaskStatus, Workflow, WorkflowRun,
    WorkflowRunBlock,
};

pub use memory::{InMemoryBlobStore, InMemoryStorage, RecordingEmail, StaticSecrets};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    CreatedAt,
    ModifiedAt,
    CompletedAt,
    Status,
    Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Filters for task listing, matching the REST surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQuery {
    #[serde(default)]
    pub statuses: Vec<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
    /// Substring match on the navigation goal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    pub sort_by: SortField,
    pub order: SortOrder,
    pub page: usize,
    pub page_size: usize,
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            statuses: Vec::new(),
            created_after: None,
            created_before: None,
            search: None,
            sort_by: SortField::CreatedAt,
            order: SortOrder::Desc,
            page: 1,
            page_size: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageOf<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// Entity CRUD, transactional status flips, indexed list queries and
/// append-only artifact insertion.
#[async_trait]
pub trait Storage: Send + Sync {
    // Organizations and API keys ------------------------------------------
    async fn create_organization(&self, org: &Organization) -> Result<()>;
    async fn get_organization(&self, organization_id: &str) -> Result<Option<Organization>>;
    async fn register_api_key(&self, api_key: &str, organization_id: &str) -> Result<()>;
    async fn resolve_api_key(&self, api_key: &str) -> Result<Option<Organization>>;

    // Tasks ----------------------------------------------------------------
    async fn create_task(&self, task: &Task) -> Result<()>;
    async fn update_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, organization_id: &str, task_id: &str) -> Result<Option<Task>>;
    async fn list_tasks(&self, organization_id: &str, query: &TaskQuery) -> Result<PageOf<Task>>;

    // Steps ------------------------------------------------------------------
    async fn create_step(&self, step: &Step) -> Result<()>;
    async fn update_step(&self, step: &Step) -> Result<()>;
    /// Steps of a task ordered by `(order, retry_index)`.
    async fn list_steps(&self, task_id: &str) -> Result<Vec<Step>>;
    /// Transactional flip of a task and its current step in one batch.
    async fn flip_task_and_step(&self, task: &Task, step: &Step) -> Result<()>;

    // Artifacts --------------------------------------------------------------
    /// Append-only; returns the stable uri. Records are immutable once
    /// inserted.
    async fn insert_artifact(&self, artifact: &Artifact) -> Result<String>;
    async fn list_artifacts_for_task(&self, task_id: &str) -> Result<Vec<Artifact>>;
    async fn list_artifacts_for_step(&self, step_id: &str) -> Result<Vec<Artifact>>;
    async fn list_artifacts_for_run(&self, workflow_run_id: &str) -> Result<Vec<Artifact>>;

    // Workflows ----------------------------------------------------------------
    async fn create_workflow(&self, workflow: &Workflow) -> Result<()>;
    /// Lookup by workflow id or permanent id; permanent ids resolve to the
    /// highest version.
    async fn get_workflow(&self, organization_id: &str, id: &str) -> Result<Option<Workflow>>;
    async fn create_workflow_run(&self, run: &WorkflowRun) -> Result<()>;
    async fn update_workflow_run(&self, run: &WorkflowRun) -> Result<()>;
    async fn get_workflow_run(
        &self,
        organization_id: &str,
        workflow_run_id: &str,
    ) -> Result<Option<WorkflowRun>>;
    async fn create_workflow_run_block(&self, block: &WorkflowRunBlock) -> Result<()>;
    async fn update_workflow_run_block(&self, block: &WorkflowRunBlock) -> Result<()>;
    async fn list_workflow_run_blocks(&self, workflow_run_id: &str)
        -> Result<Vec<WorkflowRunBlock>>;

    // Browser sessions ----------------------------------------------------------
    /// Optimistic write: when `expected_modified_at` is given and the stored
    /// record is newer, the write is rejected with `Storage`.
    async fn upsert_browser_session(
        &self,
        record: &BrowserSessionRecord,
        expected_modified_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn get_browser_session(
        &self,
        organization_id: &str,
        browser_session_id: &str,
    ) -> Result<Option<BrowserSessionRecord>>;
    async fn list_persistent_sessions(
        &self,
        organization_id: &str,
    ) -> Result<Vec<BrowserSessionRecord>>;
}

/// Blob storage for screenshots, HAR, traces and downloads.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: &[u8], content_type: &str) -> Result<String>;
    async fn get(&self, uri: &str) -> Result<Vec<u8>>;
    async fn sign(&self, uri: &str, ttl: Duration) -> Result<String>;
    async fn delete(&self, uri: &str) -> Result<()>;
}

/// Opaque secret resolution. Values are registered with the log redactor by
/// the run context; the core never logs them.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Option<String>>;
}

/// Outbound email capability for `send_email` blocks.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Returns the provider message id.
    async fn send(&self, to: &[String], subject: &str, body: &str) -> Result<String>;
}
