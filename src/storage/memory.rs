//! In-memory capability implementations for tests and the dev server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

use super::{
    BlobStore, EmailProvider, PageOf, SecretsProvider, SortField, SortOrder, Storage, TaskQuery,
};
use crate::error::{ExecutionError, Result};
use crate::types::{
    ids, Artifact, BrowserSessionRecord, Organization, SessionScope, Step, Task, Workflow,
    WorkflowRun, WorkflowRunBlock,
};

#[derive(Default)]
struct Tables {
    organizations: HashMap<String, Organization>,
    api_keys: HashMap<String, String>,
    tasks: HashMap<String, Task>,
    steps: HashMap<String, Vec<Step>>,
    artifacts: Vec<Artifact>,
    workflows: HashMap<String, Workflow>,
    workflow_runs: HashMap<String, WorkflowRun>,
    workflow_run_blocks: HashMap<String, Vec<WorkflowRunBlock>>,
    browser_sessions: HashMap<String, BrowserSessionRecord>,
}

/// Map-backed storage. Every method clones on the way in and out so callers
/// never observe aliased records.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_organization(&self, org: &Organization) -> Result<()> {
        self.tables
            .write()
            .organizations
            .insert(org.organization_id.clone(), org.clone());
        Ok(())
    }

    async fn get_organization(&self, organization_id: &str) -> Result<Option<Organization>> {
        Ok(self.tables.read().organizations.get(organization_id).cloned())
    }

    async fn register_api_key(&self, api_key: &str, organization_id: &str) -> Result<()> {
        self.tables
            .write()
            .api_keys
            .insert(api_key.to_string(), organization_id.to_string());
        Ok(())
    }

    async fn resolve_api_key(&self, api_key: &str) -> Result<Option<Organization>> {
        let tables = self.tables.read();
        Ok(tables
            .api_keys
            .get(api_key)
            .and_then(|org_id| tables.organizations.get(org_id))
            .cloned())
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        self.tables
            .write()
            .tasks
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.tasks.contains_key(&task.task_id) {
            return Err(ExecutionError::Storage(format!(
                "task {} does not exist",
                task.task_id
            )));
        }
        let mut task = task.clone();
        task.modified_at = Utc::now();
        tables.tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, organization_id: &str, task_id: &str) -> Result<Option<Task>> {
        Ok(self
            .tables
            .read()
            .tasks
            .get(task_id)
            .filter(|t| t.organization_id == organization_id)
            .cloned())
    }

    async fn list_tasks(&self, organization_id: &str, query: &TaskQuery) -> Result<PageOf<Task>> {
        let tables = self.tables.read();
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| t.organization_id == organization_id)
            .filter(|t| query.statuses.is_empty() || query.statuses.contains(&t.status))
            .filter(|t| query.created_after.map_or(true, |after| t.created_at > after))
            .filter(|t| query.created_before.map_or(true, |before| t.created_at < before))
            .filter(|t| {
                query.search.as_ref().map_or(true, |s| {
                    t.navigation_goal.to_lowercase().contains(&s.to_lowercase())
                })
            })
            .cloned()
            .collect();

        tasks.sort_by(|a, b| {
            let ordering = match query.sort_by {
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::ModifiedAt => a.modified_at.cmp(&b.modified_at),
                SortField::CompletedAt => a.completed_at.cmp(&b.completed_at),
                SortField::Status => format!("{:?}", a.status).cmp(&format!("{:?}", b.status)),
                SortField::Url => a.url.cmp(&b.url),
            };
            match query.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = tasks.len();
        let page = query.page.max(1);
        let start = (page - 1) * query.page_size;
        let items = tasks
            .into_iter()
            .skip(start)
            .take(query.page_size)
            .collect();
        Ok(PageOf {
            items,
            total,
            page,
            page_size: query.page_size,
        })
    }

    async fn create_step(&self, step: &Step) -> Result<()> {
        self.tables
            .write()
            .steps
            .entry(step.task_id.clone())
            .or_default()
            .push(step.clone());
        Ok(())
    }

    async fn update_step(&self, step: &Step) -> Result<()> {
        let mut tables = self.tables.write();
        let steps = tables
            .steps
            .get_mut(&step.task_id)
            .ok_or_else(|| ExecutionError::Storage(format!("no steps for {}", step.task_id)))?;
        let slot = steps
            .iter_mut()
            .find(|s| s.step_id == step.step_id)
            .ok_or_else(|| ExecutionError::Storage(format!("step {} missing", step.step_id)))?;
        let mut step = step.clone();
        step.modified_at = Utc::now();
        *slot = step;
        Ok(())
    }

    async fn list_steps(&self, task_id: &str) -> Result<Vec<Step>> {
        let mut steps = self
            .tables
            .read()
            .steps
            .get(task_id)
            .cloned()
            .unwrap_or_default();
        steps.sort_by_key(|s| (s.order, s.retry_index));
        Ok(steps)
    }

    async fn flip_task_and_step(&self, task: &Task, step: &Step) -> Result<()> {
        // Single lock acquisition stands in for a storage transaction.
        let mut tables = self.tables.write();
        if !tables.tasks.contains_key(&task.task_id) {
            return Err(ExecutionError::Storage(format!(
                "task {} does not exist",
                task.task_id
            )));
        }
        let mut task = task.clone();
        task.modified_at = Utc::now();
        tables.tasks.insert(task.task_id.clone(), task);
        let steps = tables.steps.entry(step.task_id.clone()).or_default();
        match steps.iter_mut().find(|s| s.step_id == step.step_id) {
            Some(slot) => *slot = step.clone(),
            None => steps.push(step.clone()),
        }
        Ok(())
    }

    async fn insert_artifact(&self, artifact: &Artifact) -> Result<String> {
        let mut artifact = artifact.clone();
        if artifact.uri.is_empty() {
            artifact.uri = format!("mem://artifacts/{}", artifact.artifact_id);
        }
        let uri = artifact.uri.clone();
        self.tables.write().artifacts.push(artifact);
        Ok(uri)
    }

    async fn list_artifacts_for_task(&self, task_id: &str) -> Result<Vec<Artifact>> {
        Ok(self
            .tables
            .read()
            .artifacts
            .iter()
            .filter(|a| a.task_id.as_deref() == Some(task_id))
            .cloned()
            .collect())
    }

    async fn list_artifacts_for_step(&self, step_id: &str) -> Result<Vec<Artifact>> {
        let mut artifacts: Vec<Artifact> = self
            .tables
            .read()
            .artifacts
            .iter()
            .filter(|a| a.step_id.as_deref() == Some(step_id))
            .cloned()
            .collect();
        artifacts.sort_by_key(|a| a.sequence);
        Ok(artifacts)
    }

    async fn list_artifacts_for_run(&self, workflow_run_id: &str) -> Result<Vec<Artifact>> {
        Ok(self
            .tables
            .read()
            .artifacts
            .iter()
            .filter(|a| a.workflow_run_id.as_deref() == Some(workflow_run_id))
            .cloned()
            .collect())
    }

    async fn create_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.tables
            .write()
            .workflows
            .insert(workflow.workflow_id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, organization_id: &str, id: &str) -> Result<Option<Workflow>> {
        let tables = self.tables.read();
        if let Some(workflow) = tables
            .workflows
            .get(id)
            .filter(|w| w.organization_id == organization_id)
        {
            return Ok(Some(workflow.clone()));
        }
        Ok(tables
            .workflows
            .values()
            .filter(|w| w.organization_id == organization_id && w.workflow_permanent_id == id)
            .max_by_key(|w| w.version)
            .cloned())
    }

    async fn create_workflow_run(&self, run: &WorkflowRun) -> Result<()> {
        self.tables
            .write()
            .workflow_runs
            .insert(run.workflow_run_id.clone(), run.clone());
        Ok(())
    }

    async fn update_workflow_run(&self, run: &WorkflowRun) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.workflow_runs.contains_key(&run.workflow_run_id) {
            return Err(ExecutionError::Storage(format!(
                "workflow run {} does not exist",
                run.workflow_run_id
            )));
        }
        let mut run = run.clone();
        run.modified_at = Utc::now();
        tables.workflow_runs.insert(run.workflow_run_id.clone(), run);
        Ok(())
    }

    async fn get_workflow_run(
        &self,
        organization_id: &str,
        workflow_run_id: &str,
    ) -> Result<Option<WorkflowRun>> {
        Ok(self
            .tables
            .read()
            .workflow_runs
            .get(workflow_run_id)
            .filter(|r| r.organization_id == organization_id)
            .cloned())
    }

    async fn create_workflow_run_block(&self, block: &WorkflowRunBlock) -> Result<()> {
        self.tables
            .write()
            .workflow_run_blocks
            .entry(block.workflow_run_id.clone())
            .or_default()
            .push(block.clone());
        Ok(())
    }

    async fn update_workflow_run_block(&self, block: &WorkflowRunBlock) -> Result<()> {
        let mut tables = self.tables.write();
        let blocks = tables
            .workflow_run_blocks
            .get_mut(&block.workflow_run_id)
            .ok_or_else(|| {
                ExecutionError::Storage(format!("no blocks for {}", block.workflow_run_id))
            })?;
        let slot = blocks
            .iter_mut()
            .find(|b| b.workflow_run_block_id == block.workflow_run_block_id)
            .ok_or_else(|| {
                ExecutionError::Storage(format!(
                    "block {} missing",
                    block.workflow_run_block_id
                ))
            })?;
        let mut block = block.clone();
        block.modified_at = Utc::now();
        *slot = block;
        Ok(())
    }

    async fn list_workflow_run_blocks(
        &self,
        workflow_run_id: &str,
    ) -> Result<Vec<WorkflowRunBlock>> {
        Ok(self
            .tables
            .read()
            .workflow_run_blocks
            .get(workflow_run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_browser_session(
        &self,
        record: &BrowserSessionRecord,
        expected_modified_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        if let (Some(expected), Some(existing)) = (
            expected_modified_at,
            tables.browser_sessions.get(&record.browser_session_id),
        ) {
            if existing.modified_at > expected {
                return Err(ExecutionError::Storage(format!(
                    "stale write for session {}",
                    record.browser_session_id
                )));
            }
        }
        let mut record = record.clone();
        record.modified_at = Utc::now();
        tables
            .browser_sessions
            .insert(record.browser_session_id.clone(), record);
        Ok(())
    }

    async fn get_browser_session(
        &self,
        organization_id: &str,
        browser_session_id: &str,
    ) -> Result<Option<BrowserSessionRecord>> {
        Ok(self
            .tables
            .read()
            .browser_sessions
            .get(browser_session_id)
            .filter(|s| s.organization_id == organization_id)
            .cloned())
    }

    async fn list_persistent_sessions(
        &self,
        organization_id: &str,
    ) -> Result<Vec<BrowserSessionRecord>> {
        Ok(self
            .tables
            .read()
            .browser_sessions
            .values()
            .filter(|s| {
                s.organization_id == organization_id
                    && s.scope == SessionScope::Persistent
                    && s.state.is_live()
            })
            .cloned()
            .collect())
    }
}

/// Map-backed blob store with `blob://` uris.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, bytes: &[u8], content_type: &str) -> Result<String> {
        let uri = format!("blob://{}", ids::generate("blob"));
        self.blobs
            .write()
            .insert(uri.clone(), (bytes.to_vec(), content_type.to_string()));
        Ok(uri)
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .get(uri)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| ExecutionError::BlobStore(format!("no blob at {}", uri)))
    }

    async fn sign(&self, uri: &str, ttl: Duration) -> Result<String> {
        if !self.blobs.read().contains_key(uri) {
            return Err(ExecutionError::BlobStore(format!("no blob at {}", uri)));
        }
        Ok(format!("{}?expires_in={}", uri, ttl.as_secs()))
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        self.blobs.write().remove(uri);
        Ok(())
    }
}

/// Fixed-map secrets provider.
#[derive(Default)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl SecretsProvider for StaticSecrets {
    async fn resolve(&self, name: &str) -> Result<Option<String>> {
        Ok(self.values.get(name).cloned())
    }
}

/// Email provider that records messages instead of sending them.
#[derive(Default)]
pub struct RecordingEmail {
    sent: RwLock<Vec<(Vec<String>, String, String)>>,
}

impl RecordingEmail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Vec<String>, String, String)> {
        self.sent.read().clone()
    }
}

#[async_trait]
impl EmailProvider for RecordingEmail {
    async fn send(&self, to: &[String], subject: &str, body: &str) -> Result<String> {
        self.sent
            .write()
            .push((to.to_vec(), subject.to_string(), body.to_string()));
        Ok(format!("msg_{}", self.sent.read().len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;

    #[tokio::test]
    async fn task_round_trip_preserves_submission() {
        let storage = InMemoryStorage::new();
        let mut task = Task::new("org_1", "https://ex.test", "buy the widget");
        task.max_steps = 7;
        storage.create_task(&task).await.unwrap();
        let read = storage.get_task("org_1", &task.task_id).await.unwrap().unwrap();
        assert_eq!(read.navigation_goal, "buy the widget");
        assert_eq!(read.url, "https://ex.test");
        assert_eq!(read.max_steps, 7);
        assert!(storage.get_task("org_2", &task.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_tasks_filters_and_sorts() {
        let storage = InMemoryStorage::new();
        for (goal, status) in [
            ("alpha login", TaskStatus::Completed),
            ("beta checkout", TaskStatus::Failed),
            ("gamma login", TaskStatus::Completed),
        ] {
            let mut task = Task::new("org_1", "https://ex.test", goal);
            task.status = status;
            storage.create_task(&task).await.unwrap();
        }

        let query = TaskQuery {
            statuses: vec![TaskStatus::Completed],
            search: Some("login".into()),
            sort_by: SortField::Url,
            order: SortOrder::Asc,
            ..TaskQuery::default()
        };
        let page = storage.list_tasks("org_1", &query).await.unwrap();
        assert_eq!(page.total, 2);
        assert!(page.items.iter().all(|t| t.status == TaskStatus::Completed));
    }

    #[tokio::test]
    async fn artifacts_keep_sequence_order() {
        let storage = InMemoryStorage::new();
        for seq in [2u64, 0, 1] {
            let artifact = Artifact::new(
                "org_1",
                crate::types::ArtifactKind::ScreenshotAction,
                "",
                seq,
            )
            .for_step("task_1", "stp_1");
            storage.insert_artifact(&artifact).await.unwrap();
        }
        let artifacts = storage.list_artifacts_for_step("stp_1").await.unwrap();
        let sequences: Vec<u64> = artifacts.iter().map(|a| a.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(artifacts.iter().all(|a| a.uri.starts_with("mem://artifacts/")));
    }

    #[tokio::test]
    async fn optimistic_session_write_rejects_stale() {
        let storage = InMemoryStorage::new();
        let record = BrowserSessionRecord::new("org_1", SessionScope::Persistent, None);
        storage.upsert_browser_session(&record, None).await.unwrap();
        let stored = storage
            .get_browser_session("org_1", &record.browser_session_id)
            .await
            .unwrap()
            .unwrap();

        // A writer holding the current timestamp wins.
        storage
            .upsert_browser_session(&stored, Some(stored.modified_at))
            .await
            .unwrap();
        // A writer holding the old timestamp loses.
        let err = storage
            .upsert_browser_session(&record, Some(record.modified_at))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORAGE_ERROR");
    }

    #[tokio::test]
    async fn blob_store_round_trip_and_sign() {
        let blobs = InMemoryBlobStore::new();
        let uri = blobs.put(b"bytes", "application/octet-stream").await.unwrap();
        assert_eq!(blobs.get(&uri).await.unwrap(), b"bytes");
        let signed = blobs.sign(&uri, Duration::from_secs(60)).await.unwrap();
        assert!(signed.contains("expires_in=60"));
        blobs.delete(&uri).await.unwrap();
        assert!(blobs.get(&uri).await.is_err());
    }

    #[tokio::test]
    async fn workflow_permanent_id_resolves_highest_version() {
        let storage = InMemoryStorage::new();
        let definition = crate::types::WorkflowDefinition {
            blocks: vec![],
            parameters: vec![],
        };
        let mut v1 = Workflow::new("org_1", "wf", definition.clone());
        let permanent = v1.workflow_permanent_id.clone();
        v1.version = 1;
        let mut v2 = Workflow::new("org_1", "wf", definition);
        v2.workflow_permanent_id = permanent.clone();
        v2.version = 2;
        storage.create_workflow(&v1).await.unwrap();
        storage.create_workflow(&v2).await.unwrap();

        let resolved = storage.get_workflow("org_1", &permanent).await.unwrap().unwrap();
        assert_eq!(resolved.version, 2);
    }
}
