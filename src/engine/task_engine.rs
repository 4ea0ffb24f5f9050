//! The per-task step loop.
//!
//! One task executes as a strictly ordered sequence of steps; each step is a
//! scrape, a decision and the actions it yielded. The engine owns step
//! persistence, artifact capture, transient recovery, retry accounting,
//! decision-cache interaction and the task's terminal state.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::action::{ActionConfig, ActionExecutor};
use crate::engine::cache::{CacheKey, DecisionCache};
use crate::engine::webhook::WebhookNotifier;
use crate::error::{ExecutionError, Result};
use crate::oracle::{DecisionOracle, StepHistoryEntry};
use crate::runtime::{Cancel, Clock, Deadline, SystemClock};
use crate::scrape::{PageScraper, ScrapeOptions, ScrapedPage};
use crate::session::{BrowserSessionManager, RepairOutcome, SessionLease};
use crate::storage::{BlobStore, Storage};
use crate::types::{
    Action, ActionResult, Artifact, ArtifactKind, SessionScope, Step, StepStatus, Task, TaskStatus,
};

#[derive(Debug, Clone)]
pub struct TaskEngineConfig {
    /// Wall-clock budget for a task when the record does not carry one.
    pub default_max_duration: Duration,
    pub scrape: ScrapeOptions,
    pub action: ActionConfig,
    pub cache_enabled: bool,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub navigation_timeout: Duration,
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self {
            default_max_duration: Duration::from_secs(3600),
            scrape: ScrapeOptions::default(),
            action: ActionConfig::default(),
            cache_enabled: true,
            cache_capacity: 1024,
            cache_ttl: Duration::from_secs(24 * 3600),
            navigation_timeout: Duration::from_secs(30),
        }
    }
}

enum StepOutcome {
    Continue,
    TaskComplete(Option<Value>),
    TaskTerminated(String),
}

struct StepExecution {
    outcome: StepOutcome,
    executed: Vec<(Action, ActionResult)>,
}

pub struct TaskEngine {
    storage: Arc<dyn Storage>,
    blob: Arc<dyn BlobStore>,
    sessions: Arc<BrowserSessionManager>,
    oracle: Arc<dyn DecisionOracle>,
    executor: ActionExecutor,
    cache: DecisionCache,
    webhooks: WebhookNotifier,
    clock: Arc<dyn Clock>,
    config: TaskEngineConfig,
}

impl TaskEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        blob: Arc<dyn BlobStore>,
        sessions: Arc<BrowserSessionManager>,
        oracle: Arc<dyn DecisionOracle>,
        config: TaskEngineConfig,
    ) -> Self {
        let executor = ActionExecutor::new(config.action.clone()).with_blob_store(blob.clone());
        let cache = DecisionCache::new(config.cache_capacity, config.cache_ttl);
        Self {
            storage,
            blob,
            sessions,
            oracle,
            executor,
            cache,
            webhooks: WebhookNotifier::default(),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sessions(&self) -> &Arc<BrowserSessionManager> {
        &self.sessions
    }

    pub fn oracle(&self) -> &Arc<dyn DecisionOracle> {
        &self.oracle
    }

    /// Execute a standalone task end-to-end: acquire a session, run the
    /// step loop, release the session, deliver the terminal webhook.
    pub async fn execute_task(
        &self,
        organization_id: &str,
        task_id: &str,
        cancel: Cancel,
    ) -> Result<Task> {
        let mut task = self
            .storage
            .get_task(organization_id, task_id)
            .await?
            .ok_or_else(|| ExecutionError::Validation(format!("unknown task {}", task_id)))?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        task.status = TaskStatus::Queued;
        self.storage.update_task(&task).await?;

        let (scope, run_ref) = match &task.workflow_run_id {
            Some(run_id) => (SessionScope::WorkflowRun, run_id.clone()),
            None => (SessionScope::Task, task.task_id.clone()),
        };
        let lease = match self
            .sessions
            .acquire(scope, &task.organization_id, Some(&run_ref), &task.task_id)
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                self.finish_task(&mut task, TaskStatus::Failed, Some(&e), None).await?;
                self.send_task_webhook(&task).await;
                return Ok(task);
            }
        };

        let session_id = lease.session_id().to_string();
        let result = self.run_with_lease(&mut task, &lease, &cancel).await;
        drop(lease);
        if scope == SessionScope::Task {
            let _ = self.sessions.release(&session_id, true).await;
        }
        result?;
        self.send_task_webhook(&task).await;
        Ok(task)
    }

    /// The step loop, driven on an already-acquired session. Used directly
    /// by workflow task blocks so every block shares the run's session.
    pub async fn run_with_lease(
        &self,
        task: &mut Task,
        lease: &SessionLease,
        cancel: &Cancel,
    ) -> Result<()> {
        task.status = TaskStatus::Running;
        self.storage.update_task(task).await?;

        let budget = task
            .max_duration_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_max_duration);
        let deadline = Deadline::after(self.clock.as_ref(), budget);

        if task.max_steps == 0 {
            self.finish_task(task, TaskStatus::Failed, Some(&ExecutionError::MaxStepsReached), None)
                .await?;
            return Ok(());
        }

        if !task.url.is_empty() {
            let page = lease.page().await?;
            let current = page.url().await.unwrap_or_default();
            if current != task.url {
                if let Err(e) = page.goto(&task.url, self.config.navigation_timeout).await {
                    warn!(task_id = %task.task_id, "initial navigation failed: {}", e);
                }
            }
        }

        let mut history: Vec<StepHistoryEntry> = Vec::new();
        let mut cache_candidates: Vec<(u32, Vec<Action>)> = Vec::new();
        let mut order = 0u32;

        while task.status == TaskStatus::Running && order < task.max_steps {
            if cancel.fired() {
                self.finish_task(task, TaskStatus::Canceled, Some(&ExecutionError::Canceled), None)
                    .await?;
                return Ok(());
            }
            if deadline.expired(self.clock.as_ref()) {
                self.finish_task(task, TaskStatus::Failed, Some(&ExecutionError::Timeout), None)
                    .await?;
                return Ok(());
            }

            order += 1;
            let mut step = Step::new(&task.task_id, order);
            self.storage.create_step(&step).await?;

            loop {
                step.status = StepStatus::Running;
                self.storage.update_step(&step).await?;

                match self.run_step(task, &step, lease, cancel, &deadline, &history).await {
                    Ok(execution) => {
                        let actions: Vec<Action> =
                            execution.executed.iter().map(|(a, _)| a.clone()).collect();
                        let entry = StepHistoryEntry {
                            order: step.order,
                            retry_index: step.retry_index,
                            status: StepStatus::Completed,
                            actions: actions.clone(),
                            results: execution.executed.iter().map(|(_, r)| r.clone()).collect(),
                            failure_reason: None,
                        };
                        step.output = Some(json!({
                            "actions": actions,
                            "results": entry.results,
                        }));

                        match execution.outcome {
                            StepOutcome::TaskComplete(extracted) => {
                                step.status = StepStatus::Completed;
                                step.goal_achieved = Some(true);
                                task.extracted_data = extracted.clone();
                                task.status = TaskStatus::Completed;
                                task.completed_at = Some(self.clock.utc_now());
                                self.storage.flip_task_and_step(task, &step).await?;
                                cache_candidates.push((step.order, actions));
                                self.write_cache(task, &cache_candidates);
                                info!(task_id = %task.task_id, steps = order, "task completed");
                                return Ok(());
                            }
                            StepOutcome::TaskTerminated(reason) => {
                                step.status = StepStatus::Completed;
                                step.goal_achieved = Some(false);
                                let error = ExecutionError::Validation(reason);
                                task.status = TaskStatus::Terminated;
                                task.failure_reason = Some(error.failure_reason());
                                task.completed_at = Some(self.clock.utc_now());
                                self.storage.flip_task_and_step(task, &step).await?;
                                info!(task_id = %task.task_id, "task terminated by oracle");
                                return Ok(());
                            }
                            StepOutcome::Continue => {
                                step.status = StepStatus::Completed;
                                self.storage.update_step(&step).await?;
                                cache_candidates.push((step.order, actions));
                                history.push(entry);
                                break;
                            }
                        }
                    }
                    Err(e) if matches!(e, ExecutionError::SessionReplaced) => {
                        // Restart the step on the fresh browser without
                        // consuming a retry.
                        warn!(task_id = %task.task_id, order, "session replaced, restarting step");
                        self.renavigate(task, lease).await;
                        continue;
                    }
                    Err(e) if matches!(e, ExecutionError::Canceled) => {
                        step.status = StepStatus::Failed;
                        step.failure_reason = Some(e.failure_reason());
                        task.status = TaskStatus::Canceled;
                        task.failure_reason = Some(e.failure_reason());
                        task.completed_at = Some(self.clock.utc_now());
                        self.storage.flip_task_and_step(task, &step).await?;
                        return Ok(());
                    }
                    Err(e) if e.short_circuits() => {
                        step.status = StepStatus::Failed;
                        step.failure_reason = Some(e.failure_reason());
                        task.status = TaskStatus::Failed;
                        task.failure_reason = Some(e.failure_reason());
                        task.completed_at = Some(self.clock.utc_now());
                        self.storage.flip_task_and_step(task, &step).await?;
                        return Ok(());
                    }
                    Err(e) if e.is_transient() && step.retry_index < task.retries_per_step => {
                        debug!(task_id = %task.task_id, order, retry = step.retry_index, "step retry: {}", e);
                        step.status = StepStatus::Retrying;
                        step.failure_reason = Some(e.failure_reason());
                        self.storage.update_step(&step).await?;
                        history.push(StepHistoryEntry {
                            order: step.order,
                            retry_index: step.retry_index,
                            status: StepStatus::Retrying,
                            actions: Vec::new(),
                            results: Vec::new(),
                            failure_reason: Some(e.to_string()),
                        });
                        step = step.with_retry_increment();
                        self.storage.create_step(&step).await?;
                        continue;
                    }
                    Err(e) => {
                        step.status = StepStatus::Failed;
                        step.failure_reason = Some(e.failure_reason());
                        task.status = TaskStatus::Failed;
                        task.failure_reason = Some(e.failure_reason());
                        task.completed_at = Some(self.clock.utc_now());
                        self.storage.flip_task_and_step(task, &step).await?;
                        info!(task_id = %task.task_id, error = %e, "task failed");
                        return Ok(());
                    }
                }
            }
        }

        if task.status == TaskStatus::Running {
            if cancel.fired() {
                self.finish_task(task, TaskStatus::Canceled, Some(&ExecutionError::Canceled), None)
                    .await?;
            } else {
                self.finish_task(
                    task,
                    TaskStatus::Failed,
                    Some(&ExecutionError::MaxStepsReached),
                    None,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn run_step(
        &self,
        task: &Task,
        step: &Step,
        lease: &SessionLease,
        cancel: &Cancel,
        deadline: &Deadline,
        history: &[StepHistoryEntry],
    ) -> Result<StepExecution> {
        cancel.check()?;
        let mut page = lease.page().await?;
        let mut scrape = match PageScraper::scrape(&page, &self.config.scrape).await {
            Ok(scrape) => scrape,
            Err(ExecutionError::PageUnresponsive(reason)) => {
                warn!(task_id = %task.task_id, "page unresponsive during scrape: {}", reason);
                match self.sessions.repair(lease.session_id()).await? {
                    RepairOutcome::PageReplaced => {
                        self.renavigate(task, lease).await;
                        page = lease.page().await?;
                        PageScraper::scrape(&page, &self.config.scrape).await?
                    }
                    RepairOutcome::SessionReplaced => return Err(ExecutionError::SessionReplaced),
                }
            }
            Err(e) => return Err(e),
        };

        let mut sequence = 0u64;
        self.store_scrape_artifacts(task, step, &scrape, &mut sequence).await;

        // Decision: cache replay when every hash still matches, oracle
        // otherwise.
        let cache_key = CacheKey {
            url_pattern: task.url_pattern(),
            navigation_goal: task.navigation_goal.clone(),
            step_order: step.order,
        };
        let cached = if self.config.cache_enabled {
            self.cache.lookup(&cache_key, &scrape)
        } else {
            None
        };
        let mut actions = match cached {
            Some(actions) => {
                debug!(task_id = %task.task_id, order = step.order, "decision cache hit");
                actions
            }
            None => {
                let decision = self.oracle.decide(task, step, &scrape, history).await?;
                decision.actions
            }
        };
        if actions.is_empty() {
            actions = vec![Action::null(Some("oracle produced no actions".into()))];
        }

        // Stamp content hashes so executed actions stay cache-matchable.
        for action in &mut actions {
            if action.meta().element_content_hash.is_none() {
                if let Some(hash) = action
                    .element_ref()
                    .and_then(|element_ref| scrape.id_to_hash.get(element_ref))
                {
                    action.meta_mut().element_content_hash = Some(hash.clone());
                }
            }
        }

        let mut executed: Vec<(Action, ActionResult)> = Vec::new();
        for action in actions {
            cancel.check()?;
            if deadline.expired(self.clock.as_ref()) {
                return Err(ExecutionError::Timeout);
            }

            let mut applied = self.executor.apply(&page, &scrape, &action, cancel).await;
            if let Err(e) = &applied {
                if e.is_transient() && !matches!(e, ExecutionError::Oracle(_)) {
                    // Local recovery: scrape again and retry the action once.
                    debug!(task_id = %task.task_id, "action transient ({}), rescraping", e);
                    scrape = PageScraper::scrape(&page, &self.config.scrape).await?;
                    applied = self.executor.apply(&page, &scrape, &action, cancel).await;
                }
            }

            match applied {
                Ok(result) => {
                    if action.kind() != crate::types::ActionKind::NullAction {
                        self.store_action_screenshot(task, step, &page, &mut sequence).await;
                    }
                    let terminal = action.is_terminal();
                    let completes = matches!(action, Action::Complete { .. });
                    let reason = match &action {
                        Action::Terminate { reason, .. } => reason.clone(),
                        _ => String::new(),
                    };
                    let data = result.data.clone();
                    executed.push((action, result));
                    if terminal {
                        let outcome = if completes {
                            if let Some(data) = &data {
                                self.store_extracted_data(task, step, data, &mut sequence).await;
                            }
                            StepOutcome::TaskComplete(data)
                        } else {
                            StepOutcome::TaskTerminated(reason)
                        };
                        return Ok(StepExecution { outcome, executed });
                    }
                    // Let the page settle before the next action or scrape.
                    let _ = page.settle(self.config.action.post_action_settle).await;
                }
                Err(e) => {
                    let stop = action.meta().stop_execution_on_failure;
                    let result = ActionResult::failed(&e, stop);
                    self.store_action_screenshot(task, step, &page, &mut sequence).await;
                    executed.push((action, result));
                    if stop {
                        return Err(e);
                    }
                    warn!(task_id = %task.task_id, "action failed, continuing: {}", e);
                }
            }
        }

        Ok(StepExecution {
            outcome: StepOutcome::Continue,
            executed,
        })
    }

    async fn renavigate(&self, task: &Task, lease: &SessionLease) {
        if task.url.is_empty() {
            return;
        }
        if let Ok(page) = lease.page().await {
            if let Err(e) = page.goto(&task.url, self.config.navigation_timeout).await {
                warn!(task_id = %task.task_id, "re-navigation failed: {}", e);
            }
        }
    }

    fn write_cache(&self, task: &Task, candidates: &[(u32, Vec<Action>)]) {
        if !self.config.cache_enabled {
            return;
        }
        for (order, actions) in candidates {
            self.cache.record(
                CacheKey {
                    url_pattern: task.url_pattern(),
                    navigation_goal: task.navigation_goal.clone(),
                    step_order: *order,
                },
                actions,
            );
        }
    }

    async fn finish_task(
        &self,
        task: &mut Task,
        status: TaskStatus,
        error: Option<&ExecutionError>,
        extracted: Option<Value>,
    ) -> Result<()> {
        task.status = status;
        task.failure_reason = error.map(ExecutionError::failure_reason);
        if extracted.is_some() {
            task.extracted_data = extracted;
        }
        task.completed_at = Some(self.clock.utc_now());
        self.storage.update_task(task).await
    }

    async fn send_task_webhook(&self, task: &Task) {
        let url = match &task.webhook_url {
            Some(url) => url.clone(),
            None => return,
        };
        let event = match task.status {
            TaskStatus::Completed => "task.completed",
            TaskStatus::Canceled => "task.canceled",
            TaskStatus::Failed | TaskStatus::Terminated => "task.failed",
            _ => return,
        };
        let data = serde_json::to_value(task).unwrap_or(Value::Null);
        if let Err(e) = self
            .webhooks
            .deliver(&url, event, data, task.request_id.clone())
            .await
        {
            warn!(task_id = %task.task_id, "webhook delivery failed: {}", e);
        }
    }

    async fn store_scrape_artifacts(
        &self,
        task: &Task,
        step: &Step,
        scrape: &ScrapedPage,
        sequence: &mut u64,
    ) {
        if let Some(shot) = scrape.screenshots.first() {
            self.store_artifact(task, step, ArtifactKind::ScreenshotLlm, shot, "image/png", sequence)
                .await;
        }
        if !scrape.html.is_empty() {
            self.store_artifact(
                task,
                step,
                ArtifactKind::HtmlScrape,
                scrape.html.as_bytes(),
                "text/html",
                sequence,
            )
            .await;
        }
        if let Ok(tree) = serde_json::to_vec(&scrape.element_tree) {
            self.store_artifact(
                task,
                step,
                ArtifactKind::ElementTree,
                &tree,
                "application/json",
                sequence,
            )
            .await;
        }
        if let Ok(map) = serde_json::to_vec(&scrape.id_to_css) {
            self.store_artifact(
                task,
                step,
                ArtifactKind::IdToCssMap,
                &map,
                "application/json",
                sequence,
            )
            .await;
        }
    }

    async fn store_action_screenshot(
        &self,
        task: &Task,
        step: &Step,
        page: &Arc<dyn crate::driver::PageHandle>,
        sequence: &mut u64,
    ) {
        match page.screenshot(false).await {
            Ok(bytes) => {
                self.store_artifact(
                    task,
                    step,
                    ArtifactKind::ScreenshotAction,
                    &bytes,
                    "image/png",
                    sequence,
                )
                .await
            }
            Err(e) => warn!(task_id = %task.task_id, "post-action screenshot failed: {}", e),
        }
    }

    async fn store_extracted_data(
        &self,
        task: &Task,
        step: &Step,
        data: &Value,
        sequence: &mut u64,
    ) {
        if let Ok(bytes) = serde_json::to_vec(data) {
            self.store_artifact(
                task,
                step,
                ArtifactKind::ExtractedData,
                &bytes,
                "application/json",
                sequence,
            )
            .await;
        }
    }

    /// Artifact persistence is best-effort: a lost screenshot never fails
    /// the step.
    async fn store_artifact(
        &self,
        task: &Task,
        step: &Step,
        kind: ArtifactKind,
        bytes: &[u8],
        content_type: &str,
        sequence: &mut u64,
    ) {
        let uri = match self.blob.put(bytes, content_type).await {
            Ok(uri) => uri,
            Err(e) => {
                warn!(task_id = %task.task_id, "artifact blob write failed: {}", e);
                return;
            }
        };
        let mut artifact = Artifact::new(&task.organization_id, kind, &uri, *sequence)
            .for_step(&task.task_id, &step.step_id)
            .with_content(content_type, bytes.len() as u64);
        artifact.request_id = task.request_id.clone();
        if let Some(run_id) = &task.workflow_run_id {
            artifact.workflow_run_id = Some(run_id.clone());
        }
        *sequence += 1;
        if let Err(e) = self.storage.insert_artifact(&artifact).await {
            warn!(task_id = %task.task_id, "artifact record failed: {}", e);
        }
    }
}
