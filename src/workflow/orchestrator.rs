//! Workflow orchestration: interpret the block list of a run.
//!
//! Blocks execute strictly in definition order. The orchestrator owns the
//! run context, acquires one shared browser session at the first
//! browser-requiring block, applies per-block retry and continue-on-failure
//! policy, and emits the run webhook on terminal state.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::engine::WebhookNotifier;
use crate::error::{ExecutionError, Result};
use crate::runtime::{Cancel, Clock, Deadline, SystemClock};
use crate::session::{BrowserSessionManager, SessionLease};
use crate::storage::{SecretsProvider, Storage};
use crate::types::{
    BlockStatus, Parameter, SessionScope, Workflow, WorkflowRun, WorkflowRunBlock,
    WorkflowRunStatus,
};
use crate::workflow::context::RunContext;
use crate::workflow::runtime::BlockRuntime;
use crate::workflow::validate::validate_definition;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wall-clock budget for a run when the record does not carry one.
    pub default_max_duration: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_max_duration: Duration::from_secs(2 * 3600),
        }
    }
}

pub struct WorkflowOrchestrator {
    storage: Arc<dyn Storage>,
    sessions: Arc<BrowserSessionManager>,
    secrets: Arc<dyn SecretsProvider>,
    runtime: BlockRuntime,
    webhooks: WebhookNotifier,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl WorkflowOrchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        sessions: Arc<BrowserSessionManager>,
        secrets: Arc<dyn SecretsProvider>,
        runtime: BlockRuntime,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            storage,
            sessions,
            secrets,
            runtime,
            webhooks: WebhookNotifier::default(),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Execute one workflow run end-to-end.
    pub async fn execute_run(
        &self,
        organization_id: &str,
        workflow_run_id: &str,
        cancel: Cancel,
    ) -> Result<WorkflowRun> {
        let mut run = self
            .storage
            .get_workflow_run(organization_id, workflow_run_id)
            .await?
            .ok_or_else(|| {
                ExecutionError::Validation(format!("unknown workflow run {}", workflow_run_id))
            })?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        let workflow = self
            .storage
            .get_workflow(organization_id, &run.workflow_id)
            .await?
            .ok_or_else(|| {
                ExecutionError::Validation(format!("unknown workflow {}", run.workflow_id))
            })?;

        if let Err(e) = validate_definition(&workflow.definition) {
            self.finish_run(&mut run, WorkflowRunStatus::Failed, Some(&e)).await?;
            self.send_run_webhook(&run).await;
            return Ok(run);
        }

        let mut ctx = RunContext::new();
        if let Err(e) = self.seed_context(&workflow, &run, &mut ctx).await {
            self.finish_run(&mut run, WorkflowRunStatus::Failed, Some(&e)).await?;
            self.send_run_webhook(&run).await;
            return Ok(run);
        }

        run.status = WorkflowRunStatus::Running;
        run.started_at = Some(self.clock.utc_now());
        self.storage.update_workflow_run(&run).await?;

        let budget = run
            .max_duration_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_max_duration);
        let deadline = Deadline::after(self.clock.as_ref(), budget);

        let mut lease: Option<SessionLease> = None;
        let blocks = workflow.definition.blocks.clone();
        let mut failed: Option<ExecutionError> = None;
        let mut full_pass = true;

        for (index, block) in blocks.iter().enumerate() {
            if cancel.fired() {
                failed = Some(ExecutionError::Canceled);
                full_pass = false;
                break;
            }
            if deadline.expired(self.clock.as_ref()) {
                failed = Some(ExecutionError::Timeout);
                full_pass = false;
                break;
            }

            run.current_block_index = index;
            self.storage.update_workflow_run(&run).await?;

            // Lazy shared-session acquisition at the first block that needs
            // a browser; held until the run terminates.
            if block.params.requires_browser() && lease.is_none() {
                match self
                    .sessions
                    .acquire(
                        SessionScope::WorkflowRun,
                        &run.organization_id,
                        Some(&run.workflow_run_id),
                        &run.workflow_run_id,
                    )
                    .await
                {
                    Ok(acquired) => lease = Some(acquired),
                    Err(e) => {
                        failed = Some(e);
                        full_pass = false;
                        break;
                    }
                }
            }

            let mut record = WorkflowRunBlock::new(&run.workflow_run_id, block);
            record.status = BlockStatus::Running;
            record.started_at = Some(self.clock.utc_now());
            self.storage.create_workflow_run_block(&record).await?;

            let mut attempts = 0u32;
            let result = self
                .runtime
                .execute_with_retries(block, &mut ctx, &run, lease.as_ref(), &cancel, &mut attempts)
                .await;
            record.attempts = attempts;
            record.completed_at = Some(self.clock.utc_now());

            match result {
                Ok(output) => {
                    record.status = BlockStatus::Completed;
                    record.output = Some(output.clone());
                    self.storage.update_workflow_run_block(&record).await?;
                    ctx.set_output(&block.output_key(), output.clone());
                    run.outputs.insert(block.output_key(), output);
                    info!(run_id = %run.workflow_run_id, label = %block.label, "block completed");
                }
                Err(e) if matches!(e, ExecutionError::Canceled) => {
                    record.status = BlockStatus::Canceled;
                    record.failure_reason = Some(e.failure_reason());
                    self.storage.update_workflow_run_block(&record).await?;
                    failed = Some(e);
                    full_pass = false;
                    break;
                }
                Err(e) => {
                    record.status = BlockStatus::Failed;
                    record.failure_reason = Some(e.failure_reason());
                    self.storage.update_workflow_run_block(&record).await?;
                    if block.continue_on_failure {
                        warn!(
                            run_id = %run.workflow_run_id,
                            label = %block.label,
                            "block failed, continuing: {}", e
                        );
                        run.outputs
                            .insert(block.output_key(), json!({ "error": e.code() }));
                        ctx.set_output(&block.output_key(), json!({ "error": e.code() }));
                    } else {
                        failed = Some(e);
                        full_pass = false;
                        break;
                    }
                }
            }
        }

        if full_pass {
            run.current_block_index = blocks.len();
        }

        drop(lease);
        self.sessions
            .cleanup_for_workflow_run(&run.workflow_run_id)
            .await;

        match failed {
            Some(e) if matches!(e, ExecutionError::Canceled) => {
                self.finish_run(&mut run, WorkflowRunStatus::Canceled, Some(&e)).await?;
            }
            Some(e) => {
                self.finish_run(&mut run, WorkflowRunStatus::Failed, Some(&e)).await?;
            }
            None => {
                self.finish_run(&mut run, WorkflowRunStatus::Completed, None).await?;
            }
        }
        self.send_run_webhook(&run).await;
        Ok(run)
    }

    /// Populate the context: declared parameters with caller values or
    /// defaults, derived context parameters, resolved secrets.
    async fn seed_context(
        &self,
        workflow: &Workflow,
        run: &WorkflowRun,
        ctx: &mut RunContext,
    ) -> Result<()> {
        let declared: HashMap<&str, &Parameter> = workflow
            .definition
            .parameters
            .iter()
            .map(|p| (p.key(), p))
            .collect();

        for parameter in &workflow.definition.parameters {
            match parameter {
                Parameter::Workflow { key, default_value, required } => {
                    let value = run
                        .parameters
                        .get(key)
                        .cloned()
                        .or_else(|| default_value.clone());
                    match value {
                        Some(value) => ctx.set(key, value)?,
                        None if *required => {
                            return Err(ExecutionError::ParameterUnbound(key.clone()))
                        }
                        None => {}
                    }
                }
                Parameter::Context { key, source_key } => {
                    let value = run
                        .parameters
                        .get(source_key)
                        .cloned()
                        .or_else(|| ctx.get(source_key).cloned())
                        .ok_or_else(|| ExecutionError::ParameterUnbound(source_key.clone()))?;
                    ctx.set(key, value)?;
                }
                Parameter::Output { .. } => {
                    // Output slots materialize when their block completes.
                }
                Parameter::Secret { key, secret_name } => {
                    let value = self
                        .secrets
                        .resolve(secret_name)
                        .await?
                        .ok_or_else(|| ExecutionError::ParameterUnbound(key.clone()))?;
                    ctx.register_secret(key, &value);
                }
            }
        }

        // Caller-supplied values for undeclared names are still visible to
        // templates.
        for (key, value) in &run.parameters {
            if !declared.contains_key(key.as_str()) {
                let _ = ctx.set(key, value.clone());
            }
        }
        Ok(())
    }

    async fn finish_run(
        &self,
        run: &mut WorkflowRun,
        status: WorkflowRunStatus,
        error: Option<&ExecutionError>,
    ) -> Result<()> {
        run.status = status;
        run.failure_reason = error.map(ExecutionError::failure_reason);
        run.completed_at = Some(self.clock.utc_now());
        self.storage.update_workflow_run(run).await?;
        info!(run_id = %run.workflow_run_id, ?status, "workflow run finished");
        Ok(())
    }

    async fn send_run_webhook(&self, run: &WorkflowRun) {
        let url = match &run.webhook_url {
            Some(url) => url.clone(),
            None => return,
        };
        let event = match run.status {
            WorkflowRunStatus::Completed => "workflow_run.completed",
            WorkflowRunStatus::Failed | WorkflowRunStatus::Canceled => "workflow_run.failed",
            _ => return,
        };
        let data = serde_json::to_value(run).unwrap_or(Value::Null);
        if let Err(e) = self
            .webhooks
            .deliver(&url, event, data, run.request_id.clone())
            .await
        {
            warn!(run_id = %run.workflow_run_id, "run webhook failed: {}", e);
        }
    }
}
