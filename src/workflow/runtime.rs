//! Block runtime: execute one workflow block against the run context.
//!
//! Dispatch is a single match over the block-kind union. Each attempt
//! re-renders its parameters, so retried blocks observe outputs recorded
//! since the previous attempt.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::engine::TaskEngine;
use crate::error::{ExecutionError, Result};
use crate::oracle::DecisionOracle;
use crate::runtime::{Cancel, RetryPolicy};
use crate::session::SessionLease;
use crate::storage::{BlobStore, EmailProvider, Storage};
use crate::types::{
    BlockDefinition, BlockParams, HttpRequestParams, Task, TaskBlockParams, TaskStatus,
    WorkflowRun,
};
use crate::workflow::code::run_code_block;
use crate::workflow::context::RunContext;

#[derive(Debug, Clone)]
pub struct BlockRuntimeConfig {
    pub http_timeout: Duration,
    pub code_timeout: Duration,
    pub navigation_timeout: Duration,
}

impl Default for BlockRuntimeConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            code_timeout: Duration::from_secs(30),
            navigation_timeout: Duration::from_secs(30),
        }
    }
}

pub struct BlockRuntime {
    engine: Arc<TaskEngine>,
    storage: Arc<dyn Storage>,
    blob: Arc<dyn BlobStore>,
    email: Arc<dyn EmailProvider>,
    oracle: Arc<dyn DecisionOracle>,
    http: reqwest::Client,
    config: BlockRuntimeConfig,
}

impl BlockRuntime {
    pub fn new(
        engine: Arc<TaskEngine>,
        storage: Arc<dyn Storage>,
        blob: Arc<dyn BlobStore>,
        email: Arc<dyn EmailProvider>,
        oracle: Arc<dyn DecisionOracle>,
        config: BlockRuntimeConfig,
    ) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_default();
        Self {
            engine,
            storage,
            blob,
            email,
            oracle,
            http,
            config,
        }
    }

    /// Execute a block with its retry budget. Parameters re-render on every
    /// attempt; backoff is 200ms, doubling, capped at 5s. `attempts_made`
    /// reports how many attempts actually ran.
    pub async fn execute_with_retries(
        &self,
        block: &BlockDefinition,
        ctx: &mut RunContext,
        run: &WorkflowRun,
        session: Option<&SessionLease>,
        cancel: &Cancel,
        attempts_made: &mut u32,
    ) -> Result<Value> {
        let policy = RetryPolicy::block(block.max_retries);
        let mut attempt = 0u32;
        loop {
            cancel.check()?;
            *attempts_made = attempt + 1;
            match self.execute(block, ctx, run, session, cancel).await {
                Ok(output) => return Ok(output),
                Err(e) if e.short_circuits() || matches!(e, ExecutionError::Canceled) => {
                    return Err(e)
                }
                Err(e) if attempt < block.max_retries => {
                    warn!(label = %block.label, attempt, "block attempt failed: {}", e);
                    cancel.sleep(policy.delay(attempt)).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn execute_boxed<'a>(
        &'a self,
        block: &'a BlockDefinition,
        ctx: &'a mut RunContext,
        run: &'a WorkflowRun,
        session: Option<&'a SessionLease>,
        cancel: &'a Cancel,
        attempts_made: &'a mut u32,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(self.execute_with_retries(block, ctx, run, session, cancel, attempts_made))
    }

    /// One attempt at one block.
    pub async fn execute(
        &self,
        block: &BlockDefinition,
        ctx: &mut RunContext,
        run: &WorkflowRun,
        session: Option<&SessionLease>,
        cancel: &Cancel,
    ) -> Result<Value> {
        debug!(label = %block.label, kind = block.params.kind_str(), "executing block");
        let strict = block.strict;
        match &block.params {
            BlockParams::Task(params)
            | BlockParams::TaskV2(params)
            | BlockParams::Action(params)
            | BlockParams::Navigation(params)
            | BlockParams::Extraction(params)
            | BlockParams::Login(params) => {
                self.run_task_block(block, params, ctx, run, session, cancel).await
            }
            BlockParams::ForLoop { loop_over, blocks } => {
                self.run_for_loop(block, loop_over, blocks, ctx, run, session, cancel).await
            }
            BlockParams::Validation { expression, error_message } => {
                let rendered = ctx.render(expression, strict)?;
                if evaluate_expression(&rendered) {
                    Ok(json!({ "valid": true }))
                } else {
                    let message = match error_message {
                        Some(message) => ctx.render(message, false)?,
                        None => format!("validation '{}' evaluated false: {}", block.label, rendered),
                    };
                    Err(ExecutionError::Validation(message))
                }
            }
            BlockParams::Wait { seconds } => {
                let bounded = (*seconds).min(3600);
                cancel.sleep(Duration::from_secs(bounded)).await?;
                Ok(json!({}))
            }
            BlockParams::Code { source } => {
                let vars = ctx.code_vars();
                cancel
                    .guard(run_code_block(source, vars, self.config.code_timeout))
                    .await
            }
            BlockParams::TextPrompt { prompt, .. } => {
                let rendered = ctx.render(prompt, strict)?;
                let response = cancel.guard(self.oracle.complete_text(&rendered)).await?;
                if response.is_empty() {
                    return Err(ExecutionError::Oracle("empty completion".into()));
                }
                Ok(Value::String(response))
            }
            BlockParams::PdfParser { file_url, .. } => {
                let url = ctx.render(file_url, strict)?;
                let bytes = self.fetch_bytes(&url).await?;
                let text = pdf_extract::extract_text_from_mem(&bytes)
                    .map_err(|e| ExecutionError::Validation(format!("pdf parse: {}", e)))?;
                Ok(json!({ "text": text, "bytes": bytes.len() }))
            }
            BlockParams::FileUrlParser { file_url } => {
                let url = ctx.render(file_url, strict)?;
                self.parse_file_url(&url, cancel).await
            }
            BlockParams::FileUpload { element_ref, file_url } => {
                let lease = browser_session(session)?;
                let css = ctx.render(element_ref, strict)?;
                let url = ctx.render(file_url, strict)?;
                let bytes = self.fetch_bytes(&url).await?;
                let filename = url.rsplit('/').next().unwrap_or("upload.bin").to_string();
                let page = lease.page().await?;
                page.set_file_input(&css, &filename, &bytes).await?;
                Ok(json!({ "filename": filename, "bytes": bytes.len() }))
            }
            BlockParams::FileDownload { element_ref, url } => {
                let lease = browser_session(session)?;
                let css = match element_ref {
                    Some(element_ref) => Some(ctx.render(element_ref, strict)?),
                    None => None,
                };
                let target = match url {
                    Some(url) => Some(ctx.render(url, strict)?),
                    None => None,
                };
                let page = lease.page().await?;
                let (filename, bytes) = page.download(css.as_deref(), target.as_deref()).await?;
                let uri = self.blob.put(&bytes, "application/octet-stream").await?;
                Ok(json!({ "filename": filename, "bytes": bytes.len(), "uri": uri }))
            }
            BlockParams::BlobUpload { source_parameter, content_type } => {
                let value = ctx
                    .get(source_parameter)
                    .cloned()
                    .ok_or_else(|| ExecutionError::ParameterUnbound(source_parameter.clone()))?;
                let bytes = match &value {
                    Value::String(s) => BASE64.decode(s).unwrap_or_else(|_| s.as_bytes().to_vec()),
                    other => serde_json::to_vec(other)
                        .map_err(|e| ExecutionError::Internal(e.to_string()))?,
                };
                let content_type = content_type.as_deref().unwrap_or("application/octet-stream");
                let uri = self.blob.put(&bytes, content_type).await?;
                Ok(json!({ "uri": uri, "bytes": bytes.len() }))
            }
            BlockParams::BlobDownload { uri } => {
                let uri = ctx.render(uri, strict)?;
                let bytes = self.blob.get(&uri).await?;
                Ok(json!({
                    "uri": uri,
                    "bytes": bytes.len(),
                    "content_base64": BASE64.encode(&bytes),
                }))
            }
            BlockParams::SendEmail { to, subject, body } => {
                let recipients: Vec<String> = to
                    .iter()
                    .map(|r| ctx.render(r, strict))
                    .collect::<Result<_>>()?;
                let subject = ctx.render(subject, strict)?;
                let body = ctx.render(body, strict)?;
                let message_id = self.email.send(&recipients, &subject, &body).await?;
                Ok(json!({ "message_id": message_id }))
            }
            BlockParams::HttpRequest(params) => self.run_http_request(params, ctx, strict, cancel).await,
            BlockParams::GotoUrl { url } => {
                let lease = browser_session(session)?;
                let url = ctx.render(url, strict)?;
                let page = lease.page().await?;
                let final_url = page.goto(&url, self.config.navigation_timeout).await?;
                Ok(json!({ "final_url": final_url }))
            }
        }
    }

    async fn run_task_block(
        &self,
        block: &BlockDefinition,
        params: &TaskBlockParams,
        ctx: &mut RunContext,
        run: &WorkflowRun,
        session: Option<&SessionLease>,
        cancel: &Cancel,
    ) -> Result<Value> {
        let lease = browser_session(session)?;
        let strict = block.strict;
        let url = match &params.url {
            Some(url) => ctx.render(url, strict)?,
            None => lease.page().await?.url().await.unwrap_or_default(),
        };
        let goal = ctx.render(&params.navigation_goal, strict)?;

        let mut task = Task::new(&run.organization_id, &url, &goal);
        task.extraction_goal = match &params.extraction_goal {
            Some(goal) => Some(ctx.render(goal, strict)?),
            None => None,
        };
        task.payload = params.payload.clone();
        task.extracted_data_schema = params.extracted_data_schema.clone();
        task.max_steps = params.max_steps;
        task.retries_per_step = params.retries_per_step;
        task.totp_url = params.totp_url.clone();
        task.workflow_run_id = Some(run.workflow_run_id.clone());
        task.request_id = run.request_id.clone();
        self.storage.create_task(&task).await?;

        self.engine.run_with_lease(&mut task, lease, cancel).await?;
        info!(label = %block.label, task_id = %task.task_id, status = ?task.status, "task block finished");

        if task.status == TaskStatus::Completed {
            let final_url = lease.page().await?.url().await.unwrap_or_default();
            Ok(json!({
                "task_id": task.task_id,
                "extracted_data": task.extracted_data,
                "final_url": final_url,
            }))
        } else if task.status == TaskStatus::Canceled {
            Err(ExecutionError::Canceled)
        } else {
            match &task.failure_reason {
                Some(reason) => Err(ExecutionError::from_failure_reason(reason)),
                None => Err(ExecutionError::Internal(format!(
                    "task block '{}' ended in {:?}",
                    block.label, task.status
                ))),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_for_loop(
        &self,
        block: &BlockDefinition,
        loop_over: &Value,
        body: &[BlockDefinition],
        ctx: &mut RunContext,
        run: &WorkflowRun,
        session: Option<&SessionLease>,
        cancel: &Cancel,
    ) -> Result<Value> {
        let items = resolve_loop_items(loop_over, ctx, block.strict)?;
        let mut outputs: Vec<Value> = Vec::with_capacity(items.len());
        let mut previous: Option<Value> = None;

        for (index, item) in items.into_iter().enumerate() {
            cancel.check()?;
            let mut frame = HashMap::new();
            frame.insert("current_item".to_string(), item);
            frame.insert("current_index".to_string(), json!(index));
            if let Some(previous) = previous.take() {
                frame.insert("parent_output".to_string(), previous);
            }
            ctx.push_scope(frame);

            let mut iteration: Map<String, Value> = Map::new();
            let mut iteration_error: Option<ExecutionError> = None;
            for nested in body {
                let mut record = crate::types::WorkflowRunBlock::new(&run.workflow_run_id, nested);
                record.status = crate::types::BlockStatus::Running;
                record.started_at = Some(chrono::Utc::now());
                let _ = self.storage.create_workflow_run_block(&record).await;
                let mut attempts = 0u32;

                let result = self
                    .execute_boxed(nested, ctx, run, session, cancel, &mut attempts)
                    .await;
                record.attempts = attempts;
                record.completed_at = Some(chrono::Utc::now());
                match result {
                    Ok(output) => {
                        record.status = crate::types::BlockStatus::Completed;
                        record.output = Some(output.clone());
                        let _ = self.storage.update_workflow_run_block(&record).await;
                        ctx.set_output(&nested.output_key(), output.clone());
                        iteration.insert(nested.label.clone(), output);
                    }
                    Err(e) if nested.continue_on_failure => {
                        warn!(label = %nested.label, "nested block failed, continuing: {}", e);
                        record.status = crate::types::BlockStatus::Failed;
                        record.failure_reason = Some(e.failure_reason());
                        let _ = self.storage.update_workflow_run_block(&record).await;
                        iteration.insert(nested.label.clone(), json!({ "error": e.code() }));
                    }
                    Err(e) => {
                        record.status = crate::types::BlockStatus::Failed;
                        record.failure_reason = Some(e.failure_reason());
                        let _ = self.storage.update_workflow_run_block(&record).await;
                        iteration_error = Some(e);
                        break;
                    }
                }
            }
            ctx.pop_scope();

            let iteration_output = if body.len() == 1 {
                iteration.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null)
            } else {
                Value::Object(iteration)
            };

            match iteration_error {
                Some(e) if block.continue_on_failure => {
                    warn!(label = %block.label, index, "iteration failed, continuing: {}", e);
                    outputs.push(json!({ "error": e.code() }));
                    previous = Some(json!({ "error": e.code() }));
                }
                Some(e) => return Err(e),
                None => {
                    previous = Some(iteration_output.clone());
                    outputs.push(iteration_output);
                }
            }
        }
        Ok(Value::Array(outputs))
    }

    async fn run_http_request(
        &self,
        params: &HttpRequestParams,
        ctx: &RunContext,
        strict: bool,
        cancel: &Cancel,
    ) -> Result<Value> {
        let url = ctx.render(&params.url, strict)?;
        let method = reqwest::Method::from_bytes(params.method.to_uppercase().as_bytes())
            .map_err(|_| ExecutionError::Validation(format!("bad method {}", params.method)))?;
        let timeout = params
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.http_timeout);

        let mut request = self.http.request(method, &url).timeout(timeout);
        for (name, value) in &params.headers {
            request = request.header(name, ctx.render(value, strict)?);
        }
        if let Some(body) = &params.body {
            let rendered = match body {
                Value::String(s) => Value::String(ctx.render(s, strict)?),
                other => {
                    let text = ctx.render(&other.to_string(), strict)?;
                    serde_json::from_str(&text).unwrap_or(Value::String(text))
                }
            };
            request = request.json(&rendered);
        }

        let response = cancel
            .guard(async {
                request.send().await.map_err(|e| {
                    if e.is_redirect() {
                        ExecutionError::HttpRequest("TooManyRedirects".into())
                    } else if e.is_timeout() {
                        ExecutionError::Timeout
                    } else {
                        ExecutionError::HttpRequest(e.to_string())
                    }
                })
            })
            .await?;

        let status = response.status().as_u16();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    Value::String(value.to_str().unwrap_or_default().to_string()),
                )
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| ExecutionError::HttpRequest(e.to_string()))?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        let ok = match &params.success_codes {
            Some(codes) => codes.contains(&status),
            None => (200..300).contains(&status),
        };
        if !ok {
            return Err(ExecutionError::HttpRequest(format!(
                "unexpected status {}",
                status
            )));
        }
        Ok(json!({ "status": status, "headers": headers, "body": body }))
    }

    async fn parse_file_url(&self, url: &str, cancel: &Cancel) -> Result<Value> {
        let bytes = cancel.guard(self.fetch_bytes(url)).await?;
        let text = String::from_utf8_lossy(&bytes).to_string();
        if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
            return Ok(json!({ "content_type": "application/json", "data": parsed }));
        }
        if url.ends_with(".csv") {
            let rows: Vec<Vec<String>> = text
                .lines()
                .filter(|line| !line.is_empty())
                .map(|line| line.split(',').map(|cell| cell.trim().to_string()).collect())
                .collect();
            return Ok(json!({ "content_type": "text/csv", "data": rows }));
        }
        Ok(json!({ "content_type": "text/plain", "data": text }))
    }

    /// Resolve a file reference: blob uri, http url, or inline text.
    async fn fetch_bytes(&self, reference: &str) -> Result<Vec<u8>> {
        if reference.starts_with("blob://") || reference.starts_with("mem://") {
            return self.blob.get(reference).await;
        }
        if reference.starts_with("http://") || reference.starts_with("https://") {
            let response = self
                .http
                .get(reference)
                .timeout(self.config.http_timeout)
                .send()
                .await
                .map_err(|e| ExecutionError::HttpRequest(e.to_string()))?;
            if !response.status().is_success() {
                return Err(ExecutionError::HttpRequest(format!(
                    "fetch {} returned {}",
                    reference,
                    response.status()
                )));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ExecutionError::HttpRequest(e.to_string()))?;
            return Ok(bytes.to_vec());
        }
        Ok(reference.as_bytes().to_vec())
    }
}

fn browser_session(session: Option<&SessionLease>) -> Result<&SessionLease> {
    session.ok_or_else(|| {
        ExecutionError::Bug("browser-requiring block executed without a session".into())
    })
}

/// `loop_over` accepts a literal array, a `{{name}}` reference (which keeps
/// the referenced value's type), or a template rendering to JSON.
fn resolve_loop_items(loop_over: &Value, ctx: &RunContext, strict: bool) -> Result<Vec<Value>> {
    match loop_over {
        Value::Array(items) => Ok(items.clone()),
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.starts_with("{{") && trimmed.ends_with("}}") {
                let inner = trimmed[2..trimmed.len() - 2].trim();
                if let Some(value) = ctx.get(inner) {
                    return Ok(match value {
                        Value::Array(items) => items.clone(),
                        other => vec![other.clone()],
                    });
                }
                if strict {
                    return Err(ExecutionError::ParameterUnbound(inner.to_string()));
                }
                return Ok(Vec::new());
            }
            let rendered = ctx.render(raw, strict)?;
            match serde_json::from_str::<Value>(&rendered) {
                Ok(Value::Array(items)) => Ok(items),
                Ok(other) => Ok(vec![other]),
                Err(_) if rendered.is_empty() => Ok(Vec::new()),
                Err(_) => Ok(rendered
                    .split(',')
                    .map(|part| Value::String(part.trim().to_string()))
                    .collect()),
            }
        }
        other => Ok(vec![other.clone()]),
    }
}

/// Rendered validation expressions: equality, inequality, else truthiness.
fn evaluate_expression(rendered: &str) -> bool {
    if let Some((left, right)) = rendered.split_once("==") {
        return left.trim() == right.trim();
    }
    if let Some((left, right)) = rendered.split_once("!=") {
        return left.trim() != right.trim();
    }
    let trimmed = rendered.trim();
    !trimmed.is_empty() && !matches!(trimmed, "false" | "0" | "null" | "[]" | "{}")
}
