//! Workflow templates, runs, and the block-definition union.
//!
//! A workflow definition is a flat block list (sequences and `for_loop`
//! nesting only, no general DAG). Blocks share an envelope — label,
//! continue-on-failure, retry budget, output parameter — and carry per-kind
//! parameters as a tagged union, dispatched by a single `match` in the
//! block runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::FailureReason;
use crate::types::ids;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Declared workflow parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "parameter_type", rename_all = "snake_case")]
pub enum Parameter {
    /// Caller-supplied value, optionally defaulted.
    Workflow {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_value: Option<Value>,
        #[serde(default)]
        required: bool,
    },
    /// Derived from another parameter at run start.
    Context { key: String, source_key: String },
    /// Declared output slot a block writes into.
    Output { key: String },
    /// Resolved through the secrets provider; never logged.
    Secret { key: String, secret_name: String },
}

impl Parameter {
    pub fn key(&self) -> &str {
        match self {
            Self::Workflow { key, .. }
            | Self::Context { key, .. }
            | Self::Output { key }
            | Self::Secret { key, .. } => key,
        }
    }
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// Parameters for the task-family blocks (`task`, `task_v2`, `action`,
/// `navigation`, `extraction`, `login`). All of them run the task engine on
/// the shared workflow session; they differ in goal emphasis only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBlockParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub navigation_goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_data_schema: Option<Value>,
    #[serde(default = "default_block_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_retries_per_step")]
    pub retries_per_step: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp_url: Option<String>,
}

fn default_block_max_steps() -> u32 {
    10
}

fn default_retries_per_step() -> u32 {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestParams {
    #[serde(default = "default_http_method")]
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Accepted status codes; defaults to the 2xx class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_codes: Option<Vec<u16>>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

/// Per-kind block parameters. The kind set is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockParams {
    Task(TaskBlockParams),
    TaskV2(TaskBlockParams),
    Action(TaskBlockParams),
    Navigation(TaskBlockParams),
    Extraction(TaskBlockParams),
    Login(TaskBlockParams),
    ForLoop {
        /// Parameter reference or literal array to iterate over.
        loop_over: Value,
        blocks: Vec<BlockDefinition>,
    },
    Validation {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    Wait {
        seconds: u64,
    },
    Code {
        source: String,
    },
    TextPrompt {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        json_schema: Option<Value>,
    },
    PdfParser {
        file_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        json_schema: Option<Value>,
    },
    FileUrlParser {
        file_url: String,
    },
    FileUpload {
        element_ref: String,
        file_url: String,
    },
    FileDownload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    BlobUpload {
        /// RunContext parameter holding the bytes (base64 or string).
        source_parameter: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },
    BlobDownload {
        uri: String,
    },
    SendEmail {
        to: Vec<String>,
        subject: String,
        body: String,
    },
    HttpRequest(HttpRequestParams),
    GotoUrl {
        url: String,
    },
}

impl BlockParams {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Task(_) => "task",
            Self::TaskV2(_) => "task_v2",
            Self::Action(_) => "action",
            Self::Navigation(_) => "navigation",
            Self::Extraction(_) => "extraction",
            Self::Login(_) => "login",
            Self::ForLoop { .. } => "for_loop",
            Self::Validation { .. } => "validation",
            Self::Wait { .. } => "wait",
            Self::Code { .. } => "code",
            Self::TextPrompt { .. } => "text_prompt",
            Self::PdfParser { .. } => "pdf_parser",
            Self::FileUrlParser { .. } => "file_url_parser",
            Self::FileUpload { .. } => "file_upload",
            Self::FileDownload { .. } => "file_download",
            Self::BlobUpload { .. } => "blob_upload",
            Self::BlobDownload { .. } => "blob_download",
            Self::SendEmail { .. } => "send_email",
            Self::HttpRequest(_) => "http_request",
            Self::GotoUrl { .. } => "goto_url",
        }
    }

    /// Whether executing this block needs the shared browser session.
    pub fn requires_browser(&self) -> bool {
        match self {
            Self::Task(_)
            | Self::TaskV2(_)
            | Self::Action(_)
            | Self::Navigation(_)
            | Self::Extraction(_)
            | Self::Login(_)
            | Self::FileUpload { .. }
            | Self::FileDownload { .. }
            | Self::GotoUrl { .. } => true,
            Self::ForLoop { blocks, .. } => blocks.iter().any(|b| b.params.requires_browser()),
            _ => false,
        }
    }
}

/// One node in a workflow definition: the shared envelope plus per-kind
/// parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDefinition {
    /// Unique within the workflow.
    pub label: String,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub max_retries: u32,
    /// Fail rendering on undefined template variables instead of
    /// substituting empty.
    #[serde(default)]
    pub strict: bool,
    /// RunContext key the block's output is recorded under; defaults to
    /// `<label>_output`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_parameter: Option<String>,
    #[serde(flatten)]
    pub params: BlockParams,
}

impl BlockDefinition {
    pub fn output_key(&self) -> String {
        self.output_parameter
            .clone()
            .unwrap_or_else(|| format!("{}_output", self.label))
    }
}

// ---------------------------------------------------------------------------
// Workflow template and run records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub blocks: Vec<BlockDefinition>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

/// A reusable template. `workflow_permanent_id` is stable across versions;
/// `version` is monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub workflow_permanent_id: String,
    pub organization_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: u32,
    pub definition: WorkflowDefinition,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(organization_id: &str, title: &str, definition: WorkflowDefinition) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: ids::workflow_id(),
            workflow_permanent_id: ids::workflow_permanent_id(),
            organization_id: organization_id.to_string(),
            title: title.to_string(),
            description: None,
            version: 1,
            definition,
            created_at: now,
            modified_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl WorkflowRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// One execution of a (workflow, version) with concrete parameter values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub workflow_run_id: String,
    pub workflow_id: String,
    pub workflow_permanent_id: String,
    pub organization_id: String,
    pub status: WorkflowRunStatus,
    /// Index of the block currently executing; advances only on block
    /// terminal status, equals `blocks.len()` after a full pass.
    pub current_block_index: usize,
    pub parameters: HashMap<String, Value>,
    /// Output-parameter values recorded so far.
    pub outputs: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(workflow: &Workflow, parameters: HashMap<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            workflow_run_id: ids::workflow_run_id(),
            workflow_id: workflow.workflow_id.clone(),
            workflow_permanent_id: workflow.workflow_permanent_id.clone(),
            organization_id: workflow.organization_id.clone(),
            status: WorkflowRunStatus::Created,
            current_block_index: 0,
            parameters,
            outputs: HashMap::new(),
            failure_reason: None,
            webhook_url: None,
            max_duration_secs: None,
            request_id: None,
            created_at: now,
            modified_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Created,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl BlockStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// One block execution within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunBlock {
    pub workflow_run_block_id: String,
    pub workflow_run_id: String,
    pub label: String,
    pub block_kind: String,
    pub status: BlockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl WorkflowRunBlock {
    pub fn new(workflow_run_id: &str, block: &BlockDefinition) -> Self {
        let now = Utc::now();
        Self {
            workflow_run_block_id: ids::workflow_run_block_id(),
            workflow_run_id: workflow_run_id.to_string(),
            label: block.label.clone(),
            block_kind: block.params.kind_str().to_string(),
            status: BlockStatus::Created,
            inputs: None,
            output: None,
            attempts: 0,
            failure_reason: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            modified_at: now,
        }
    }
}
