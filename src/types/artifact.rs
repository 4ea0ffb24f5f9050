//! Immutable execution artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ids;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    ScreenshotLlm,
    ScreenshotStep,
    ScreenshotAction,
    HtmlScrape,
    ElementTree,
    IdToCssMap,
    Har,
    Trace,
    ConsoleLog,
    DownloadedFile,
    ExtractedData,
    Video,
    Log,
}

/// A blob produced during execution, attributed to a step, task and/or
/// workflow run. Immutable once recorded; the `uri` is stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub organization_id: String,
    pub kind: ArtifactKind,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<String>,
    /// Monotonic per-step sequence so readers can reconstruct action order.
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(organization_id: &str, kind: ArtifactKind, uri: &str, sequence: u64) -> Self {
        let now = Utc::now();
        Self {
            artifact_id: ids::artifact_id(),
            organization_id: organization_id.to_string(),
            kind,
            uri: uri.to_string(),
            bytes_size: None,
            content_type: None,
            task_id: None,
            step_id: None,
            workflow_run_id: None,
            sequence,
            request_id: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn for_step(mut self, task_id: &str, step_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self.step_id = Some(step_id.to_string());
        self
    }

    pub fn for_run(mut self, workflow_run_id: &str) -> Self {
        self.workflow_run_id = Some(workflow_run_id.to_string());
        self
    }

    pub fn with_content(mut self, content_type: &str, bytes_size: u64) -> Self {
        self.content_type = Some(content_type.to_string());
        self.bytes_size = Some(bytes_size);
        self
    }
}
