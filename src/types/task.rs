//! Tasks and steps: the single-automation data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FailureReason;
use crate::types::ids;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
    Terminated,
}

impl TaskStatus {
    /// Once terminal, no further step may be created for the task.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::Terminated
        )
    }
}

/// A single goal-directed automation with its own step loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub organization_id: String,
    pub status: TaskStatus,
    pub url: String,
    pub navigation_goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_data_schema: Option<Value>,
    pub max_steps: u32,
    pub retries_per_step: u32,
    /// Wall-clock budget in seconds; `None` uses the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp_url: Option<String>,
    /// Workflow run this task was launched by, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(organization_id: &str, url: &str, navigation_goal: &str) -> Self {
        let now = Utc::now();
        Self {
            task_id: ids::task_id(),
            organization_id: organization_id.to_string(),
            status: TaskStatus::Created,
            url: url.to_string(),
            navigation_goal: navigation_goal.to_string(),
            extraction_goal: None,
            payload: None,
            extracted_data_schema: None,
            max_steps: 10,
            retries_per_step: 2,
            max_duration_secs: None,
            proxy_location: None,
            webhook_url: None,
            totp_url: None,
            workflow_run_id: None,
            extracted_data: None,
            failure_reason: None,
            request_id: None,
            created_at: now,
            modified_at: now,
            completed_at: None,
        }
    }

    /// Origin + path of the task url, the decision-cache key component.
    pub fn url_pattern(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(u) => {
                let origin = u.origin().ascii_serialization();
                format!("{}{}", origin, u.path())
            }
            Err(_) => self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Created,
    Running,
    Completed,
    Failed,
    Retrying,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// One iteration of a task's loop: a scrape, a decision, and the actions it
/// yielded. Steps of a task form a contiguous prefix `order = 1..N`; retries
/// reuse the order with an incremented `retry_index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub task_id: String,
    pub order: u32,
    pub retry_index: u32,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_achieved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Step {
    pub fn new(task_id: &str, order: u32) -> Self {
        let now = Utc::now();
        Self {
            step_id: ids::step_id(),
            task_id: task_id.to_string(),
            order,
            retry_index: 0,
            status: StepStatus::Created,
            input: None,
            output: None,
            goal_achieved: None,
            failure_reason: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Successor step for a retry of the same order.
    pub fn with_retry_increment(&self) -> Self {
        let mut next = Self::new(&self.task_id, self.order);
        next.retry_index = self.retry_index + 1;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Terminated.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Retrying.is_terminal());
    }

    #[test]
    fn url_pattern_strips_query_and_fragment() {
        let mut task = Task::new("org_1", "https://ex.test/login?next=%2Fhome#top", "login");
        assert_eq!(task.url_pattern(), "https://ex.test/login");
        task.url = "not a url".into();
        assert_eq!(task.url_pattern(), "not a url");
    }

    #[test]
    fn retry_keeps_order_and_increments_index() {
        let step = Step::new("task_1", 3);
        let retry = step.with_retry_increment();
        assert_eq!(retry.order, 3);
        assert_eq!(retry.retry_index, 1);
        assert_ne!(retry.step_id, step.step_id);
    }
}
