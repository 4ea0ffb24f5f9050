//! Opaque identifiers with well-known prefixes.
//!
//! Prefixes are a convention for readability in logs and API payloads, not a
//! contract: consumers must treat every id as an opaque string.

use uuid::Uuid;

pub const TASK_PREFIX: &str = "task";
pub const STEP_PREFIX: &str = "stp";
pub const ARTIFACT_PREFIX: &str = "art";
pub const WORKFLOW_PREFIX: &str = "wf";
pub const WORKFLOW_PERMANENT_PREFIX: &str = "wpid";
pub const WORKFLOW_RUN_PREFIX: &str = "wfr";
pub const WORKFLOW_RUN_BLOCK_PREFIX: &str = "wfb";
pub const BROWSER_SESSION_PREFIX: &str = "pbs";
pub const ORGANIZATION_PREFIX: &str = "org";
pub const REQUEST_PREFIX: &str = "req";

/// Mint a new id with the given prefix, e.g. `task_2f0b...`.
pub fn generate(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

pub fn task_id() -> String {
    generate(TASK_PREFIX)
}

pub fn step_id() -> String {
    generate(STEP_PREFIX)
}

pub fn artifact_id() -> String {
    generate(ARTIFACT_PREFIX)
}

pub fn workflow_id() -> String {
    generate(WORKFLOW_PREFIX)
}

pub fn workflow_permanent_id() -> String {
    generate(WORKFLOW_PERMANENT_PREFIX)
}

pub fn workflow_run_id() -> String {
    generate(WORKFLOW_RUN_PREFIX)
}

pub fn workflow_run_block_id() -> String {
    generate(WORKFLOW_RUN_BLOCK_PREFIX)
}

pub fn browser_session_id() -> String {
    generate(BROWSER_SESSION_PREFIX)
}

pub fn organization_id() -> String {
    generate(ORGANIZATION_PREFIX)
}

pub fn request_id() -> String {
    generate(REQUEST_PREFIX)
}
