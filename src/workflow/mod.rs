//! Workflow interpretation: run context, template rendering, block runtime
//! and the orchestrator.

pub mod code;
pub mod context;
pub mod orchestrator;
pub mod runtime;
pub mod template;
pub mod validate;

pub use context::{RunContext, SecretRedactor};
pub use orchestrator::{OrchestratorConfig, WorkflowOrchestrator};
pub use runtime::{BlockRuntime, BlockRuntimeConfig};
pub use validate::validate_definition;
