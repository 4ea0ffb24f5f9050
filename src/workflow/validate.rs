//! Workflow definition validation, run before the first block executes.

use std::collections::HashSet;

use crate::error::{ExecutionError, Result};
use crate::types::{BlockDefinition, BlockParams, Parameter, WorkflowDefinition};

const MAX_LOOP_DEPTH: usize = 4;
const MAX_WAIT_SECS: u64 = 3600;

/// Reject definitions a traversal could not execute deterministically:
/// duplicate labels, over-deep loop nesting, out-of-range waits, duplicate
/// parameter keys.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<()> {
    let mut labels = HashSet::new();
    validate_blocks(&definition.blocks, &mut labels, 0)?;

    let mut keys = HashSet::new();
    for parameter in &definition.parameters {
        if !keys.insert(parameter.key().to_string()) {
            return Err(ExecutionError::WorkflowGraphInvalid(format!(
                "duplicate parameter key '{}'",
                parameter.key()
            )));
        }
        if let Parameter::Context { key, source_key } = parameter {
            if key == source_key {
                return Err(ExecutionError::WorkflowGraphInvalid(format!(
                    "context parameter '{}' references itself",
                    key
                )));
            }
        }
    }
    Ok(())
}

fn validate_blocks(
    blocks: &[BlockDefinition],
    labels: &mut HashSet<String>,
    depth: usize,
) -> Result<()> {
    if depth > MAX_LOOP_DEPTH {
        return Err(ExecutionError::WorkflowGraphInvalid(format!(
            "loop nesting exceeds {} levels",
            MAX_LOOP_DEPTH
        )));
    }
    for block in blocks {
        if block.label.is_empty() {
            return Err(ExecutionError::WorkflowGraphInvalid(
                "block label must not be empty".into(),
            ));
        }
        if !labels.insert(block.label.clone()) {
            return Err(ExecutionError::WorkflowGraphInvalid(format!(
                "duplicate block label '{}'",
                block.label
            )));
        }
        match &block.params {
            BlockParams::Wait { seconds } => {
                if *seconds > MAX_WAIT_SECS {
                    return Err(ExecutionError::WorkflowGraphInvalid(format!(
                        "wait block '{}' exceeds {}s",
                        block.label, MAX_WAIT_SECS
                    )));
                }
            }
            BlockParams::ForLoop { blocks: nested, .. } => {
                if nested.is_empty() {
                    return Err(ExecutionError::WorkflowGraphInvalid(format!(
                        "for_loop '{}' has no body",
                        block.label
                    )));
                }
                validate_blocks(nested, labels, depth + 1)?;
            }
            BlockParams::HttpRequest(params) => {
                let method = params.method.to_uppercase();
                if !["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"].contains(&method.as_str()) {
                    return Err(ExecutionError::WorkflowGraphInvalid(format!(
                        "http_request '{}' has unsupported method {}",
                        block.label, params.method
                    )));
                }
            }
            BlockParams::SendEmail { to, .. } => {
                if to.is_empty() {
                    return Err(ExecutionError::WorkflowGraphInvalid(format!(
                        "send_email '{}' has no recipients",
                        block.label
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HttpRequestParams;
    use std::collections::HashMap;

    fn block(label: &str, params: BlockParams) -> BlockDefinition {
        BlockDefinition {
            label: label.into(),
            continue_on_failure: false,
            max_retries: 0,
            strict: false,
            output_parameter: None,
            params,
        }
    }

    #[test]
    fn accepts_a_sane_definition() {
        let definition = WorkflowDefinition {
            blocks: vec![
                block("go", BlockParams::GotoUrl { url: "{{base}}".into() }),
                block(
                    "loop",
                    BlockParams::ForLoop {
                        loop_over: serde_json::json!("{{items}}"),
                        blocks: vec![block(
                            "fetch",
                            BlockParams::HttpRequest(HttpRequestParams {
                                method: "GET".into(),
                                url: "{{base}}/item/{{current_item}}".into(),
                                headers: HashMap::new(),
                                body: None,
                                timeout_secs: None,
                                success_codes: None,
                            }),
                        )],
                    },
                ),
            ],
            parameters: vec![],
        };
        assert!(validate_definition(&definition).is_ok());
    }

    #[test]
    fn rejects_duplicate_labels_across_nesting() {
        let definition = WorkflowDefinition {
            blocks: vec![
                block("dup", BlockParams::Wait { seconds: 1 }),
                block(
                    "loop",
                    BlockParams::ForLoop {
                        loop_over: serde_json::json!([]),
                        blocks: vec![block("dup", BlockParams::Wait { seconds: 1 })],
                    },
                ),
            ],
            parameters: vec![],
        };
        let err = validate_definition(&definition).unwrap_err();
        assert_eq!(err.code(), "WORKFLOW_GRAPH_INVALID");
    }

    #[test]
    fn rejects_out_of_range_wait() {
        let definition = WorkflowDefinition {
            blocks: vec![block("w", BlockParams::Wait { seconds: 7200 })],
            parameters: vec![],
        };
        assert!(validate_definition(&definition).is_err());
    }

    #[test]
    fn rejects_empty_loop_and_bad_method() {
        let empty_loop = WorkflowDefinition {
            blocks: vec![block(
                "loop",
                BlockParams::ForLoop { loop_over: serde_json::json!([]), blocks: vec![] },
            )],
            parameters: vec![],
        };
        assert!(validate_definition(&empty_loop).is_err());

        let bad_method = WorkflowDefinition {
            blocks: vec![block(
                "req",
                BlockParams::HttpRequest(HttpRequestParams {
                    method: "FETCH".into(),
                    url: "https://ex.test".into(),
                    headers: HashMap::new(),
                    body: None,
                    timeout_secs: None,
                    success_codes: None,
                }),
            )],
            parameters: vec![],
        };
        assert!(validate_definition(&bad_method).is_err());
    }
}
