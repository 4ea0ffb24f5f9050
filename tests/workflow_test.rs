//! Workflow orchestration scenarios on the fake driver and a local HTTP
//! fixture server.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::Path;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use common::{login_site, Harness};
use stratus::driver::fake::{ElementSpec, FakeSite};
use stratus::oracle::ScriptedOracle;
use stratus::runtime::Cancel;
use stratus::storage::Storage;
use stratus::types::{
    Action, ActionMeta, BlockDefinition, BlockParams, BlockStatus, HttpRequestParams, Parameter,
    Workflow, WorkflowDefinition, WorkflowRun, WorkflowRunStatus,
};

fn block(label: &str, params: BlockParams) -> BlockDefinition {
    BlockDefinition {
        label: label.to_string(),
        continue_on_failure: false,
        max_retries: 0,
        strict: false,
        output_parameter: None,
        params,
    }
}

fn http_block(label: &str, url: &str) -> BlockDefinition {
    block(
        label,
        BlockParams::HttpRequest(HttpRequestParams {
            method: "GET".into(),
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout_secs: Some(5),
            success_codes: None,
        }),
    )
}

/// Local fixture server for http_request and file_url_parser blocks.
async fn spawn_fixture_server() -> String {
    let app = Router::new()
        .route(
            "/item/:id",
            get(|Path(id): Path<String>| async move { Json(json!({ "item": id })) }),
        )
        .route(
            "/data.json",
            get(|| async { Json(json!([{ "sku": "a" }, { "sku": "b" }])) }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn run_workflow(
    harness: &Harness,
    definition: WorkflowDefinition,
    parameters: HashMap<String, Value>,
) -> WorkflowRun {
    let workflow = Workflow::new(&harness.org.organization_id, "test workflow", definition);
    harness.storage.create_workflow(&workflow).await.unwrap();
    let run = WorkflowRun::new(&workflow, parameters);
    harness.storage.create_workflow_run(&run).await.unwrap();
    harness
        .orchestrator
        .execute_run(&harness.org.organization_id, &run.workflow_run_id, Cancel::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn goto_then_for_loop_of_http_requests() {
    let base_http = spawn_fixture_server().await;
    let harness = Harness::new(login_site(), ScriptedOracle::new()).await;

    let mut loop_block = block(
        "for_loop",
        BlockParams::ForLoop {
            loop_over: json!("{{items}}"),
            blocks: vec![http_block("fetch", "{{api}}/item/{{current_item}}")],
        },
    );
    loop_block.output_parameter = Some("for_loop".into());

    let definition = WorkflowDefinition {
        blocks: vec![
            block("landing", BlockParams::GotoUrl { url: "{{base}}".into() }),
            loop_block,
        ],
        parameters: vec![],
    };
    let params = HashMap::from([
        ("base".to_string(), json!("https://ex.test/login")),
        ("api".to_string(), json!(base_http)),
        ("items".to_string(), json!(["a", "b", "c"])),
    ]);
    let run = run_workflow(&harness, definition, params).await;

    assert_eq!(run.status, WorkflowRunStatus::Completed);
    assert_eq!(run.current_block_index, 2, "index equals block count on completion");

    // One navigation, three HTTP fetches all returning 200.
    let page = harness.driver.last_page().unwrap();
    assert_eq!(page.navigations(), vec!["https://ex.test/login"]);
    let outputs = run.outputs.get("for_loop").unwrap().as_array().unwrap();
    assert_eq!(outputs.len(), 3);
    for (i, output) in outputs.iter().enumerate() {
        assert_eq!(output["status"], 200);
        assert_eq!(output["body"]["item"], json!(["a", "b", "c"][i]));
    }

    // Top-level records plus one per loop-body execution.
    let records = harness
        .storage
        .list_workflow_run_blocks(&run.workflow_run_id)
        .await
        .unwrap();
    let http_records = records.iter().filter(|b| b.block_kind == "http_request").count();
    assert_eq!(http_records, 3);
    assert!(records.iter().all(|b| b.status == BlockStatus::Completed));
}

#[tokio::test]
async fn for_loop_over_empty_array_succeeds_with_empty_output() {
    let harness = Harness::new(login_site(), ScriptedOracle::new()).await;
    let definition = WorkflowDefinition {
        blocks: vec![block(
            "loop",
            BlockParams::ForLoop {
                loop_over: json!("{{items}}"),
                blocks: vec![block("noop", BlockParams::Wait { seconds: 0 })],
            },
        )],
        parameters: vec![],
    };
    let run = run_workflow(
        &harness,
        definition,
        HashMap::from([("items".to_string(), json!([]))]),
    )
    .await;
    assert_eq!(run.status, WorkflowRunStatus::Completed);
    assert_eq!(run.outputs.get("loop_output").unwrap(), &json!([]));
}

#[tokio::test]
async fn two_task_blocks_share_one_browser_session() {
    let site = FakeSite::new().page(
        "https://ex.test",
        vec![ElementSpec::new("button", "#go").text("Go")],
    );
    let oracle = ScriptedOracle::new()
        .then_actions(vec![Action::Complete { extracted_data: None, meta: ActionMeta::default() }])
        .then_actions(vec![Action::Complete {
            extracted_data: Some(json!({ "done": true })),
            meta: ActionMeta::default(),
        }]);
    let harness = Harness::new(site, oracle).await;

    let definition = WorkflowDefinition {
        blocks: vec![
            block(
                "first",
                BlockParams::Task(stratus::types::TaskBlockParams {
                    url: Some("https://ex.test/a".into()),
                    navigation_goal: "first task".into(),
                    extraction_goal: None,
                    payload: None,
                    extracted_data_schema: None,
                    max_steps: 2,
                    retries_per_step: 0,
                    totp_url: None,
                }),
            ),
            block(
                "second",
                BlockParams::Task(stratus::types::TaskBlockParams {
                    url: Some("https://ex.test/b".into()),
                    navigation_goal: "second task".into(),
                    extraction_goal: None,
                    payload: None,
                    extracted_data_schema: None,
                    max_steps: 2,
                    retries_per_step: 0,
                    totp_url: None,
                }),
            ),
        ],
        parameters: vec![],
    };
    let run = run_workflow(&harness, definition, HashMap::new()).await;

    assert_eq!(run.status, WorkflowRunStatus::Completed);
    assert_eq!(harness.driver.launches(), 1, "one shared browser for the run");
    let page = harness.driver.last_page().unwrap();
    assert_eq!(
        page.navigations(),
        vec!["https://ex.test/a", "https://ex.test/b"],
        "both tasks drove the same page in order"
    );
    assert_eq!(
        run.outputs.get("second_output").unwrap()["extracted_data"],
        json!({ "done": true })
    );
    assert_eq!(harness.sessions.live_count(), 0, "session released at run end");
}

#[tokio::test]
async fn cancellation_interrupts_a_wait_block() {
    let harness = Harness::new(login_site(), ScriptedOracle::new()).await;
    let workflow = Workflow::new(
        &harness.org.organization_id,
        "slow",
        WorkflowDefinition {
            blocks: vec![
                block("pause", BlockParams::Wait { seconds: 30 }),
                block("never", BlockParams::Wait { seconds: 1 }),
            ],
            parameters: vec![],
        },
    );
    harness.storage.create_workflow(&workflow).await.unwrap();
    let run = WorkflowRun::new(&workflow, HashMap::new());
    harness.storage.create_workflow_run(&run).await.unwrap();

    let cancel = Cancel::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.fire();
    });
    let started = std::time::Instant::now();
    let finished = harness
        .orchestrator
        .execute_run(&harness.org.organization_id, &run.workflow_run_id, cancel)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(finished.status, WorkflowRunStatus::Canceled);
    assert_eq!(finished.current_block_index, 0, "the second block never started");

    let records = harness
        .storage
        .list_workflow_run_blocks(&finished.workflow_run_id)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BlockStatus::Canceled);
}

#[tokio::test]
async fn continue_on_failure_advances_past_a_failing_block() {
    let harness = Harness::new(login_site(), ScriptedOracle::new()).await;
    let mut failing = block(
        "check",
        BlockParams::Validation {
            expression: "1 == 2".into(),
            error_message: Some("numbers diverge".into()),
        },
    );
    failing.continue_on_failure = true;
    let definition = WorkflowDefinition {
        blocks: vec![
            failing,
            block("after", BlockParams::Wait { seconds: 0 }),
        ],
        parameters: vec![],
    };
    let run = run_workflow(&harness, definition, HashMap::new()).await;

    assert_eq!(run.status, WorkflowRunStatus::Completed);
    assert_eq!(run.outputs.get("check_output").unwrap()["error"], "VALIDATION_ERROR");
    assert!(run.outputs.contains_key("after_output"));

    // Without continue_on_failure the same workflow stops at the first
    // block.
    let strict_definition = WorkflowDefinition {
        blocks: vec![
            block(
                "check2",
                BlockParams::Validation { expression: "1 == 2".into(), error_message: None },
            ),
            block("after2", BlockParams::Wait { seconds: 0 }),
        ],
        parameters: vec![],
    };
    let failed = run_workflow(&harness, strict_definition, HashMap::new()).await;
    assert_eq!(failed.status, WorkflowRunStatus::Failed);
    assert_eq!(failed.failure_reason.unwrap().code, "VALIDATION_ERROR");
    assert_eq!(failed.current_block_index, 0);
    assert!(!failed.outputs.contains_key("after2_output"));
}

#[tokio::test]
async fn code_text_prompt_and_validation_blocks() {
    let oracle = ScriptedOracle::new().with_completion("a summary of the page");
    let harness = Harness::new(login_site(), oracle).await;

    let definition = WorkflowDefinition {
        blocks: vec![
            block("compute", BlockParams::Code { source: "return price * 2".into() }),
            block(
                "verify",
                BlockParams::Validation {
                    expression: "{{compute_output}} == 42".into(),
                    error_message: None,
                },
            ),
            block("summarize", BlockParams::TextPrompt {
                prompt: "Summarize {{base}}".into(),
                json_schema: None,
            }),
        ],
        parameters: vec![],
    };
    let params = HashMap::from([
        ("price".to_string(), json!(21)),
        ("base".to_string(), json!("https://ex.test")),
    ]);
    let run = run_workflow(&harness, definition, params).await;

    assert_eq!(run.status, WorkflowRunStatus::Completed);
    assert_eq!(run.outputs.get("compute_output").unwrap(), &json!(42));
    assert_eq!(run.outputs.get("verify_output").unwrap(), &json!({ "valid": true }));
    assert_eq!(
        run.outputs.get("summarize_output").unwrap(),
        &json!("a summary of the page")
    );
}

#[tokio::test]
async fn blob_email_and_file_parser_blocks() {
    let base_http = spawn_fixture_server().await;
    let harness = Harness::new(login_site(), ScriptedOracle::new()).await;

    let definition = WorkflowDefinition {
        blocks: vec![
            block(
                "stash",
                BlockParams::BlobUpload {
                    source_parameter: "report".into(),
                    content_type: Some("text/plain".into()),
                },
            ),
            block("restore", BlockParams::BlobDownload { uri: "{{stash_output.uri}}".into() }),
            block(
                "notify",
                BlockParams::SendEmail {
                    to: vec!["ops@ex.test".into()],
                    subject: "report {{current_date}}".into(),
                    body: "stored {{stash_output.bytes}} bytes".into(),
                },
            ),
            block("parse", BlockParams::FileUrlParser { file_url: format!("{}/data.json", base_http) }),
        ],
        parameters: vec![],
    };
    let params = HashMap::from([
        ("report".to_string(), json!("aGVsbG8gd29ybGQ=")),
        ("current_date".to_string(), json!("2024-05-01")),
    ]);
    let run = run_workflow(&harness, definition, params).await;

    assert_eq!(run.status, WorkflowRunStatus::Completed);
    let stash = run.outputs.get("stash_output").unwrap();
    assert!(stash["uri"].as_str().unwrap().starts_with("blob://"));
    assert_eq!(stash["bytes"], json!(11), "base64 was decoded before storage");

    let restored = run.outputs.get("restore_output").unwrap();
    assert_eq!(restored["content_base64"], json!("aGVsbG8gd29ybGQ="));

    let sent = harness.email.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "report 2024-05-01");
    assert_eq!(sent[0].2, "stored 11 bytes");

    let parsed = run.outputs.get("parse_output").unwrap();
    assert_eq!(parsed["content_type"], "application/json");
    assert_eq!(parsed["data"][1]["sku"], "b");
}

#[tokio::test]
async fn secret_parameters_resolve_and_render() {
    let harness = Harness::with_secrets(
        login_site(),
        ScriptedOracle::new(),
        HashMap::from([("site_token".to_string(), "tok-123".to_string())]),
    )
    .await;

    let definition = WorkflowDefinition {
        blocks: vec![block(
            "gate",
            BlockParams::Validation {
                expression: "{{token}} == tok-123".into(),
                error_message: None,
            },
        )],
        parameters: vec![Parameter::Secret {
            key: "token".into(),
            secret_name: "site_token".into(),
        }],
    };
    let run = run_workflow(&harness, definition, HashMap::new()).await;
    assert_eq!(run.status, WorkflowRunStatus::Completed);
}

#[tokio::test]
async fn missing_required_parameter_fails_the_run() {
    let harness = Harness::new(login_site(), ScriptedOracle::new()).await;
    let definition = WorkflowDefinition {
        blocks: vec![block("noop", BlockParams::Wait { seconds: 0 })],
        parameters: vec![Parameter::Workflow {
            key: "target".into(),
            default_value: None,
            required: true,
        }],
    };
    let run = run_workflow(&harness, definition, HashMap::new()).await;
    assert_eq!(run.status, WorkflowRunStatus::Failed);
    assert_eq!(run.failure_reason.unwrap().code, "PARAMETER_UNBOUND");
}

#[tokio::test]
async fn invalid_definitions_are_rejected_before_execution() {
    let harness = Harness::new(login_site(), ScriptedOracle::new()).await;
    let definition = WorkflowDefinition {
        blocks: vec![
            block("dup", BlockParams::Wait { seconds: 0 }),
            block("dup", BlockParams::Wait { seconds: 0 }),
        ],
        parameters: vec![],
    };
    let run = run_workflow(&harness, definition, HashMap::new()).await;
    assert_eq!(run.status, WorkflowRunStatus::Failed);
    assert_eq!(run.failure_reason.unwrap().code, "WORKFLOW_GRAPH_INVALID");
    assert!(
        harness
            .storage
            .list_workflow_run_blocks(&run.workflow_run_id)
            .await
            .unwrap()
            .is_empty(),
        "no block ran"
    );
}

#[tokio::test]
async fn pdf_parser_rejects_garbage_bytes() {
    let harness = Harness::new(login_site(), ScriptedOracle::new()).await;
    let garbage_uri = {
        use stratus::storage::BlobStore;
        harness.blob.put(b"not a pdf", "application/pdf").await.unwrap()
    };
    let definition = WorkflowDefinition {
        blocks: vec![block(
            "parse",
            BlockParams::PdfParser { file_url: garbage_uri, json_schema: None },
        )],
        parameters: vec![],
    };
    let run = run_workflow(&harness, definition, HashMap::new()).await;
    assert_eq!(run.status, WorkflowRunStatus::Failed);
    assert_eq!(run.failure_reason.unwrap().code, "VALIDATION_ERROR");
}

#[tokio::test]
async fn failing_block_consumes_its_retry_budget() {
    let harness = Harness::new(login_site(), ScriptedOracle::new()).await;
    let mut flaky = block(
        "gate",
        BlockParams::Validation {
            expression: "{{ready}} == yes".into(),
            error_message: None,
        },
    );
    flaky.max_retries = 1;
    let definition = WorkflowDefinition {
        blocks: vec![flaky],
        parameters: vec![],
    };
    let run = run_workflow(
        &harness,
        definition,
        HashMap::from([("ready".to_string(), json!("no"))]),
    )
    .await;
    assert_eq!(run.status, WorkflowRunStatus::Failed);

    let records = harness
        .storage
        .list_workflow_run_blocks(&run.workflow_run_id)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 2, "initial attempt plus one retry");
    assert_eq!(records[0].status, BlockStatus::Failed);
}
