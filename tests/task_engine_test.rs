//! Task engine scenarios: the step loop end-to-end on the fake driver.

mod common;

use std::time::Duration;

use common::{login_site, Harness};
use stratus::oracle::ScriptedOracle;
use stratus::runtime::Cancel;
use stratus::storage::Storage;
use stratus::types::{
    Action, ActionMeta, ArtifactKind, StepStatus, Task, TaskStatus,
};

fn input(scraped: &stratus::scrape::ScrapedPage, css: &str, text: &str) -> Action {
    Action::InputText {
        element_ref: ScriptedOracle::element_ref(scraped, css),
        text: text.to_string(),
        meta: ActionMeta::default(),
    }
}

fn click(scraped: &stratus::scrape::ScrapedPage, css: &str) -> Action {
    Action::Click {
        element_ref: Some(ScriptedOracle::element_ref(scraped, css)),
        coordinates: None,
        meta: ActionMeta::default(),
    }
}

fn complete() -> Action {
    Action::Complete {
        extracted_data: None,
        meta: ActionMeta::default(),
    }
}

async fn submit_login_task(harness: &Harness, max_steps: u32) -> Task {
    let mut task = Task::new(
        &harness.org.organization_id,
        "https://ex.test/login",
        "Login as alice",
    );
    task.max_steps = max_steps;
    task.retries_per_step = 1;
    harness.storage.create_task(&task).await.unwrap();
    task
}

#[tokio::test]
async fn simple_login_task_completes_in_three_steps() {
    let oracle = ScriptedOracle::new()
        .then(|s| stratus::oracle::Decision {
            actions: vec![input(s, "#email", "alice")],
            reasoning: None,
            confidence: Some(0.9),
        })
        .then(|s| stratus::oracle::Decision {
            actions: vec![input(s, "#password", "pw"), click(s, "#submit")],
            reasoning: None,
            confidence: Some(0.9),
        })
        .then(|_| stratus::oracle::Decision {
            actions: vec![complete()],
            reasoning: None,
            confidence: Some(1.0),
        });
    let harness = Harness::new(login_site(), oracle).await;
    let task = submit_login_task(&harness, 3).await;

    let finished = harness
        .engine
        .execute_task(&harness.org.organization_id, &task.task_id, Cancel::new())
        .await
        .unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);

    // Steps are contiguous 1..3, all terminal.
    let steps = harness.storage.list_steps(&task.task_id).await.unwrap();
    let orders: Vec<u32> = steps.iter().map(|s| s.order).collect();
    assert_eq!(orders, vec![1, 2, 3]);
    assert!(steps.iter().all(|s| s.status.is_terminal()));

    // The page saw the typed values and the click.
    let page = harness.driver.last_page().unwrap();
    assert_eq!(page.value_of("#email"), Some("alice".into()));
    assert_eq!(page.value_of("#password"), Some("pw".into()));
    assert_eq!(page.clicks(), vec!["#submit"]);

    // Four action screenshots (input, input, click, complete), one llm
    // screenshot per step.
    let artifacts = harness
        .storage
        .list_artifacts_for_task(&task.task_id)
        .await
        .unwrap();
    let action_shots = artifacts
        .iter()
        .filter(|a| a.kind == ArtifactKind::ScreenshotAction)
        .count();
    let step_shots = artifacts
        .iter()
        .filter(|a| a.kind == ArtifactKind::ScreenshotLlm)
        .count();
    assert_eq!(action_shots, 4);
    assert!(step_shots >= 3);

    // Reading the task back preserves the submission.
    let read = harness
        .storage
        .get_task(&harness.org.organization_id, &task.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read.navigation_goal, "Login as alice");
    assert_eq!(read.url, "https://ex.test/login");
    assert_eq!(read.max_steps, 3);
}

#[tokio::test]
async fn element_gone_mid_step_exhausts_retries() {
    let oracle = ScriptedOracle::new()
        .then(|s| stratus::oracle::Decision {
            actions: vec![click(s, "#submit")],
            reasoning: None,
            confidence: Some(0.9),
        })
        // The retried step decides on a page without the button; the ref is
        // stale and carries no matching hash.
        .then(|_| stratus::oracle::Decision {
            actions: vec![Action::Click {
                element_ref: Some("stale-submit-ref".into()),
                coordinates: None,
                meta: ActionMeta::default(),
            }],
            reasoning: None,
            confidence: Some(0.5),
        });
    let harness = Harness::new(login_site(), oracle).await;
    let mut task = submit_login_task(&harness, 3).await;

    let lease = harness
        .sessions
        .acquire(
            stratus::types::SessionScope::Task,
            &harness.org.organization_id,
            Some(&task.task_id),
            &task.task_id,
        )
        .await
        .unwrap();
    // The page mutates between the first scrape and the click.
    let page = lease.page().await.unwrap();
    drop(page);
    let fake = harness.driver.last_page().unwrap();
    fake.remove_after_snapshot("#submit", 1);

    harness
        .engine
        .run_with_lease(&mut task, &lease, &Cancel::new())
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failure_reason.as_ref().unwrap().code, "ELEMENT_NOT_FOUND");

    // Same order, strictly increasing retry_index; first attempt marked
    // retrying, second failed.
    let steps = harness.storage.list_steps(&task.task_id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!((steps[0].order, steps[0].retry_index), (1, 0));
    assert_eq!((steps[1].order, steps[1].retry_index), (1, 1));
    assert_eq!(steps[0].status, StepStatus::Retrying);
    assert_eq!(steps[1].status, StepStatus::Failed);
    assert!(fake.clicks().is_empty(), "the vanished button was never clicked");
}

#[tokio::test]
async fn zero_max_steps_fails_immediately() {
    let harness = Harness::new(login_site(), ScriptedOracle::new()).await;
    let task = submit_login_task(&harness, 0).await;

    let finished = harness
        .engine
        .execute_task(&harness.org.organization_id, &task.task_id, Cancel::new())
        .await
        .unwrap();
    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(finished.failure_reason.unwrap().code, "MAX_STEPS_REACHED");
    assert!(harness.storage.list_steps(&task.task_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_decisions_record_null_actions_until_max_steps() {
    // No scripted responders: every decision is empty.
    let harness = Harness::new(login_site(), ScriptedOracle::new()).await;
    let task = submit_login_task(&harness, 2).await;

    let finished = harness
        .engine
        .execute_task(&harness.org.organization_id, &task.task_id, Cancel::new())
        .await
        .unwrap();
    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(finished.failure_reason.unwrap().code, "MAX_STEPS_REACHED");

    let steps = harness.storage.list_steps(&task.task_id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
    for step in &steps {
        let output = step.output.as_ref().unwrap();
        assert_eq!(output["actions"][0]["kind"], "null_action");
    }

    // Null actions produce no action screenshots.
    let artifacts = harness
        .storage
        .list_artifacts_for_task(&task.task_id)
        .await
        .unwrap();
    assert!(artifacts
        .iter()
        .all(|a| a.kind != ArtifactKind::ScreenshotAction));
}

#[tokio::test]
async fn cancellation_interrupts_a_wait_action() {
    let oracle = ScriptedOracle::new().then(|_| stratus::oracle::Decision {
        actions: vec![Action::Wait {
            seconds: 10.0,
            meta: ActionMeta::default(),
        }],
        reasoning: None,
        confidence: Some(1.0),
    });
    let harness = Harness::new(login_site(), oracle).await;
    let task = submit_login_task(&harness, 3).await;

    let cancel = Cancel::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.fire();
    });

    let started = std::time::Instant::now();
    let finished = harness
        .engine
        .execute_task(&harness.org.organization_id, &task.task_id, cancel)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(3), "wait must abort promptly");
    assert_eq!(finished.status, TaskStatus::Canceled);

    let steps = harness.storage.list_steps(&task.task_id).await.unwrap();
    assert_eq!(steps.len(), 1, "no further steps after cancellation");
    assert_eq!(harness.sessions.live_count(), 0, "session released");
}

#[tokio::test]
async fn cache_replays_matching_steps_and_personalizes() {
    let oracle = ScriptedOracle::new()
        .then(|s| stratus::oracle::Decision {
            actions: vec![input(s, "#email", "alice")],
            reasoning: None,
            confidence: Some(0.9),
        })
        .then(|s| stratus::oracle::Decision {
            actions: vec![input(s, "#password", "pw"), click(s, "#submit")],
            reasoning: None,
            confidence: Some(0.9),
        })
        .then(|_| stratus::oracle::Decision {
            actions: vec![complete()],
            reasoning: None,
            confidence: Some(1.0),
        });
    let harness = Harness::new(login_site(), oracle).await;

    let first = submit_login_task(&harness, 3).await;
    let finished = harness
        .engine
        .execute_task(&harness.org.organization_id, &first.task_id, Cancel::new())
        .await
        .unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(harness.oracle.decide_calls(), 3);

    // An identical task: steps 1 and 2 replay from cache, the terminal step
    // still consults the oracle.
    harness.oracle.push_actions(vec![complete()]);
    let second = submit_login_task(&harness, 3).await;
    let finished = harness
        .engine
        .execute_task(&harness.org.organization_id, &second.task_id, Cancel::new())
        .await
        .unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(
        harness.oracle.decide_calls(),
        4,
        "exactly one oracle call for the second task"
    );

    let page = harness.driver.last_page().unwrap();
    assert_eq!(page.value_of("#email"), Some("alice".into()));
    assert_eq!(page.clicks(), vec!["#submit"]);
}

#[tokio::test]
async fn terminal_tasks_accept_no_further_execution() {
    let harness = Harness::new(login_site(), ScriptedOracle::new()).await;
    let mut task = submit_login_task(&harness, 3).await;
    task.status = TaskStatus::Completed;
    harness.storage.update_task(&task).await.unwrap();

    let unchanged = harness
        .engine
        .execute_task(&harness.org.organization_id, &task.task_id, Cancel::new())
        .await
        .unwrap();
    assert_eq!(unchanged.status, TaskStatus::Completed);
    assert!(harness.storage.list_steps(&task.task_id).await.unwrap().is_empty());
    assert_eq!(harness.oracle.decide_calls(), 0);
}
