//! Decision oracle capability.
//!
//! The oracle maps a page snapshot to the next actions. Production wires an
//! LLM behind [`HttpOracle`]; the test suite scripts decisions with
//! [`ScriptedOracle`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{ExecutionError, Result};
use crate::scrape::ScrapedPage;
use crate::types::{Action, ActionResult, Step, StepStatus, Task};

/// What the oracle decided for one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Decision {
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Prior attempt shown to the oracle, failed retries included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepHistoryEntry {
    pub order: u32,
    pub retry_index: u32,
    pub status: StepStatus,
    pub actions: Vec<Action>,
    pub results: Vec<ActionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide(
        &self,
        task: &Task,
        step: &Step,
        scraped: &ScrapedPage,
        history: &[StepHistoryEntry],
    ) -> Result<Decision>;

    /// Free-text completion for `text_prompt` blocks.
    async fn complete_text(&self, prompt: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// HTTP-backed oracle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpOracleConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

impl Default for HttpOracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9090/v1/decide".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// JSON-over-HTTP oracle client. The service behind the endpoint owns the
/// prompt and model; this client only speaks the typed decision record.
pub struct HttpOracle {
    client: reqwest::Client,
    config: HttpOracleConfig,
}

#[derive(Serialize)]
struct DecideRequest<'a> {
    task: &'a Task,
    step: &'a Step,
    url: &'a str,
    elements: &'a [crate::scrape::ScrapedElement],
    extracted_text: &'a str,
    history: &'a [StepHistoryEntry],
}

impl HttpOracle {
    pub fn new(config: HttpOracleConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ExecutionError::Internal(format!("oracle client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[async_trait]
impl DecisionOracle for HttpOracle {
    async fn decide(
        &self,
        task: &Task,
        step: &Step,
        scraped: &ScrapedPage,
        history: &[StepHistoryEntry],
    ) -> Result<Decision> {
        let body = DecideRequest {
            task,
            step,
            url: &scraped.url,
            elements: &scraped.elements,
            extracted_text: &scraped.extracted_text,
            history,
        };
        let response = self
            .request(&self.config.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExecutionError::Oracle(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ExecutionError::Oracle(format!(
                "decision endpoint returned {}",
                response.status()
            )));
        }
        response
            .json::<Decision>()
            .await
            .map_err(|e| ExecutionError::Oracle(format!("malformed decision: {}", e)))
    }

    async fn complete_text(&self, prompt: &str) -> Result<String> {
        let endpoint = format!("{}/complete", self.config.endpoint.trim_end_matches('/'));
        let response = self
            .request(&endpoint)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(|e| ExecutionError::Oracle(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ExecutionError::Oracle(format!(
                "completion endpoint returned {}",
                response.status()
            )));
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ExecutionError::Oracle(e.to_string()))?;
        value["text"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ExecutionError::Oracle("completion missing text".into()))
    }
}

// ---------------------------------------------------------------------------
// Scripted oracle for tests
// ---------------------------------------------------------------------------

type Responder = Box<dyn Fn(&ScrapedPage) -> Decision + Send + Sync>;

/// Canned decisions served in order. Responders see the live scrape so they
/// can reference real element ids.
#[derive(Default)]
pub struct ScriptedOracle {
    responders: Mutex<VecDeque<Responder>>,
    decide_calls: AtomicUsize,
    completions: Mutex<VecDeque<String>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then<F>(self, responder: F) -> Self
    where
        F: Fn(&ScrapedPage) -> Decision + Send + Sync + 'static,
    {
        self.responders.lock().push_back(Box::new(responder));
        self
    }

    pub fn then_actions(self, actions: Vec<Action>) -> Self {
        self.then(move |_| Decision {
            actions: actions.clone(),
            reasoning: None,
            confidence: Some(1.0),
        })
    }

    pub fn with_completion(self, text: &str) -> Self {
        self.completions.lock().push_back(text.to_string());
        self
    }

    /// Append a responder to an oracle already handed to the engine.
    pub fn push_with<F>(&self, responder: F)
    where
        F: Fn(&ScrapedPage) -> Decision + Send + Sync + 'static,
    {
        self.responders.lock().push_back(Box::new(responder));
    }

    pub fn push_actions(&self, actions: Vec<Action>) {
        self.push_with(move |_| Decision {
            actions: actions.clone(),
            reasoning: None,
            confidence: Some(1.0),
        });
    }

    pub fn decide_calls(&self) -> usize {
        self.decide_calls.load(Ordering::SeqCst)
    }

    /// Find an interactable element by css selector in a scrape; panics with
    /// a readable message when tests reference a missing element.
    pub fn element_ref(scraped: &ScrapedPage, css: &str) -> String {
        scraped
            .elements
            .iter()
            .find(|el| el.css_selector == css)
            .map(|el| el.element_id.clone())
            .unwrap_or_else(|| panic!("no scraped element with selector {}", css))
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn decide(
        &self,
        _task: &Task,
        _step: &Step,
        scraped: &ScrapedPage,
        _history: &[StepHistoryEntry],
    ) -> Result<Decision> {
        self.decide_calls.fetch_add(1, Ordering::SeqCst);
        let responder = self.responders.lock().pop_front();
        match responder {
            Some(responder) => Ok(responder(scraped)),
            None => Ok(Decision::default()),
        }
    }

    async fn complete_text(&self, _prompt: &str) -> Result<String> {
        self.completions
            .lock()
            .pop_front()
            .ok_or_else(|| ExecutionError::Oracle("no scripted completion".into()))
    }
}
