//! Action execution: apply one typed [`Action`] against a live page.
//!
//! Resolution goes through the scrape's css map first, then falls back to
//! content-hash matching against the current scrape. Every interaction is
//! preceded by a stability poll; native input paths fall back to synthesized
//! events when they fail.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::driver::{PageHandle, SelectBy};
use crate::error::{ExecutionError, Result};
use crate::runtime::Cancel;
use crate::scrape::ScrapedPage;
use crate::storage::BlobStore;
use crate::types::{Action, ActionResult};

#[derive(Debug, Clone)]
pub struct ActionConfig {
    pub element_stability_timeout: Duration,
    /// Settle bound applied after a mutating action.
    pub post_action_settle: Duration,
    /// Upper bound for `wait` actions.
    pub max_wait: Duration,
    /// Fail `extract` on schema mismatch instead of warning.
    pub strict_extraction: bool,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            element_stability_timeout: Duration::from_secs(1),
            post_action_settle: Duration::from_secs(2),
            max_wait: Duration::from_secs(300),
            strict_extraction: false,
        }
    }
}

pub struct ActionExecutor {
    config: ActionConfig,
    blob: Option<Arc<dyn BlobStore>>,
}

impl ActionExecutor {
    pub fn new(config: ActionConfig) -> Self {
        Self { config, blob: None }
    }

    pub fn with_blob_store(mut self, blob: Arc<dyn BlobStore>) -> Self {
        self.blob = Some(blob);
        self
    }

    /// Apply one action. Errors carry the closed-set kind; the caller turns
    /// them into an [`ActionResult`] honoring `stop_execution_on_failure`.
    pub async fn apply(
        &self,
        page: &Arc<dyn PageHandle>,
        scrape: &ScrapedPage,
        action: &Action,
        cancel: &Cancel,
    ) -> Result<ActionResult> {
        cancel.check()?;
        debug!(kind = action.kind().as_str(), "applying action");
        match action {
            Action::Click { coordinates, .. } => {
                if let Some(element_ref) = action.element_ref() {
                    let css = self.resolve(page, scrape, element_ref, action).await?;
                    self.assert_stable(page, &css).await?;
                    if let Err(e) = page.click_selector(&css).await {
                        if matches!(e, ExecutionError::ElementNotFound(_)) {
                            return Err(e);
                        }
                        // Native click failed; synthesize a mouse event at the
                        // element's center.
                        let rect = scrape
                            .elements
                            .iter()
                            .find(|el| el.css_selector == css)
                            .map(|el| el.rect);
                        match rect {
                            Some(rect) => {
                                page.click_at(
                                    rect.x + rect.width / 2.0,
                                    rect.y + rect.height / 2.0,
                                )
                                .await?
                            }
                            None => return Err(e),
                        }
                    }
                } else if let Some(point) = coordinates {
                    page.click_at(point.x, point.y).await?;
                } else {
                    return Err(ExecutionError::Validation(
                        "click without element_ref or coordinates".into(),
                    ));
                }
                Ok(ActionResult::ok(None))
            }
            Action::InputText { text, .. } => {
                let element_ref = action.element_ref().unwrap_or_default();
                let css = self.resolve(page, scrape, element_ref, action).await?;
                self.assert_stable(page, &css).await?;
                if let Err(e) = page.type_into(&css, text, true).await {
                    if matches!(e, ExecutionError::ElementNotFound(_)) {
                        return Err(e);
                    }
                    // Fall back to a JS-level value injection.
                    warn!("native typing failed ({}), injecting value", e);
                    let script = format!(
                        "(() => {{ const el = document.querySelector({css}); if (!el) return false; \
                         el.value = {text}; \
                         el.dispatchEvent(new Event('input', {{bubbles: true}})); return true; }})()",
                        css = json!(css),
                        text = json!(text),
                    );
                    if page.evaluate(&script).await?.as_bool() != Some(true) {
                        return Err(e);
                    }
                }
                Ok(ActionResult::ok(None))
            }
            Action::SelectOption { option, .. } => {
                let element_ref = action.element_ref().unwrap_or_default();
                let css = self.resolve(page, scrape, element_ref, action).await?;
                self.assert_stable(page, &css).await?;
                if page.select_option(&css, option, SelectBy::Value).await? {
                    return Ok(ActionResult::ok(Some(json!({ "matched_by": "value" }))));
                }
                if page.select_option(&css, option, SelectBy::Label).await? {
                    return Ok(ActionResult::ok(Some(json!({ "matched_by": "label" }))));
                }
                Err(ExecutionError::OptionNotFound(option.clone()))
            }
            Action::UploadFile { file_ref, .. } => {
                let element_ref = action.element_ref().unwrap_or_default();
                let css = self.resolve(page, scrape, element_ref, action).await?;
                self.assert_stable(page, &css).await?;
                let (filename, bytes) = self.fetch_file(file_ref).await?;
                page.set_file_input(&css, &filename, &bytes).await?;
                Ok(ActionResult::ok(Some(json!({
                    "filename": filename,
                    "bytes": bytes.len(),
                }))))
            }
            Action::DownloadFile { url, .. } => {
                let css = match action.element_ref() {
                    Some(element_ref) => {
                        Some(self.resolve(page, scrape, element_ref, action).await?)
                    }
                    None => None,
                };
                let (filename, bytes) = page.download(css.as_deref(), url.as_deref()).await?;
                let uri = match &self.blob {
                    Some(blob) => Some(blob.put(&bytes, "application/octet-stream").await?),
                    None => None,
                };
                Ok(ActionResult::ok(Some(json!({
                    "filename": filename,
                    "bytes": bytes.len(),
                    "uri": uri,
                }))))
            }
            Action::Wait { seconds, .. } => {
                if !seconds.is_finite() || *seconds < 0.0 {
                    return Err(ExecutionError::Validation("wait duration out of range".into()));
                }
                let wait = Duration::from_secs_f64(*seconds).min(self.config.max_wait);
                cancel.sleep(wait).await?;
                Ok(ActionResult::ok(None))
            }
            Action::Extract { schema, .. } => {
                let rescrape =
                    crate::scrape::PageScraper::scrape(page, &crate::scrape::ScrapeOptions {
                        page_ready_timeout: self.config.post_action_settle,
                        ..Default::default()
                    })
                    .await?;
                let data = json!({
                    "url": rescrape.url,
                    "text": rescrape.extracted_text,
                });
                if let Some(schema) = schema {
                    if !conforms(schema, &data) {
                        if self.config.strict_extraction {
                            return Err(ExecutionError::Validation(
                                "extracted data does not match schema".into(),
                            ));
                        }
                        warn!("extracted data does not match schema, keeping it");
                    }
                }
                Ok(ActionResult::ok(Some(data)))
            }
            Action::Scroll { dx, dy, .. } => {
                page.scroll_by(*dx, *dy).await?;
                Ok(ActionResult::ok(None))
            }
            Action::Screenshot { .. } => {
                let bytes = page.screenshot(false).await?;
                Ok(ActionResult::ok(Some(json!({ "bytes": bytes.len() }))))
            }
            Action::Complete { extracted_data, .. } => {
                Ok(ActionResult::ok(extracted_data.clone()))
            }
            Action::Terminate { reason, .. } => {
                Ok(ActionResult::ok(Some(json!({ "reason": reason }))))
            }
            Action::NullAction { .. } => Ok(ActionResult::ok(None)),
            Action::SolveCaptcha { .. } => {
                // Checkbox-style captchas respond to a click on the widget;
                // anything harder needs an external solver.
                if let Some(element_ref) = action.element_ref() {
                    let css = self.resolve(page, scrape, element_ref, action).await?;
                    self.assert_stable(page, &css).await?;
                    page.click_selector(&css).await?;
                }
                Ok(ActionResult::ok(Some(json!({ "attempted": true }))))
            }
        }
    }

    /// Resolve an element reference: css map first, then unique content-hash
    /// match against the current scrape.
    async fn resolve(
        &self,
        page: &Arc<dyn PageHandle>,
        scrape: &ScrapedPage,
        element_ref: &str,
        action: &Action,
    ) -> Result<String> {
        if let Some(css) = scrape.resolve_css(element_ref) {
            if page.element_state(css).await?.is_some() {
                return Ok(css.to_string());
            }
        }
        if let Some(hash) = &action.meta().element_content_hash {
            if let Some(element) = scrape.find_unique_by_hash(hash) {
                if page.element_state(&element.css_selector).await?.is_some() {
                    return Ok(element.css_selector.clone());
                }
            }
        }
        Err(ExecutionError::ElementNotFound(element_ref.to_string()))
    }

    /// Poll until the element is attached, visible and enabled.
    async fn assert_stable(&self, page: &Arc<dyn PageHandle>, css: &str) -> Result<()> {
        let started = std::time::Instant::now();
        loop {
            match page.element_state(css).await? {
                Some(state) if state.visible && state.enabled => return Ok(()),
                Some(_) => {}
                None => return Err(ExecutionError::ElementNotFound(css.to_string())),
            }
            if started.elapsed() >= self.config.element_stability_timeout {
                return Err(ExecutionError::ElementNotStable(css.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn fetch_file(&self, file_ref: &str) -> Result<(String, Vec<u8>)> {
        if file_ref.starts_with("blob://") || file_ref.starts_with("mem://") {
            let blob = self
                .blob
                .as_ref()
                .ok_or_else(|| ExecutionError::BlobStore("no blob store configured".into()))?;
            let bytes = blob.get(file_ref).await?;
            let name = file_ref.rsplit('/').next().unwrap_or("upload.bin").to_string();
            return Ok((name, bytes));
        }
        if file_ref.starts_with("http://") || file_ref.starts_with("https://") {
            let response = reqwest::get(file_ref)
                .await
                .map_err(|e| ExecutionError::HttpRequest(e.to_string()))?;
            let name = response
                .url()
                .path_segments()
                .and_then(|mut s| s.next_back())
                .filter(|s| !s.is_empty())
                .unwrap_or("upload.bin")
                .to_string();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ExecutionError::HttpRequest(e.to_string()))?;
            return Ok((name, bytes.to_vec()));
        }
        Ok(("upload.txt".to_string(), file_ref.as_bytes().to_vec()))
    }
}

/// Minimal schema conformance: `type` and `required` keys only.
fn conforms(schema: &Value, data: &Value) -> bool {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let matches = match expected {
            "object" => data.is_object(),
            "array" => data.is_array(),
            "string" => data.is_string(),
            "number" => data.is_number(),
            "boolean" => data.is_boolean(),
            _ => true,
        };
        if !matches {
            return false;
        }
    }
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required {
            if let Some(key) = key.as_str() {
                if data.get(key).is_none() {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::{ElementSpec, FakeDriver, FakePage, FakeSite};
    use crate::driver::{BrowserDriver, DriverConfig};
    use crate::scrape::{PageScraper, ScrapeOptions};
    use crate::types::ActionMeta;

    async fn setup(site: FakeSite) -> (Arc<dyn PageHandle>, Arc<FakePage>, ScrapedPage) {
        let driver = FakeDriver::new(site);
        let handle = driver.launch(&DriverConfig::default()).await.unwrap();
        let page = handle.new_page().await.unwrap();
        page.goto("https://ex.test", Duration::from_secs(5)).await.unwrap();
        let scrape = PageScraper::scrape(&page, &ScrapeOptions::default()).await.unwrap();
        let fake = driver.last_page().unwrap();
        (page, fake, scrape)
    }

    fn quick_config() -> ActionConfig {
        ActionConfig {
            element_stability_timeout: Duration::from_millis(200),
            ..ActionConfig::default()
        }
    }

    #[tokio::test]
    async fn click_resolves_through_css_map() {
        let site = FakeSite::new()
            .page("https://ex.test", vec![ElementSpec::new("button", "#go").text("Go")]);
        let (page, fake, scrape) = setup(site).await;
        let executor = ActionExecutor::new(quick_config());
        let element_ref = scrape.elements[0].element_id.clone();
        let action = Action::Click {
            element_ref: Some(element_ref),
            coordinates: None,
            meta: ActionMeta::default(),
        };
        let result = executor
            .apply(&page, &scrape, &action, &Cancel::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(fake.clicks(), vec!["#go"]);
    }

    #[tokio::test]
    async fn missing_element_falls_back_to_hash_then_fails() {
        let site = FakeSite::new()
            .page("https://ex.test", vec![ElementSpec::new("button", "#go").text("Go")]);
        let (page, fake, scrape) = setup(site).await;
        let executor = ActionExecutor::new(quick_config());
        let hash = scrape.elements[0].content_hash.clone();

        // Unknown ref but a matching hash: personalized resolution succeeds.
        let action = Action::Click {
            element_ref: Some("stale-ref".into()),
            coordinates: None,
            meta: ActionMeta {
                element_content_hash: Some(hash),
                ..ActionMeta::default()
            },
        };
        let result = executor
            .apply(&page, &scrape, &action, &Cancel::new())
            .await
            .unwrap();
        assert!(result.success);

        // Element gone entirely: ElementNotFound.
        fake.remove_after_snapshot("#go", 0);
        let _ = page.snapshot().await.unwrap();
        let err = executor
            .apply(&page, &scrape, &action, &Cancel::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ELEMENT_NOT_FOUND");
    }

    #[tokio::test]
    async fn unstable_element_times_out() {
        let site = FakeSite::new().page(
            "https://ex.test",
            vec![ElementSpec::new("button", "#frozen").disabled()],
        );
        let (page, _fake, scrape) = setup(site).await;
        let executor = ActionExecutor::new(quick_config());
        let action = Action::Click {
            element_ref: Some(scrape.elements[0].element_id.clone()),
            coordinates: None,
            meta: ActionMeta::default(),
        };
        let err = executor
            .apply(&page, &scrape, &action, &Cancel::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ELEMENT_NOT_STABLE");
    }

    #[tokio::test]
    async fn select_prefers_value_then_label() {
        let site = FakeSite::new().page(
            "https://ex.test",
            vec![ElementSpec::new("select", "#country")
                .option("us", "United States")
                .option("fr", "France")],
        );
        let (page, fake, scrape) = setup(site).await;
        let executor = ActionExecutor::new(quick_config());
        let element_ref = scrape.elements[0].element_id.clone();

        let by_label = Action::SelectOption {
            element_ref: element_ref.clone(),
            option: "France".into(),
            meta: ActionMeta::default(),
        };
        let result = executor
            .apply(&page, &scrape, &by_label, &Cancel::new())
            .await
            .unwrap();
        assert_eq!(result.data.unwrap()["matched_by"], "label");
        assert_eq!(fake.value_of("#country"), Some("fr".into()));

        let missing = Action::SelectOption {
            element_ref,
            option: "atlantis".into(),
            meta: ActionMeta::default(),
        };
        let err = executor
            .apply(&page, &scrape, &missing, &Cancel::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "OPTION_NOT_FOUND");
    }

    #[tokio::test]
    async fn wait_observes_cancel() {
        let site = FakeSite::new().page("https://ex.test", vec![]);
        let (page, _fake, scrape) = setup(site).await;
        let executor = ActionExecutor::new(quick_config());
        let cancel = Cancel::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c.fire();
        });
        let action = Action::Wait { seconds: 30.0, meta: ActionMeta::default() };
        let started = std::time::Instant::now();
        let err = executor.apply(&page, &scrape, &action, &cancel).await.unwrap_err();
        assert_eq!(err.code(), "CANCELED");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn extract_validates_schema_when_strict() {
        let site = FakeSite::new()
            .page("https://ex.test", vec![ElementSpec::new("a", "#link").text("price: 10")]);
        let (page, _fake, scrape) = setup(site).await;
        let strict = ActionExecutor::new(ActionConfig {
            strict_extraction: true,
            ..quick_config()
        });
        let conforming = Action::Extract {
            schema: Some(json!({ "type": "object", "required": ["url", "text"] })),
            meta: ActionMeta::default(),
        };
        let result = strict
            .apply(&page, &scrape, &conforming, &Cancel::new())
            .await
            .unwrap();
        assert!(result.data.unwrap()["text"].as_str().unwrap().contains("price: 10"));

        let mismatched = Action::Extract {
            schema: Some(json!({ "type": "object", "required": ["price_table"] })),
            meta: ActionMeta::default(),
        };
        let err = strict
            .apply(&page, &scrape, &mismatched, &Cancel::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
