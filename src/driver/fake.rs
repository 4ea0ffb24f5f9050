//! Deterministic in-memory driver for the test suite.
//!
//! Models a site as url-keyed element lists, journals every interaction, and
//! supports scripted mid-step mutations (element removal after the Nth
//! snapshot) so element-gone races are reproducible.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    BrowserDriver, DriverConfig, DriverHandle, ElementState, PageHandle, RawElement, Rect,
    SelectBy,
};
use crate::error::{ExecutionError, Result};

/// Fluent builder for fake page elements.
#[derive(Debug, Clone)]
pub struct ElementSpec {
    raw: RawElement,
}

impl ElementSpec {
    pub fn new(tag: &str, css: &str) -> Self {
        Self {
            raw: RawElement {
                index: 0,
                parent: None,
                tag: tag.to_string(),
                text: String::new(),
                attributes: HashMap::new(),
                rect: Rect { x: 10.0, y: 10.0, width: 120.0, height: 24.0 },
                visible: true,
                enabled: true,
                has_click_listener: false,
                hover_affects_style: false,
                css_selector: css.to_string(),
                ordinal_path: vec![0],
                same_origin_frame: true,
            },
        }
    }

    pub fn text(mut self, text: &str) -> Self {
        self.raw.text = text.to_string();
        self
    }

    pub fn attr(mut self, key: &str, value: &str) -> Self {
        self.raw.attributes.insert(key.to_string(), value.to_string());
        self
    }

    /// Register a `<select>` option; stored as an attribute so the fake
    /// select implementation can match by value or label.
    pub fn option(self, value: &str, label: &str) -> Self {
        self.attr(&format!("option:{}", value), label)
    }

    pub fn rect(mut self, x: f64, y: f64, width: f64, height: f64) -> Self {
        self.raw.rect = Rect { x, y, width, height };
        self
    }

    pub fn at_path(mut self, path: Vec<u32>) -> Self {
        self.raw.ordinal_path = path;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.raw.visible = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.raw.enabled = false;
        self
    }

    pub fn clickable(mut self) -> Self {
        self.raw.has_click_listener = true;
        self
    }

    pub fn build(self) -> RawElement {
        self.raw
    }
}

/// Url-keyed element lists; longest-prefix match on navigation.
#[derive(Debug, Clone, Default)]
pub struct FakeSite {
    pages: Vec<(String, Vec<RawElement>)>,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, elements: Vec<ElementSpec>) -> Self {
        let elements = elements
            .into_iter()
            .enumerate()
            .map(|(i, spec)| {
                let mut raw = spec.build();
                raw.index = i;
                if raw.ordinal_path == vec![0] {
                    raw.ordinal_path = vec![i as u32];
                }
                raw
            })
            .collect();
        self.pages.push((url.to_string(), elements));
        self
    }

    fn lookup(&self, url: &str) -> Vec<RawElement> {
        self.pages
            .iter()
            .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, elements)| elements.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct PageState {
    url: String,
    elements: Vec<RawElement>,
    navigations: Vec<String>,
    clicks: Vec<String>,
    typed: Vec<(String, String)>,
    selected: Vec<(String, String)>,
    values: HashMap<String, String>,
    uploads: Vec<(String, String, usize)>,
    snapshot_count: usize,
    /// (after snapshot n, css) — the element disappears once the Nth
    /// snapshot has been taken.
    pending_removals: Vec<(usize, String)>,
    scroll: (f64, f64),
    console: Vec<String>,
    eval_results: HashMap<String, Value>,
    download_payload: Option<(String, Vec<u8>)>,
    unresponsive: bool,
    screenshots_taken: usize,
}

pub struct FakePage {
    site: FakeSite,
    state: Mutex<PageState>,
}

impl FakePage {
    fn new(site: FakeSite) -> Self {
        Self {
            site,
            state: Mutex::new(PageState {
                url: "about:blank".to_string(),
                ..PageState::default()
            }),
        }
    }

    // -- test controls -----------------------------------------------------

    /// Remove the element once the Nth snapshot (1-based) has been taken.
    pub fn remove_after_snapshot(&self, css: &str, after: usize) {
        self.state.lock().pending_removals.push((after, css.to_string()));
    }

    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.state.lock().unresponsive = unresponsive;
    }

    pub fn stub_eval(&self, script: &str, result: Value) {
        self.state.lock().eval_results.insert(script.to_string(), result);
    }

    pub fn stub_download(&self, filename: &str, bytes: Vec<u8>) {
        self.state.lock().download_payload = Some((filename.to_string(), bytes));
    }

    pub fn push_console(&self, line: &str) {
        self.state.lock().console.push(line.to_string());
    }

    // -- test assertions ---------------------------------------------------

    pub fn clicks(&self) -> Vec<String> {
        self.state.lock().clicks.clone()
    }

    pub fn typed(&self) -> Vec<(String, String)> {
        self.state.lock().typed.clone()
    }

    pub fn selected(&self) -> Vec<(String, String)> {
        self.state.lock().selected.clone()
    }

    pub fn value_of(&self, css: &str) -> Option<String> {
        self.state.lock().values.get(css).cloned()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().navigations.clone()
    }

    pub fn uploads(&self) -> Vec<(String, String, usize)> {
        self.state.lock().uploads.clone()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().snapshot_count
    }

    pub fn screenshots_taken(&self) -> usize {
        self.state.lock().screenshots_taken
    }

    fn apply_removals(state: &mut PageState) {
        let count = state.snapshot_count;
        let due: Vec<String> = state
            .pending_removals
            .iter()
            .filter(|(after, _)| *after <= count)
            .map(|(_, css)| css.clone())
            .collect();
        if !due.is_empty() {
            state.pending_removals.retain(|(after, _)| *after > count);
            state.elements.retain(|el| !due.contains(&el.css_selector));
        }
    }

    fn find(state: &PageState, css: &str) -> Option<RawElement> {
        state
            .elements
            .iter()
            .find(|el| el.css_selector == css)
            .cloned()
    }
}

#[async_trait]
impl PageHandle for FakePage {
    async fn goto(&self, url: &str, _timeout: Duration) -> Result<String> {
        let mut state = self.state.lock();
        if state.unresponsive {
            return Err(ExecutionError::PageUnresponsive("fake page wedged".into()));
        }
        state.url = url.to_string();
        state.navigations.push(url.to_string());
        state.elements = self.site.lookup(url);
        state.snapshot_count = 0;
        Ok(url.to_string())
    }

    async fn url(&self) -> Result<String> {
        Ok(self.state.lock().url.clone())
    }

    async fn content(&self) -> Result<String> {
        let state = self.state.lock();
        let body: String = state
            .elements
            .iter()
            .map(|el| format!("<{tag}>{text}</{tag}>", tag = el.tag, text = el.text))
            .collect();
        Ok(format!("<html><body>{}</body></html>", body))
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        let state = self.state.lock();
        if state.unresponsive {
            return Err(ExecutionError::PageUnresponsive("fake page wedged".into()));
        }
        if let Some(result) = state.eval_results.get(script) {
            return Ok(result.clone());
        }
        if script.trim() == "1 + 1" {
            return Ok(json!(2));
        }
        Ok(Value::Null)
    }

    async fn settle(&self, _timeout: Duration) -> Result<bool> {
        if self.state.lock().unresponsive {
            return Err(ExecutionError::PageUnresponsive("fake page wedged".into()));
        }
        Ok(true)
    }

    async fn snapshot(&self) -> Result<Vec<RawElement>> {
        let mut state = self.state.lock();
        if state.unresponsive {
            return Err(ExecutionError::PageUnresponsive("fake page wedged".into()));
        }
        state.snapshot_count += 1;
        let elements = state.elements.clone();
        Self::apply_removals(&mut state);
        Ok(elements)
    }

    async fn screenshot(&self, _full_page: bool) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.screenshots_taken += 1;
        Ok(format!("FAKEPNG-{}", state.screenshots_taken).into_bytes())
    }

    async fn draw_overlay(&self, _rects: &[Rect]) -> Result<()> {
        Ok(())
    }

    async fn clear_overlay(&self) -> Result<()> {
        Ok(())
    }

    async fn click_selector(&self, css: &str) -> Result<()> {
        let mut state = self.state.lock();
        match Self::find(&state, css) {
            Some(el) if el.visible && el.enabled => {
                state.clicks.push(css.to_string());
                Ok(())
            }
            Some(_) => Err(ExecutionError::ElementNotStable(css.to_string())),
            None => Err(ExecutionError::ElementNotFound(css.to_string())),
        }
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<()> {
        let mut state = self.state.lock();
        let hit = state.elements.iter().find(|el| {
            el.visible
                && x >= el.rect.x
                && x <= el.rect.x + el.rect.width
                && y >= el.rect.y
                && y <= el.rect.y + el.rect.height
        });
        match hit {
            Some(el) => {
                let css = el.css_selector.clone();
                state.clicks.push(css);
                Ok(())
            }
            None => Err(ExecutionError::ElementNotFound(format!(
                "no element at ({}, {})",
                x, y
            ))),
        }
    }

    async fn type_into(&self, css: &str, text: &str, clear_first: bool) -> Result<()> {
        let mut state = self.state.lock();
        match Self::find(&state, css) {
            Some(el) if el.visible && el.enabled => {
                let value = if clear_first {
                    text.to_string()
                } else {
                    let existing = state.values.get(css).cloned().unwrap_or_default();
                    format!("{}{}", existing, text)
                };
                state.values.insert(css.to_string(), value);
                state.typed.push((css.to_string(), text.to_string()));
                Ok(())
            }
            Some(_) => Err(ExecutionError::ElementNotStable(css.to_string())),
            None => Err(ExecutionError::ElementNotFound(css.to_string())),
        }
    }

    async fn select_option(&self, css: &str, option: &str, by: SelectBy) -> Result<bool> {
        let mut state = self.state.lock();
        let el = match Self::find(&state, css) {
            Some(el) => el,
            None => return Err(ExecutionError::ElementNotFound(css.to_string())),
        };
        let hit = el.attributes.iter().find_map(|(key, label)| {
            let value = key.strip_prefix("option:")?;
            let matched = match by {
                SelectBy::Value => value == option,
                SelectBy::Label => label == option,
            };
            matched.then(|| value.to_string())
        });
        match hit {
            Some(value) => {
                state.values.insert(css.to_string(), value.clone());
                state.selected.push((css.to_string(), value));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()> {
        let mut state = self.state.lock();
        state.scroll.0 += dx;
        state.scroll.1 += dy;
        Ok(())
    }

    async fn scroll_position(&self) -> Result<(f64, f64)> {
        Ok(self.state.lock().scroll)
    }

    async fn page_height(&self) -> Result<f64> {
        Ok(720.0)
    }

    async fn wait_for_selector(&self, css: &str, timeout: Duration) -> Result<()> {
        let started = std::time::Instant::now();
        loop {
            if Self::find(&self.state.lock(), css).is_some() {
                return Ok(());
            }
            if started.elapsed() > timeout {
                return Err(ExecutionError::ElementNotFound(css.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn element_state(&self, css: &str) -> Result<Option<ElementState>> {
        let state = self.state.lock();
        if state.unresponsive {
            return Err(ExecutionError::PageUnresponsive("fake page wedged".into()));
        }
        Ok(Self::find(&state, css).map(|el| ElementState {
            visible: el.visible,
            enabled: el.enabled,
        }))
    }

    async fn set_file_input(&self, css: &str, filename: &str, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if Self::find(&state, css).is_none() {
            return Err(ExecutionError::ElementNotFound(css.to_string()));
        }
        state
            .uploads
            .push((css.to_string(), filename.to_string(), bytes.len()));
        Ok(())
    }

    async fn download(&self, css: Option<&str>, url: Option<&str>) -> Result<(String, Vec<u8>)> {
        let state = self.state.lock();
        if let Some(css) = css {
            if Self::find(&state, css).is_none() {
                return Err(ExecutionError::ElementNotFound(css.to_string()));
            }
        } else if url.is_none() {
            return Err(ExecutionError::Validation(
                "download requires an element or a url".into(),
            ));
        }
        Ok(state
            .download_payload
            .clone()
            .unwrap_or_else(|| ("download.bin".to_string(), b"fake-bytes".to_vec())))
    }

    async fn drain_console(&self) -> Result<Vec<String>> {
        Ok(std::mem::take(&mut self.state.lock().console))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct FakeHandle {
    site: FakeSite,
    alive: AtomicBool,
    pages: Mutex<Vec<Arc<FakePage>>>,
}

#[async_trait]
impl DriverHandle for FakeHandle {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ExecutionError::PageUnresponsive("driver is dead".into()));
        }
        let page = Arc::new(FakePage::new(self.site.clone()));
        self.pages.lock().push(page.clone());
        Ok(page)
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn cookies(&self) -> Result<Value> {
        Ok(json!([{ "name": "fake", "value": "1" }]))
    }

    async fn restore_cookies(&self, _cookies: &Value) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl FakeHandle {
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Driver producing [`FakePage`]s backed by a scripted [`FakeSite`].
pub struct FakeDriver {
    site: FakeSite,
    launches: AtomicUsize,
    handles: Mutex<Vec<Arc<FakeHandle>>>,
}

impl FakeDriver {
    pub fn new(site: FakeSite) -> Self {
        Self {
            site,
            launches: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// The most recently created page across all handles.
    pub fn last_page(&self) -> Option<Arc<FakePage>> {
        self.handles
            .lock()
            .iter()
            .rev()
            .find_map(|h| h.pages.lock().last().cloned())
    }

    pub fn last_handle(&self) -> Option<Arc<FakeHandle>> {
        self.handles.lock().last().cloned()
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn launch(&self, _config: &DriverConfig) -> Result<Box<dyn DriverHandle>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(FakeHandle {
            site: self.site.clone(),
            alive: AtomicBool::new(true),
            pages: Mutex::new(Vec::new()),
        });
        self.handles.lock().push(handle.clone());
        Ok(Box::new(SharedHandle(handle)))
    }
}

/// Boxed wrapper so the driver can keep its own reference to every handle.
struct SharedHandle(Arc<FakeHandle>);

#[async_trait]
impl DriverHandle for SharedHandle {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>> {
        self.0.new_page().await
    }

    async fn is_alive(&self) -> bool {
        self.0.is_alive().await
    }

    async fn cookies(&self) -> Result<Value> {
        self.0.cookies().await
    }

    async fn restore_cookies(&self, cookies: &Value) -> Result<()> {
        self.0.restore_cookies(cookies).await
    }

    async fn close(&self) -> Result<()> {
        self.0.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_site() -> FakeSite {
        FakeSite::new().page(
            "https://ex.test/login",
            vec![
                ElementSpec::new("input", "#email").attr("name", "email"),
                ElementSpec::new("input", "#password").attr("type", "password"),
                ElementSpec::new("button", "#submit").text("Sign in"),
            ],
        )
    }

    #[tokio::test]
    async fn navigation_loads_site_elements() {
        let driver = FakeDriver::new(login_site());
        let handle = driver.launch(&DriverConfig::default()).await.unwrap();
        let page = handle.new_page().await.unwrap();
        page.goto("https://ex.test/login", Duration::from_secs(5)).await.unwrap();
        let elements = page.snapshot().await.unwrap();
        assert_eq!(elements.len(), 3);
    }

    #[tokio::test]
    async fn removal_fires_after_the_scheduled_snapshot() {
        let driver = FakeDriver::new(login_site());
        let handle = driver.launch(&DriverConfig::default()).await.unwrap();
        let _ = handle.new_page().await.unwrap();
        let page = driver.last_page().unwrap();
        page.goto("https://ex.test/login", Duration::from_secs(5)).await.unwrap();
        page.remove_after_snapshot("#submit", 1);

        let first = page.snapshot().await.unwrap();
        assert!(first.iter().any(|el| el.css_selector == "#submit"));
        // Element is gone for any later interaction.
        let err = page.click_selector("#submit").await.unwrap_err();
        assert_eq!(err.code(), "ELEMENT_NOT_FOUND");
        let second = page.snapshot().await.unwrap();
        assert!(!second.iter().any(|el| el.css_selector == "#submit"));
    }

    #[tokio::test]
    async fn typing_requires_enabled_visible_element() {
        let site = FakeSite::new().page(
            "https://ex.test",
            vec![ElementSpec::new("input", "#frozen").disabled()],
        );
        let driver = FakeDriver::new(site);
        let handle = driver.launch(&DriverConfig::default()).await.unwrap();
        let page = handle.new_page().await.unwrap();
        page.goto("https://ex.test", Duration::from_secs(5)).await.unwrap();
        let err = page.type_into("#frozen", "x", true).await.unwrap_err();
        assert_eq!(err.code(), "ELEMENT_NOT_STABLE");
    }

    #[tokio::test]
    async fn select_matches_value_then_label() {
        let site = FakeSite::new().page(
            "https://ex.test",
            vec![ElementSpec::new("select", "#country")
                .option("us", "United States")
                .option("fr", "France")],
        );
        let driver = FakeDriver::new(site);
        let handle = driver.launch(&DriverConfig::default()).await.unwrap();
        let page = handle.new_page().await.unwrap();
        page.goto("https://ex.test", Duration::from_secs(5)).await.unwrap();
        assert!(page.select_option("#country", "fr", SelectBy::Value).await.unwrap());
        assert!(page
            .select_option("#country", "United States", SelectBy::Label)
            .await
            .unwrap());
        assert!(!page.select_option("#country", "mars", SelectBy::Value).await.unwrap());
    }
}
