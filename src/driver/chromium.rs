//! CDP-backed driver implementation over chromiumoxide.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser as ChromeBrowser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, GetCookiesParams, SetCookiesParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat,
};
use chromiumoxide::cdp::js_protocol::runtime::EventConsoleApiCalled;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    BrowserDriver, DriverConfig, DriverHandle, ElementState, PageHandle, RawElement, Rect,
    SelectBy,
};
use crate::error::{ExecutionError, Result};

fn cdp_err(context: &str, e: impl std::fmt::Display) -> ExecutionError {
    ExecutionError::PageUnresponsive(format!("{}: {}", context, e))
}

/// Instrumentation installed before any document script runs, so the DOM
/// walk can see explicitly registered click listeners.
const LISTENER_INSTRUMENTATION: &str = r##"
(() => {
    const original = EventTarget.prototype.addEventListener;
    EventTarget.prototype.addEventListener = function (type, listener, options) {
        if (type === 'click') {
            try { this.__stratusClickListener = true; } catch (e) {}
        }
        return original.call(this, type, listener, options);
    };
})();
"##;

/// DOM walk injected at scrape time. Enumerates the document and every
/// same-origin subframe; cross-origin frames surface as their host iframe
/// element only.
const DOM_WALK: &str = r##"
(() => {
    const records = [];
    const hoverProps = ['background', 'background-color', 'color', 'border',
                        'transform', 'box-shadow', 'opacity'];

    function hoverSelectors(doc) {
        const out = [];
        for (const sheet of doc.styleSheets) {
            let rules;
            try { rules = sheet.cssRules; } catch (e) { continue; }
            if (!rules) continue;
            for (const rule of rules) {
                if (!rule.selectorText || rule.selectorText.indexOf(':hover') === -1) continue;
                let touches = false;
                for (const prop of hoverProps) {
                    if (rule.style && rule.style.getPropertyValue(prop)) { touches = true; break; }
                }
                if (!touches) continue;
                for (const part of rule.selectorText.split(',')) {
                    if (part.indexOf(':hover') !== -1) {
                        out.push(part.replace(/:hover/g, '').trim());
                    }
                }
            }
        }
        return out;
    }

    function cssPath(el) {
        if (el.id) return '#' + CSS.escape(el.id);
        const parts = [];
        let node = el;
        while (node && node.nodeType === 1 && node.tagName.toLowerCase() !== 'html') {
            let ordinal = 1;
            let sib = node.previousElementSibling;
            while (sib) { ordinal += 1; sib = sib.previousElementSibling; }
            parts.unshift(node.tagName.toLowerCase() + ':nth-child(' + ordinal + ')');
            node = node.parentElement;
        }
        return 'html > ' + parts.join(' > ');
    }

    function ordinalPath(el) {
        const path = [];
        let node = el;
        while (node && node.parentElement) {
            let ordinal = 0;
            let sib = node.previousElementSibling;
            while (sib) { ordinal += 1; sib = sib.previousElementSibling; }
            path.unshift(ordinal);
            node = node.parentElement;
        }
        return path;
    }

    function walk(doc, sameOrigin) {
        let hovered = [];
        try { hovered = hoverSelectors(doc); } catch (e) {}
        const all = Array.from(doc.querySelectorAll('*'));
        const indexOf = new Map();
        all.forEach((el, i) => indexOf.set(el, records.length + i));

        for (const el of all) {
            const rect = el.getBoundingClientRect();
            const style = doc.defaultView ? doc.defaultView.getComputedStyle(el) : null;
            const visible = rect.width > 0 && rect.height > 0 &&
                (!style || (style.visibility !== 'hidden' && style.display !== 'none'));
            const attrs = {};
            for (const a of el.attributes) { attrs[a.name] = a.value; }
            let hoverHit = false;
            for (const sel of hovered) {
                try { if (el.matches(sel)) { hoverHit = true; break; } } catch (e) {}
            }
            records.push({
                index: records.length,
                parent: el.parentElement && indexOf.has(el.parentElement)
                    ? indexOf.get(el.parentElement) : null,
                tag: el.tagName.toLowerCase(),
                text: (el.innerText || el.textContent || '').trim().slice(0, 400),
                attributes: attrs,
                rect: { x: rect.x, y: rect.y, width: rect.width, height: rect.height },
                visible: visible,
                enabled: !el.disabled && !el.hasAttribute('disabled'),
                has_click_listener: el.__stratusClickListener === true ||
                    el.onclick != null || el.hasAttribute('onclick'),
                hover_affects_style: hoverHit,
                css_selector: cssPath(el),
                ordinal_path: ordinalPath(el),
                same_origin_frame: sameOrigin,
            });
            if (el.tagName.toLowerCase() === 'iframe') {
                try {
                    if (el.contentDocument) { walk(el.contentDocument, true); }
                } catch (e) {
                    records[records.length - 1].same_origin_frame = false;
                }
            }
        }
    }

    walk(document, true);
    return records;
})()
"##;

/// Driver launching real Chrome instances through CDP.
#[derive(Debug, Default)]
pub struct ChromiumDriver;

impl ChromiumDriver {
    pub fn new() -> Self {
        Self
    }

    fn build_config(config: &DriverConfig) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-background-timer-throttling")
            .arg("--disable-backgrounding-occluded-windows")
            .arg("--disable-renderer-backgrounding")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-blink-features=AutomationControlled")
            .window_size(config.viewport_width, config.viewport_height);
        if config.headless {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }
        if let Some(proxy) = &config.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy));
        }
        builder
            .build()
            .map_err(|e| ExecutionError::Internal(format!("browser config: {}", e)))
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self, config: &DriverConfig) -> Result<Box<dyn DriverHandle>> {
        info!(headless = config.headless, "launching Chrome via CDP");
        let browser_config = Self::build_config(config)?;
        let (browser, mut handler) = ChromeBrowser::launch(browser_config)
            .await
            .map_err(|e| ExecutionError::Internal(format!("failed to launch Chrome: {}", e)))?;

        // Pump CDP events until the browser goes away. Connection resets are
        // non-fatal noise.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    let msg = e.to_string();
                    if msg.contains("Browser closed") || msg.contains("Process exited") {
                        warn!("browser handler terminated: {}", msg);
                        break;
                    }
                    debug!("browser handler event error (non-fatal): {}", msg);
                }
            }
        });

        Ok(Box::new(ChromiumHandle {
            browser: Arc::new(Mutex::new(browser)),
        }))
    }
}

pub struct ChromiumHandle {
    browser: Arc<Mutex<ChromeBrowser>>,
}

#[async_trait]
impl DriverHandle for ChromiumHandle {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>> {
        let browser = self.browser.lock().await;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| cdp_err("new_page", e))?;
        // Install the listener shim before any document script runs. On
        // refusal, listener-based interactability is absent for this page.
        match AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(LISTENER_INSTRUMENTATION)
            .build()
        {
            Ok(params) => {
                if let Err(e) = page.execute(params).await {
                    warn!("listener instrumentation rejected: {}", e);
                }
            }
            Err(e) => warn!("listener instrumentation params: {}", e),
        }
        let console: Arc<parking_lot::Mutex<Vec<String>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        if let Ok(mut events) = page.event_listener::<EventConsoleApiCalled>().await {
            let sink = console.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    let line = event
                        .args
                        .iter()
                        .filter_map(|a| a.value.as_ref().map(|v| v.to_string()))
                        .collect::<Vec<_>>()
                        .join(" ");
                    sink.lock().push(format!("[{:?}] {}", event.r#type, line));
                }
            });
        }
        Ok(Arc::new(ChromiumPage { page, console }))
    }

    async fn is_alive(&self) -> bool {
        let browser = self.browser.lock().await;
        browser.version().await.is_ok()
    }

    async fn cookies(&self) -> Result<Value> {
        let browser = self.browser.lock().await;
        let page = match browser.pages().await {
            Ok(pages) => match pages.into_iter().next() {
                Some(p) => p,
                None => return Ok(Value::Array(vec![])),
            },
            Err(e) => return Err(cdp_err("pages", e)),
        };
        let response = page
            .execute(GetCookiesParams::default())
            .await
            .map_err(|e| cdp_err("get_cookies", e))?;
        serde_json::to_value(&response.result.cookies)
            .map_err(|e| ExecutionError::Internal(format!("cookie serialization: {}", e)))
    }

    async fn restore_cookies(&self, cookies: &Value) -> Result<()> {
        let entries = match cookies.as_array() {
            Some(entries) => entries,
            None => return Ok(()),
        };
        let browser = self.browser.lock().await;
        let page = browser
            .pages()
            .await
            .map_err(|e| cdp_err("pages", e))?
            .into_iter()
            .next()
            .ok_or_else(|| ExecutionError::PageUnresponsive("no page for cookies".into()))?;
        let mut params: Vec<CookieParam> = Vec::with_capacity(entries.len());
        for entry in entries {
            let (name, value) = match (entry["name"].as_str(), entry["value"].as_str()) {
                (Some(n), Some(v)) => (n, v),
                _ => continue,
            };
            let mut builder = CookieParam::builder().name(name).value(value);
            if let Some(domain) = entry["domain"].as_str() {
                builder = builder.domain(domain);
            }
            if let Some(path) = entry["path"].as_str() {
                builder = builder.path(path);
            }
            params.push(
                builder
                    .build()
                    .map_err(|e| ExecutionError::Internal(format!("cookie param: {}", e)))?,
            );
        }
        if !params.is_empty() {
            page.execute(SetCookiesParams::new(params))
                .await
                .map_err(|e| cdp_err("set_cookies", e))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut browser = self.browser.lock().await;
        browser.close().await.map_err(|e| cdp_err("close", e))?;
        Ok(())
    }
}

pub struct ChromiumPage {
    page: Page,
    console: Arc<parking_lot::Mutex<Vec<String>>>,
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<String> {
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("https://{}", url)
        };
        match tokio::time::timeout(timeout, self.page.goto(url.as_str())).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(cdp_err("goto", e)),
            Err(_) => return Err(ExecutionError::Timeout),
        }
        // Best effort: the load event may already have fired.
        let _ = tokio::time::timeout(timeout, self.page.wait_for_navigation()).await;
        self.url().await
    }

    async fn url(&self) -> Result<String> {
        let url = self.page.url().await.map_err(|e| cdp_err("url", e))?;
        Ok(url.unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn content(&self) -> Result<String> {
        self.page.content().await.map_err(|e| cdp_err("content", e))
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| cdp_err("evaluate", e))?;
        result
            .into_value()
            .map_err(|e| ExecutionError::Internal(format!("evaluate result: {}", e)))
    }

    async fn settle(&self, timeout: Duration) -> Result<bool> {
        const PROBE: &str =
            "document.readyState === 'complete' ? document.getElementsByTagName('*').length : -1";
        let started = std::time::Instant::now();
        let mut last_count: i64 = -1;
        let mut quiet_since = std::time::Instant::now();
        while started.elapsed() < timeout {
            let count = self
                .evaluate(PROBE)
                .await
                .ok()
                .and_then(|v| v.as_i64())
                .unwrap_or(-1);
            if count >= 0 && count == last_count {
                if quiet_since.elapsed() >= Duration::from_secs(1) {
                    return Ok(true);
                }
            } else {
                last_count = count;
                quiet_since = std::time::Instant::now();
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Ok(false)
    }

    async fn snapshot(&self) -> Result<Vec<RawElement>> {
        let value = self.evaluate(DOM_WALK).await?;
        serde_json::from_value(value)
            .map_err(|e| ExecutionError::PageUnresponsive(format!("dom walk parse: {}", e)))
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>> {
        self.page
            .screenshot(
                ScreenshotParams::builder()
                    .full_page(full_page)
                    .format(CaptureScreenshotFormat::Png)
                    .build(),
            )
            .await
            .map_err(|e| cdp_err("screenshot", e))
    }

    async fn draw_overlay(&self, rects: &[Rect]) -> Result<()> {
        let boxes = serde_json::to_string(rects)
            .map_err(|e| ExecutionError::Internal(e.to_string()))?;
        let script = format!(
            r##"
            (() => {{
                const boxes = {boxes};
                for (const b of boxes) {{
                    const div = document.createElement('div');
                    div.className = '__stratus_overlay';
                    div.style.cssText = 'position:absolute;border:2px solid #ff2d78;' +
                        'z-index:2147483647;pointer-events:none;' +
                        'left:' + b.x + 'px;top:' + b.y + 'px;' +
                        'width:' + b.width + 'px;height:' + b.height + 'px;';
                    document.body.appendChild(div);
                }}
            }})()
            "##
        );
        self.evaluate(&script).await.map(|_| ())
    }

    async fn clear_overlay(&self) -> Result<()> {
        self.evaluate(
            "document.querySelectorAll('.__stratus_overlay').forEach(el => el.remove())",
        )
        .await
        .map(|_| ())
    }

    async fn click_selector(&self, css: &str) -> Result<()> {
        let element = self
            .page
            .find_element(css)
            .await
            .map_err(|e| ExecutionError::ElementNotFound(format!("{}: {}", css, e)))?;
        element
            .click()
            .await
            .map_err(|e| cdp_err("click", e))?;
        Ok(())
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<()> {
        let script = format!(
            "(() => {{ const el = document.elementFromPoint({x}, {y}); \
             if (!el) return false; \
             el.dispatchEvent(new MouseEvent('click', {{bubbles: true, cancelable: true, \
             clientX: {x}, clientY: {y}}})); return true; }})()"
        );
        match self.evaluate(&script).await?.as_bool() {
            Some(true) => Ok(()),
            _ => Err(ExecutionError::ElementNotFound(format!(
                "no element at ({}, {})",
                x, y
            ))),
        }
    }

    async fn type_into(&self, css: &str, text: &str, clear_first: bool) -> Result<()> {
        let element = self
            .page
            .find_element(css)
            .await
            .map_err(|e| ExecutionError::ElementNotFound(format!("{}: {}", css, e)))?;
        element.click().await.map_err(|e| cdp_err("focus", e))?;
        if clear_first {
            let script = format!(
                "(() => {{ const el = document.querySelector({}); if (el) el.value = ''; }})()",
                serde_json::to_string(css).unwrap_or_default()
            );
            let _ = self.evaluate(&script).await;
        }
        element
            .type_str(text)
            .await
            .map_err(|e| cdp_err("type", e))?;
        Ok(())
    }

    async fn select_option(&self, css: &str, option: &str, by: SelectBy) -> Result<bool> {
        let matcher = match by {
            SelectBy::Value => "o.value === wanted",
            SelectBy::Label => "o.label === wanted || o.text === wanted",
        };
        let script = format!(
            r##"
            (() => {{
                const el = document.querySelector({css});
                if (!el || el.tagName.toLowerCase() !== 'select') return null;
                const wanted = {option};
                for (const o of el.options) {{
                    if ({matcher}) {{
                        el.value = o.value;
                        el.dispatchEvent(new Event('change', {{bubbles: true}}));
                        return true;
                    }}
                }}
                return false;
            }})()
            "##,
            css = serde_json::to_string(css).unwrap_or_default(),
            option = serde_json::to_string(option).unwrap_or_default(),
        );
        match self.evaluate(&script).await? {
            Value::Bool(hit) => Ok(hit),
            Value::Null => Err(ExecutionError::ElementNotFound(css.to_string())),
            other => Err(ExecutionError::Internal(format!(
                "unexpected select result: {}",
                other
            ))),
        }
    }

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()> {
        self.evaluate(&format!("window.scrollBy({}, {})", dx, dy))
            .await
            .map(|_| ())
    }

    async fn scroll_position(&self) -> Result<(f64, f64)> {
        let value = self
            .evaluate("({x: window.scrollX, y: window.scrollY})")
            .await?;
        Ok((
            value["x"].as_f64().unwrap_or(0.0),
            value["y"].as_f64().unwrap_or(0.0),
        ))
    }

    async fn page_height(&self) -> Result<f64> {
        let value = self.evaluate("document.body.scrollHeight").await?;
        Ok(value.as_f64().unwrap_or(0.0))
    }

    async fn wait_for_selector(&self, css: &str, timeout: Duration) -> Result<()> {
        let started = std::time::Instant::now();
        loop {
            if self.page.find_element(css).await.is_ok() {
                return Ok(());
            }
            if started.elapsed() > timeout {
                return Err(ExecutionError::ElementNotFound(format!(
                    "timed out waiting for {}",
                    css
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn element_state(&self, css: &str) -> Result<Option<ElementState>> {
        let script = format!(
            r##"
            (() => {{
                const el = document.querySelector({css});
                if (!el) return null;
                const rect = el.getBoundingClientRect();
                const style = window.getComputedStyle(el);
                return {{
                    visible: rect.width > 0 && rect.height > 0 &&
                        style.visibility !== 'hidden' && style.display !== 'none',
                    enabled: !el.disabled && !el.hasAttribute('disabled')
                }};
            }})()
            "##,
            css = serde_json::to_string(css).unwrap_or_default()
        );
        let value = self.evaluate(&script).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ExecutionError::Internal(format!("element state: {}", e)))
    }

    async fn set_file_input(&self, css: &str, filename: &str, bytes: &[u8]) -> Result<()> {
        let element = self
            .page
            .find_element(css)
            .await
            .map_err(|e| ExecutionError::ElementNotFound(format!("{}: {}", css, e)))?;
        let dir = std::env::temp_dir().join("stratus-uploads");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ExecutionError::Internal(format!("upload staging: {}", e)))?;
        let path = dir.join(filename);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ExecutionError::Internal(format!("upload staging: {}", e)))?;
        let params = SetFileInputFilesParams {
            files: vec![path.to_string_lossy().into_owned()],
            node_id: None,
            backend_node_id: Some(element.backend_node_id),
            object_id: None,
        };
        self.page
            .execute(params)
            .await
            .map_err(|e| cdp_err("set_file_input", e))?;
        Ok(())
    }

    async fn download(&self, css: Option<&str>, url: Option<&str>) -> Result<(String, Vec<u8>)> {
        if let Some(url) = url {
            // Direct fetch path for explicit download urls.
            let response = reqwest::get(url)
                .await
                .map_err(|e| ExecutionError::HttpRequest(e.to_string()))?;
            let filename = response
                .url()
                .path_segments()
                .and_then(|mut s| s.next_back())
                .filter(|s| !s.is_empty())
                .unwrap_or("download.bin")
                .to_string();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ExecutionError::HttpRequest(e.to_string()))?;
            return Ok((filename, bytes.to_vec()));
        }
        if let Some(css) = css {
            // Element path: prefer the href when present, else click and let
            // the browser handle it (bytes are not observable over CDP here).
            let script = format!(
                "(() => {{ const el = document.querySelector({}); \
                 return el && el.href ? el.href : null; }})()",
                serde_json::to_string(css).unwrap_or_default()
            );
            if let Some(href) = self.evaluate(&script).await?.as_str() {
                let href = href.to_string();
                return Box::pin(self.download(None, Some(&href))).await;
            }
            self.click_selector(css).await?;
            return Err(ExecutionError::Internal(
                "download triggered by click has no observable bytes".into(),
            ));
        }
        Err(ExecutionError::Validation(
            "download requires an element or a url".into(),
        ))
    }

    async fn drain_console(&self) -> Result<Vec<String>> {
        Ok(std::mem::take(&mut *self.console.lock()))
    }

    async fn close(&self) -> Result<()> {
        self.page.clone().close().await.map_err(|e| cdp_err("close", e))?;
        Ok(())
    }
}
