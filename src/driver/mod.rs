//! Browser driver capability.
//!
//! The core consumes a driver through these traits; the production
//! implementation speaks CDP via chromiumoxide, and the synthetic driver
//! backs the test suite. Drivers are single-threaded per page: callers must
//! serialize operations on the same page, which the session manager's
//! per-session lock guarantees.

pub mod chromium;
pub mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

pub use chromium::ChromiumDriver;
pub use fake::{FakeDriver, FakePage, FakeSite};

/// Launch-time configuration for a browser instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub headless: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloads_dir: Option<PathBuf>,
    pub viewport_width: u32,
    pub viewport_height: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            headless: true,
            proxy: None,
            downloads_dir: None,
            viewport_width: 1280,
            viewport_height: 720,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn area(&self) -> f64 {
        self.width * self.height
    }
}

/// One element as enumerated by the driver's DOM walk, before the scraper
/// classifies it. `has_click_listener` is false when the event map is
/// unavailable (CSP-rejected injection, cross-origin frame).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawElement {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<usize>,
    pub tag: String,
    pub text: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub rect: Rect,
    pub visible: bool,
    pub enabled: bool,
    #[serde(default)]
    pub has_click_listener: bool,
    #[serde(default)]
    pub hover_affects_style: bool,
    /// Driver-computed unique CSS selector for this element.
    pub css_selector: String,
    /// Position in the document: child ordinals from the root.
    pub ordinal_path: Vec<u32>,
    /// False for elements enumerated inside a cross-origin frame.
    #[serde(default = "default_true")]
    pub same_origin_frame: bool,
}

fn default_true() -> bool {
    true
}

/// Liveness of a resolved element, polled by the executor's stability check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementState {
    pub visible: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectBy {
    Value,
    Label,
}

/// Launches browser instances.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, config: &DriverConfig) -> Result<Box<dyn DriverHandle>>;
}

/// A live browser instance.
#[async_trait]
pub trait DriverHandle: Send + Sync {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>>;
    async fn is_alive(&self) -> bool;
    /// Cookie snapshot for persistent-session records.
    async fn cookies(&self) -> Result<Value>;
    async fn restore_cookies(&self, cookies: &Value) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// A live page. All mutating calls must be externally serialized.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Navigate and return the final url after redirects.
    async fn goto(&self, url: &str, timeout: Duration) -> Result<String>;
    async fn url(&self) -> Result<String>;
    async fn content(&self) -> Result<String>;
    async fn evaluate(&self, script: &str) -> Result<Value>;
    /// Wait until the page looks settled (network idle or a quiet window
    /// after the last DOM mutation). Returns false when the bound elapsed
    /// first; callers proceed anyway.
    async fn settle(&self, timeout: Duration) -> Result<bool>;
    /// Enumerate the document (and same-origin subframes).
    async fn snapshot(&self) -> Result<Vec<RawElement>>;
    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>>;
    /// Transient bounding-box overlay drawn before split screenshots.
    async fn draw_overlay(&self, rects: &[Rect]) -> Result<()>;
    async fn clear_overlay(&self) -> Result<()>;
    async fn click_selector(&self, css: &str) -> Result<()>;
    async fn click_at(&self, x: f64, y: f64) -> Result<()>;
    async fn type_into(&self, css: &str, text: &str, clear_first: bool) -> Result<()>;
    /// Returns true when an option matched by the given strategy.
    async fn select_option(&self, css: &str, option: &str, by: SelectBy) -> Result<bool>;
    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()>;
    async fn scroll_position(&self) -> Result<(f64, f64)>;
    async fn page_height(&self) -> Result<f64>;
    async fn wait_for_selector(&self, css: &str, timeout: Duration) -> Result<()>;
    /// `None` when the selector matches nothing (detached element).
    async fn element_state(&self, css: &str) -> Result<Option<ElementState>>;
    async fn set_file_input(&self, css: &str, filename: &str, bytes: &[u8]) -> Result<()>;
    /// Download by clicking an element or fetching a url directly; returns
    /// the filename and bytes.
    async fn download(&self, css: Option<&str>, url: Option<&str>) -> Result<(String, Vec<u8>)>;
    /// Drain console messages accumulated since the last call.
    async fn drain_console(&self) -> Result<Vec<String>>;
    async fn close(&self) -> Result<()>;
}
