//! Page scraping: turn a live page into an oracle-consumable snapshot.
//!
//! A scrape waits for the page to settle, enumerates the DOM through the
//! driver, classifies interactable elements by a closed rule set, assigns
//! stable element ids and position-independent content hashes, projects a
//! pruned element tree, and captures screenshots.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::driver::{PageHandle, RawElement, Rect};
use crate::error::Result;

/// Tags interactable by themselves when they have a non-empty bounding box.
const INTERACTABLE_TAGS: [&str; 5] = ["input", "button", "select", "textarea", "a"];

/// ARIA roles that imply interactability.
const INTERACTABLE_ROLES: [&str; 8] = [
    "button", "link", "menuitem", "checkbox", "radio", "tab", "option", "switch",
];

/// Attributes that participate in the content hash. Chosen to be stable
/// under reordering and restyling.
const HASHED_ATTRIBUTES: [&str; 8] = [
    "name", "type", "placeholder", "aria-label", "href", "title", "alt", "role",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeOptions {
    /// Upper bound on the settle wait; scraping proceeds on expiry.
    pub page_ready_timeout: Duration,
    pub split_screenshots: bool,
    pub max_screenshots: usize,
    /// 20% viewport overlap between split screenshots.
    pub overlap: bool,
    pub draw_bounding_boxes: bool,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            page_ready_timeout: Duration::from_secs(30),
            split_screenshots: false,
            max_screenshots: 5,
            overlap: true,
            draw_bounding_boxes: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedElement {
    pub element_id: String,
    pub tag: String,
    pub text: String,
    pub attributes: HashMap<String, String>,
    pub rect: Rect,
    pub css_selector: String,
    pub content_hash: String,
    pub interactable: bool,
}

/// Pruned hierarchical projection: interactable elements and their
/// ancestor chains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementNode {
    pub element_id: String,
    pub tag: String,
    pub text: String,
    pub interactable: bool,
    pub children: Vec<ElementNode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub url: String,
    pub html: String,
    /// Interactable elements only, in document order.
    pub elements: Vec<ScrapedElement>,
    pub element_tree: Vec<ElementNode>,
    pub id_to_css: HashMap<String, String>,
    pub id_to_hash: HashMap<String, String>,
    pub extracted_text: String,
    #[serde(skip)]
    pub screenshots: Vec<Vec<u8>>,
}

impl ScrapedPage {
    pub fn resolve_css(&self, element_ref: &str) -> Option<&str> {
        self.id_to_css.get(element_ref).map(String::as_str)
    }

    /// Element uniquely identified by a content hash; `None` when the hash
    /// is absent or ambiguous.
    pub fn find_unique_by_hash(&self, hash: &str) -> Option<&ScrapedElement> {
        let mut matches = self
            .elements
            .iter()
            .filter(|el| el.content_hash == hash);
        match (matches.next(), matches.next()) {
            (Some(el), None) => Some(el),
            _ => None,
        }
    }
}

/// Position-independent content hash: tag, normalized text, stable
/// attributes.
pub fn content_hash(raw: &RawElement) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.tag.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(raw.text.split_whitespace().collect::<Vec<_>>().join(" "));
    for key in HASHED_ATTRIBUTES {
        if let Some(value) = raw.attributes.get(key) {
            hasher.update(b"\x1f");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Stable element id: tag, ordinal path, short content hash.
fn element_id(raw: &RawElement, hash: &str) -> String {
    let path: Vec<String> = raw.ordinal_path.iter().map(|p| p.to_string()).collect();
    format!("{}-{}-{}", raw.tag, path.join("."), &hash[..8])
}

fn is_interactable(raw: &RawElement) -> bool {
    if !raw.visible || raw.rect.area() <= 0.0 {
        return false;
    }
    // (a) inherently interactable tag with a non-empty box
    if INTERACTABLE_TAGS.contains(&raw.tag.as_str()) {
        return true;
    }
    // (b) explicit click listener reachable from the event map
    if raw.has_click_listener {
        return true;
    }
    // (c) :hover rule changing a visual property
    if raw.hover_affects_style {
        return true;
    }
    // (d) interactable ARIA role
    if let Some(role) = raw.attributes.get("role") {
        if INTERACTABLE_ROLES.contains(&role.as_str()) {
            return true;
        }
    }
    false
}

pub struct PageScraper;

impl PageScraper {
    /// Produce a [`ScrapedPage`] snapshot of the current page.
    pub async fn scrape(page: &Arc<dyn PageHandle>, options: &ScrapeOptions) -> Result<ScrapedPage> {
        let settled = page.settle(options.page_ready_timeout).await?;
        if !settled {
            debug!("page did not settle within bound, scraping anyway");
        }

        let raw = page.snapshot().await?;
        let url = page.url().await?;
        let html = page.content().await.unwrap_or_default();

        // Classify and index.
        let mut scraped: Vec<ScrapedElement> = Vec::new();
        let mut interactable_flags = vec![false; raw.len()];
        let mut all: Vec<ScrapedElement> = Vec::with_capacity(raw.len());
        for (i, el) in raw.iter().enumerate() {
            let hash = content_hash(el);
            let id = element_id(el, &hash);
            let interactable = is_interactable(el);
            interactable_flags[i] = interactable;
            let entry = ScrapedElement {
                element_id: id,
                tag: el.tag.clone(),
                text: el.text.clone(),
                attributes: el.attributes.clone(),
                rect: el.rect,
                css_selector: el.css_selector.clone(),
                content_hash: hash,
                interactable,
            };
            if interactable {
                scraped.push(entry.clone());
            }
            all.push(entry);
        }

        let element_tree = build_tree(&raw, &all, &interactable_flags);
        let extracted_text = visible_text(&element_tree);

        let mut id_to_css = HashMap::new();
        let mut id_to_hash = HashMap::new();
        for el in &scraped {
            id_to_css.insert(el.element_id.clone(), el.css_selector.clone());
            id_to_hash.insert(el.element_id.clone(), el.content_hash.clone());
        }

        let screenshots = capture_screenshots(page, options, &scraped).await;

        Ok(ScrapedPage {
            url,
            html,
            elements: scraped,
            element_tree,
            id_to_css,
            id_to_hash,
            extracted_text,
            screenshots,
        })
    }
}

/// Keep a node when it is interactable or carries an interactable
/// descendant; that preserves the labeling ancestor chain.
fn build_tree(
    raw: &[RawElement],
    all: &[ScrapedElement],
    interactable: &[bool],
) -> Vec<ElementNode> {
    let n = raw.len();
    let mut keep = interactable.to_vec();
    // Propagate keep upward. Walks indices in reverse since parents always
    // precede children in document order.
    for i in (0..n).rev() {
        if keep[i] {
            let mut parent = raw[i].parent;
            while let Some(p) = parent {
                if p >= n || keep[p] {
                    break;
                }
                keep[p] = true;
                parent = raw[p].parent;
            }
        }
    }

    let mut children_of: HashMap<Option<usize>, Vec<usize>> = HashMap::new();
    for i in 0..n {
        if keep[i] {
            // Nearest kept ancestor becomes the parent.
            let mut parent = raw[i].parent;
            while let Some(p) = parent {
                if p < n && keep[p] {
                    break;
                }
                parent = raw.get(p).and_then(|r| r.parent);
            }
            children_of.entry(parent).or_default().push(i);
        }
    }

    fn build(
        index: usize,
        all: &[ScrapedElement],
        interactable: &[bool],
        children_of: &HashMap<Option<usize>, Vec<usize>>,
    ) -> ElementNode {
        let el = &all[index];
        let children = children_of
            .get(&Some(index))
            .map(|kids| {
                kids.iter()
                    .map(|&k| build(k, all, interactable, children_of))
                    .collect()
            })
            .unwrap_or_default();
        ElementNode {
            element_id: el.element_id.clone(),
            tag: el.tag.clone(),
            text: el.text.clone(),
            interactable: interactable[index],
            children,
        }
    }

    children_of
        .get(&None)
        .map(|roots| {
            roots
                .iter()
                .map(|&r| build(r, all, interactable, &children_of))
                .collect()
        })
        .unwrap_or_default()
}

fn visible_text(tree: &[ElementNode]) -> String {
    fn collect(node: &ElementNode, out: &mut Vec<String>) {
        if !node.text.is_empty() {
            out.push(node.text.clone());
        }
        for child in &node.children {
            collect(child, out);
        }
    }
    let mut out = Vec::new();
    for node in tree {
        collect(node, &mut out);
    }
    out.dedup();
    out.join("\n")
}

async fn capture_screenshots(
    page: &Arc<dyn PageHandle>,
    options: &ScrapeOptions,
    elements: &[ScrapedElement],
) -> Vec<Vec<u8>> {
    let mut shots = Vec::new();
    if !options.split_screenshots {
        match screenshot_with_overlay(page, options, elements, false).await {
            Ok(bytes) => shots.push(bytes),
            Err(e) => warn!("screenshot failed: {}", e),
        }
        return shots;
    }

    let viewport = 720.0;
    let stride = if options.overlap { viewport * 0.8 } else { viewport };
    let height = page.page_height().await.unwrap_or(viewport);
    let mut offset = 0.0;
    while shots.len() < options.max_screenshots {
        match screenshot_with_overlay(page, options, elements, false).await {
            Ok(bytes) => shots.push(bytes),
            Err(e) => {
                warn!("split screenshot failed: {}", e);
                break;
            }
        }
        offset += stride;
        if offset >= height {
            break;
        }
        if page.scroll_by(0.0, stride).await.is_err() {
            break;
        }
    }
    // Return to the top so later actions see the original viewport.
    let _ = page.scroll_by(0.0, -offset).await;
    shots
}

async fn screenshot_with_overlay(
    page: &Arc<dyn PageHandle>,
    options: &ScrapeOptions,
    elements: &[ScrapedElement],
    full_page: bool,
) -> Result<Vec<u8>> {
    if options.draw_bounding_boxes && !elements.is_empty() {
        let rects: Vec<Rect> = elements.iter().map(|el| el.rect).collect();
        let _ = page.draw_overlay(&rects).await;
    }
    let result = page.screenshot(full_page).await;
    if options.draw_bounding_boxes {
        let _ = page.clear_overlay().await;
    }
    result
}
