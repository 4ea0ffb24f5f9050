//! Decision cache: replay prior oracle decisions on matching pages.
//!
//! Keyed by `(url_pattern, navigation_goal, step_order)`. A hit requires
//! every non-terminal action's content hash to uniquely match an element in
//! the current scrape; matched actions are personalized with the fresh
//! element ids. Reads are cheap and concurrent-safe; writes happen only on
//! task terminal success and are idempotent.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::scrape::ScrapedPage;
use crate::types::Action;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub url_pattern: String,
    pub navigation_goal: String,
    pub step_order: u32,
}

struct CachedEntry {
    actions: Vec<Action>,
    recorded: Instant,
}

pub struct DecisionCache {
    entries: Mutex<LruCache<CacheKey, CachedEntry>>,
    ttl: Duration,
}

impl DecisionCache {
    /// Default TTL is 24 hours; entries also die on hash mismatch.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Replayable actions for this key, personalized against the current
    /// scrape. Any mismatch evicts the entry and reports a miss.
    pub fn lookup(&self, key: &CacheKey, scrape: &ScrapedPage) -> Option<Vec<Action>> {
        let mut entries = self.entries.lock();
        let entry = entries.get(key)?;
        if entry.recorded.elapsed() > self.ttl {
            entries.pop(key);
            return None;
        }

        let mut personalized = Vec::with_capacity(entry.actions.len());
        for action in &entry.actions {
            let mut action = action.clone();
            if action.is_terminal() || action.element_ref().is_none() {
                personalized.push(action);
                continue;
            }
            let hash = match &action.meta().element_content_hash {
                Some(hash) => hash.clone(),
                None => {
                    entries.pop(key);
                    return None;
                }
            };
            match scrape.find_unique_by_hash(&hash) {
                Some(element) => {
                    action.set_element_ref(element.element_id.clone());
                    personalized.push(action);
                }
                None => {
                    debug!(?key, "cache entry no longer matches page, evicting");
                    entries.pop(key);
                    return None;
                }
            }
        }
        Some(personalized)
    }

    /// Record a step's executed actions. Rejected when any kind is outside
    /// the cacheable set, when a non-terminal action lacks a hash, or when
    /// the decision only ends the task (completion stays an oracle
    /// judgment). Idempotent: the first write for a key wins.
    pub fn record(&self, key: CacheKey, actions: &[Action]) {
        if actions.is_empty() || actions.iter().all(Action::is_terminal) {
            return;
        }
        if !actions.iter().all(|a| a.kind().cacheable()) {
            return;
        }
        if actions
            .iter()
            .any(|a| !a.is_terminal() && a.element_ref().is_some()
                && a.meta().element_content_hash.is_none())
        {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.contains(&key) {
            return;
        }
        entries.put(
            key,
            CachedEntry {
                actions: actions.to_vec(),
                recorded: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrape::{ScrapedElement, ScrapedPage};
    use crate::driver::Rect;
    use crate::types::{ActionMeta, Coordinates};
    use std::collections::HashMap;

    fn key(order: u32) -> CacheKey {
        CacheKey {
            url_pattern: "https://ex.test/login".into(),
            navigation_goal: "login".into(),
            step_order: order,
        }
    }

    fn page_with(elements: Vec<(&str, &str, &str)>) -> ScrapedPage {
        let elements: Vec<ScrapedElement> = elements
            .into_iter()
            .map(|(id, css, hash)| ScrapedElement {
                element_id: id.into(),
                tag: "button".into(),
                text: String::new(),
                attributes: HashMap::new(),
                rect: Rect { x: 0.0, y: 0.0, width: 10.0, height: 10.0 },
                css_selector: css.into(),
                content_hash: hash.into(),
                interactable: true,
            })
            .collect();
        let mut page = ScrapedPage {
            elements,
            ..ScrapedPage::default()
        };
        for el in &page.elements.clone() {
            page.id_to_css.insert(el.element_id.clone(), el.css_selector.clone());
            page.id_to_hash.insert(el.element_id.clone(), el.content_hash.clone());
        }
        page
    }

    fn click(element_ref: &str, hash: Option<&str>) -> Action {
        Action::Click {
            element_ref: Some(element_ref.into()),
            coordinates: None,
            meta: ActionMeta {
                element_content_hash: hash.map(String::from),
                ..ActionMeta::default()
            },
        }
    }

    #[test]
    fn hit_personalizes_element_refs() {
        let cache = DecisionCache::new(16, Duration::from_secs(3600));
        cache.record(key(1), &[click("old-id", Some("h1"))]);

        let page = page_with(vec![("fresh-id", "#go", "h1")]);
        let actions = cache.lookup(&key(1), &page).expect("hit");
        assert_eq!(actions[0].element_ref(), Some("fresh-id"));
    }

    #[test]
    fn ambiguous_or_missing_hash_evicts() {
        let cache = DecisionCache::new(16, Duration::from_secs(3600));
        cache.record(key(1), &[click("old-id", Some("h1"))]);

        let ambiguous = page_with(vec![("a", "#a", "h1"), ("b", "#b", "h1")]);
        assert!(cache.lookup(&key(1), &ambiguous).is_none());
        // The entry is gone even for a page that would now match.
        let clean = page_with(vec![("a", "#a", "h1")]);
        assert!(cache.lookup(&key(1), &clean).is_none());
    }

    #[test]
    fn non_cacheable_kinds_are_rejected() {
        let cache = DecisionCache::new(16, Duration::from_secs(3600));
        cache.record(
            key(1),
            &[Action::Scroll { dx: 0.0, dy: 100.0, meta: ActionMeta::default() }],
        );
        assert!(cache.is_empty());
        // Coordinate clicks carry no hash but also no element_ref; they are
        // cacheable as-is.
        cache.record(
            key(2),
            &[Action::Click {
                element_ref: None,
                coordinates: Some(Coordinates { x: 1.0, y: 2.0 }),
                meta: ActionMeta::default(),
            }],
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn terminal_only_decisions_are_not_cached() {
        let cache = DecisionCache::new(16, Duration::from_secs(3600));
        cache.record(
            key(3),
            &[Action::Complete { extracted_data: None, meta: ActionMeta::default() }],
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn writes_are_idempotent_first_wins() {
        let cache = DecisionCache::new(16, Duration::from_secs(3600));
        cache.record(key(1), &[click("first", Some("h1"))]);
        cache.record(key(1), &[click("second", Some("h2"))]);
        let page = page_with(vec![("fresh", "#go", "h1")]);
        let actions = cache.lookup(&key(1), &page).expect("first write is kept");
        assert_eq!(actions[0].element_ref(), Some("fresh"));
    }

    #[test]
    fn expired_entries_miss() {
        let cache = DecisionCache::new(16, Duration::ZERO);
        cache.record(key(1), &[click("old", Some("h1"))]);
        let page = page_with(vec![("fresh", "#go", "h1")]);
        assert!(cache.lookup(&key(1), &page).is_none());
    }
}
