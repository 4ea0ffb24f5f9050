//! Task execution engine: step loop, decision cache, webhook delivery.

pub mod cache;
pub mod task_engine;
pub mod webhook;

pub use cache::{CacheKey, DecisionCache};
pub use task_engine::{TaskEngine, TaskEngineConfig};
pub use webhook::{WebhookEvent, WebhookNotifier};
