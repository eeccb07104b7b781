//! Processor registry: one handler per lane.
//!
//! Handlers are supplied by whatever subsystem owns a lane's purpose. The
//! scheduler only knows they take an opaque payload and eventually return
//! an opaque result or an error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

/// Executes items for a lane.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

/// Adapter that turns an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

/// Wrap `f` so it can be registered as a processor.
///
/// ```no_run
/// use laneq::registry::handler_fn;
///
/// let echo = handler_fn(|payload| async move { Ok(payload) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    async fn handle(&self, payload: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        (self.0)(payload).await
    }
}

/// Registry of handlers, indexed by queue name.
#[derive(Default)]
pub struct ProcessorRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handler` for `queue_name`. Returns true if it replaced one.
    pub fn register(&mut self, queue_name: impl Into<String>, handler: Arc<dyn Handler>) -> bool {
        self.handlers.insert(queue_name.into(), handler).is_some()
    }

    pub fn get(&self, queue_name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(queue_name).cloned()
    }

    pub fn contains(&self, queue_name: &str) -> bool {
        self.handlers.contains_key(queue_name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("queues", &self.queue_names())
            .finish()
    }
}
