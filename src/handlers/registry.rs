//! Handler registry mapping job kinds to their executors.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::handlers::handler::JobHandler;
use crate::worker::job::JobKind;

/// Registry of job handlers. The last registration for a kind wins.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<JobKind, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under its own kind, replacing any previous one.
    pub async fn register(&self, handler: Arc<dyn JobHandler>) {
        let kind = handler.kind();
        if self.handlers.write().await.insert(kind, handler).is_some() {
            tracing::info!(kind = %kind, "Replaced job handler");
        } else {
            tracing::debug!(kind = %kind, "Registered job handler");
        }
    }

    /// Register a handler (sync version for startup).
    pub fn register_sync(&self, handler: Arc<dyn JobHandler>) {
        let kind = handler.kind();
        if let Ok(mut handlers) = self.handlers.try_write() {
            handlers.insert(kind, handler);
            tracing::debug!(kind = %kind, "Registered job handler");
        } else {
            tracing::warn!(kind = %kind, "Handler registry busy, registration skipped");
        }
    }

    /// Get the handler for a kind.
    pub async fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().await.get(&kind).cloned()
    }

    /// Check if a kind has a handler.
    pub async fn has(&self, kind: JobKind) -> bool {
        self.handlers.read().await.contains_key(&kind)
    }

    /// List registered kinds.
    pub async fn kinds(&self) -> Vec<JobKind> {
        self.handlers.read().await.keys().copied().collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
