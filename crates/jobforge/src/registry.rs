//! The Queue Registry (C3) and Handler Registry (user code lookup by `kind`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cancel::CancelToken;
use crate::error::HandlerFailure;
use crate::types::Queue;

/// Static configuration of every registered queue (C3), read-only after
/// startup (§5: "Queue configuration: read-only after startup; no locking.").
#[derive(Debug, Clone, Default)]
pub struct QueueRegistry {
    queues: HashMap<String, Queue>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        QueueRegistry::default()
    }

    pub fn register(&mut self, queue: Queue) -> &mut Self {
        self.queues.insert(queue.name.clone(), queue);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Queue> {
        self.queues.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Queue> {
        self.queues.values()
    }
}

/// What a handler sees while running (§4.4, §5).
///
/// `progress` writes are best-effort and never affect correctness (§4.4);
/// the engine doesn't persist them anywhere today, but handlers that want to
/// surface progress to an observer sink can publish through the `Engine`'s
/// event bus from inside `handle`.
pub struct JobContext {
    pub queue: String,
    pub job_id: u64,
    pub kind: String,
    pub attempt: u32,
    pub payload: Vec<u8>,
    pub cancel: CancelToken,
}

/// The user-supplied unit of work for one `kind`.
///
/// A handler that wants to bypass the retry ladder entirely returns
/// `Err(HandlerFailure::Permanent(..))` (§7 `PERMANENT`); anything else
/// returned as `Err(HandlerFailure::Retryable(..))` counts against
/// `attempts_max` and is retried with backoff.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> Result<Vec<u8>, HandlerFailure>;
}

/// Lock-free map keyed by `kind` (§5: "Handler Registry: read-mostly; a
/// lock-free map keyed by kind.").
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    pub fn register(&self, kind: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(kind).map(|entry| entry.clone())
    }
}
