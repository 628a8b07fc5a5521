//! Speech output: speaks requests most-urgent first.
//!
//! Requests land in a [`PriorityQueue`]; an urgent request arriving while a
//! less urgent one is being spoken cancels the current utterance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_bus::PriorityQueue;
use tracing::{debug, info};

use super::NORMAL_PRIORITY;
use crate::node::{CallbackTable, Node, NodeContext, NodeError};

const DEFAULT_UTTERANCE_MS: u64 = 150;
/// Backlog above which the node reports itself unhealthy.
const MAX_BACKLOG: usize = 256;

pub struct SpeechOutput {
    queue: Arc<PriorityQueue<String>>,
    utterance_ms: AtomicU64,
    spoken: AtomicU64,
    interrupted: Arc<AtomicU64>,
}

impl SpeechOutput {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(PriorityQueue::new(true)),
            utterance_ms: AtomicU64::new(DEFAULT_UTTERANCE_MS),
            spoken: AtomicU64::new(0),
            interrupted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn spoken(&self) -> u64 {
        self.spoken.load(Ordering::Relaxed)
    }

    pub fn interrupted(&self) -> u64 {
        self.interrupted.load(Ordering::Relaxed)
    }

    pub fn backlog(&self) -> usize {
        self.queue.len()
    }
}

impl Default for SpeechOutput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for SpeechOutput {
    async fn init(&self, ctx: &NodeContext, callbacks: &mut CallbackTable) -> Result<(), NodeError> {
        if let Some(raw) = ctx.env("UTTERANCE_MS") {
            let ms: u64 = raw
                .parse()
                .map_err(|_| NodeError::Init(format!("UTTERANCE_MS is not a number: {raw}")))?;
            self.utterance_ms.store(ms, Ordering::Relaxed);
        }

        let queue = Arc::clone(&self.queue);
        let interrupted = Arc::clone(&self.interrupted);
        callbacks.register("on_request", move |msg| {
            let text = msg
                .str_field("text")
                .ok_or_else(|| NodeError::Callback("request without text".to_string()))?
                .to_string();
            let priority = msg
                .i64_field("priority")
                .and_then(|p| u32::try_from(p).ok())
                .unwrap_or(NORMAL_PRIORITY);
            if queue.push(text, priority) {
                interrupted.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        });
        Ok(())
    }

    async fn run(&self, ctx: NodeContext) -> Result<(), NodeError> {
        let utterance = Duration::from_millis(self.utterance_ms.load(Ordering::Relaxed));

        loop {
            let delivery = tokio::select! {
                delivery = self.queue.recv() => delivery,
                _ = ctx.wait_for_shutdown() => return Ok(()),
            };

            tokio::select! {
                _ = tokio::time::sleep(utterance) => {
                    self.spoken.fetch_add(1, Ordering::Relaxed);
                    debug!(priority = delivery.priority, text = %delivery.item, "Spoken");
                }
                _ = delivery.token.cancelled() => {
                    info!(priority = delivery.priority, text = %delivery.item, "Utterance interrupted");
                }
                _ = ctx.wait_for_shutdown() => {
                    self.queue.complete();
                    return Ok(());
                }
            }
            self.queue.complete();
        }
    }

    async fn shutdown(&self) -> Result<(), NodeError> {
        let dropped = self.queue.clear();
        if dropped > 0 {
            info!(dropped, "Discarded pending speech requests");
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.queue.len() < MAX_BACKLOG
    }
}
