//! Audio sensor: publishes a frame with a random energy level on a fixed period.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tracing::{debug, info};

use super::FRAMES_TOPIC;
use crate::node::{CallbackTable, Node, NodeContext, NodeError};

const DEFAULT_PERIOD_MS: u64 = 200;

pub struct AudioSensor {
    period_ms: AtomicU64,
    frames: AtomicU64,
}

impl AudioSensor {
    pub fn new() -> Self {
        Self {
            period_ms: AtomicU64::new(DEFAULT_PERIOD_MS),
            frames: AtomicU64::new(0),
        }
    }

    /// Frames published since construction.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl Default for AudioSensor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for AudioSensor {
    async fn init(&self, ctx: &NodeContext, _callbacks: &mut CallbackTable) -> Result<(), NodeError> {
        if let Some(raw) = ctx.env("FRAME_PERIOD_MS") {
            let ms: u64 = raw
                .parse()
                .map_err(|_| NodeError::Init(format!("FRAME_PERIOD_MS is not a number: {raw}")))?;
            if ms == 0 {
                return Err(NodeError::Init("FRAME_PERIOD_MS must be positive".to_string()));
            }
            self.period_ms.store(ms, Ordering::Relaxed);
        }
        info!(node = %ctx.name(), period_ms = self.period_ms.load(Ordering::Relaxed), "Sensor ready");
        Ok(())
    }

    async fn run(&self, ctx: NodeContext) -> Result<(), NodeError> {
        let period = Duration::from_millis(self.period_ms.load(Ordering::Relaxed));
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let seq = self.frames.fetch_add(1, Ordering::Relaxed);
                    let energy: f64 = rand::thread_rng().gen_range(0.0..1.0);
                    if !ctx.publish(FRAMES_TOPIC, json!({ "seq": seq, "energy": energy })) {
                        debug!(seq, "Frame not published");
                    }
                }
                _ = ctx.wait_for_shutdown() => return Ok(()),
            }
        }
    }
}
