//! Transcriber: turns audio frames into speech requests.
//!
//! Frames above the loudness threshold become urgent requests and interrupt
//! whatever the speech node is saying.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};

use super::{NORMAL_PRIORITY, SPEECH_TOPIC, URGENT_PRIORITY};
use crate::node::{CallbackTable, Node, NodeContext, NodeError};

const DEFAULT_LOUD_THRESHOLD: f64 = 0.7;

pub struct Transcriber {
    loud_threshold: Arc<RwLock<f64>>,
    transcribed: Arc<AtomicU64>,
}

impl Transcriber {
    pub fn new() -> Self {
        Self {
            loud_threshold: Arc::new(RwLock::new(DEFAULT_LOUD_THRESHOLD)),
            transcribed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn transcribed(&self) -> u64 {
        self.transcribed.load(Ordering::Relaxed)
    }
}

impl Default for Transcriber {
    fn default() -> Self {
        Self::new()
    }
}

/// Request priority for a frame of the given energy.
pub fn priority_for(energy: f64, loud_threshold: f64) -> u32 {
    if energy > loud_threshold {
        URGENT_PRIORITY
    } else {
        NORMAL_PRIORITY
    }
}

#[async_trait]
impl Node for Transcriber {
    async fn init(&self, ctx: &NodeContext, callbacks: &mut CallbackTable) -> Result<(), NodeError> {
        if let Some(raw) = ctx.env("LOUD_THRESHOLD") {
            let threshold: f64 = raw
                .parse()
                .map_err(|_| NodeError::Init(format!("LOUD_THRESHOLD is not a number: {raw}")))?;
            *self.loud_threshold.write() = threshold;
        }

        let bus = ctx.bus().clone();
        let threshold = Arc::clone(&self.loud_threshold);
        let transcribed = Arc::clone(&self.transcribed);
        callbacks.register("on_frame", move |msg| {
            let energy = msg
                .payload
                .get("energy")
                .and_then(Value::as_f64)
                .ok_or_else(|| NodeError::Callback("frame without energy".to_string()))?;
            let seq = msg.i64_field("seq").unwrap_or_default();
            let priority = priority_for(energy, *threshold.read());

            bus.try_publish(
                SPEECH_TOPIC,
                json!({
                    "text": format!("frame {seq} at energy {energy:.2}"),
                    "priority": priority,
                }),
            )?;
            transcribed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        Ok(())
    }
}
