//! # Demo Fleet
//!
//! A three-node voice pipeline wired through the bus:
//!
//! ```text
//! audio_sensor ──audio.frames──→ transcriber ──speech.requests──→ speech
//!   (random energy)                (loud = urgent)                 (priority queue,
//!                                                                   interruptible)
//! ```
//!
//! Used by the `fleet-runtime` binary and by the integration tests.

pub mod sensor;
pub mod speech;
pub mod transcriber;

use std::sync::Arc;
use std::time::Duration;

use fleet_types::{
    FieldSpec, FieldType, HealthCheckSpec, MessageSchema, NodeDescriptor, Priority, QosProfile,
    RestartPolicy, TopicDeclarations,
};

use crate::node::{factory, Node};
use crate::supervisor::NodeSpec;

pub use sensor::AudioSensor;
pub use speech::SpeechOutput;
pub use transcriber::Transcriber;

pub const FRAMES_TOPIC: &str = "audio.frames";
pub const SPEECH_TOPIC: &str = "speech.requests";

/// Priority of a loud frame's speech request.
pub const URGENT_PRIORITY: u32 = 10;
/// Priority of every other speech request.
pub const NORMAL_PRIORITY: u32 = 50;

pub fn frame_schema() -> MessageSchema {
    MessageSchema::any()
        .field("seq", FieldSpec::new(FieldType::Integer).required())
        .field(
            "energy",
            FieldSpec::new(FieldType::Float)
                .required()
                .bounded(Some(0.0), Some(1.0)),
        )
}

pub fn speech_schema() -> MessageSchema {
    MessageSchema::any()
        .field("text", FieldSpec::new(FieldType::String).required())
        .field(
            "priority",
            FieldSpec::new(FieldType::Integer)
                .bounded(Some(0.0), Some(100.0))
                .with_default(serde_json::json!(NORMAL_PRIORITY)),
        )
}

fn probing(interval_ms: u64) -> HealthCheckSpec {
    HealthCheckSpec {
        enabled: true,
        interval: Duration::from_millis(interval_ms),
        timeout: Duration::from_millis(interval_ms / 2),
        failure_threshold: 3,
    }
}

/// The demo pipeline, leaf first.
pub fn fleet() -> Vec<NodeSpec> {
    let sensor = NodeSpec::new(
        NodeDescriptor::new("audio_sensor")
            .with_priority(Priority::High)
            .with_restart(RestartPolicy::Always, 5)
            .provides(["audio"])
            .with_health_check(probing(1000))
            .with_env("FRAME_PERIOD_MS", "200"),
        TopicDeclarations::new().publish(FRAMES_TOPIC, frame_schema(), QosProfile::best_effort(16)),
        factory(|_| Ok(Arc::new(AudioSensor::new()) as Arc<dyn Node>)),
    );

    let transcriber = NodeSpec::new(
        NodeDescriptor::new("transcriber")
            .with_restart(RestartPolicy::OnFailure, 3)
            .requires(["audio"])
            .with_health_check(probing(1000))
            .with_env("LOUD_THRESHOLD", "0.7"),
        TopicDeclarations::new()
            .subscribe(FRAMES_TOPIC, frame_schema(), QosProfile::best_effort(16), "on_frame")
            .publish(SPEECH_TOPIC, speech_schema(), QosProfile::reliable(32)),
        factory(|_| Ok(Arc::new(Transcriber::new()) as Arc<dyn Node>)),
    );

    let speech = NodeSpec::new(
        NodeDescriptor::new("speech")
            .with_priority(Priority::Low)
            .with_restart(RestartPolicy::OnFailure, 3)
            .requires(["transcriber"])
            .provides(["speech_output"])
            .with_health_check(probing(1000))
            .with_env("UTTERANCE_MS", "150"),
        TopicDeclarations::new().subscribe(
            SPEECH_TOPIC,
            speech_schema(),
            QosProfile::reliable(32),
            "on_request",
        ),
        factory(|_| Ok(Arc::new(SpeechOutput::new()) as Arc<dyn Node>)),
    );

    vec![sensor, transcriber, speech]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyGraph;
    use serde_json::json;

    #[test]
    fn test_demo_fleet_orders_leaf_first() {
        let specs = fleet();
        let graph = DependencyGraph::build(specs.iter().map(|s| &s.descriptor)).unwrap();
        assert_eq!(
            graph.topological_order().unwrap(),
            vec!["audio_sensor", "transcriber", "speech"]
        );
    }

    #[test]
    fn test_speech_schema_defaults_priority() {
        let payload = speech_schema().validate(json!({ "text": "hi" })).unwrap();
        assert_eq!(payload["priority"], json!(NORMAL_PRIORITY));
        assert!(speech_schema().validate(json!({ "priority": 5 })).is_err());
    }

    #[test]
    fn test_frame_energy_bounded() {
        assert!(frame_schema()
            .validate(json!({ "seq": 1, "energy": 1.5 }))
            .is_err());
    }
}
