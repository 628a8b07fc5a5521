//! # Topic Descriptors, QoS and Message Schemas
//!
//! A topic is a named channel carrying messages of one schema. Every node
//! declares the topics it publishes and subscribes once, during init.
//!
//! ## Schema Validation
//!
//! | Rule | Behaviour |
//! |------|-----------|
//! | Missing required field | `SchemaViolation` |
//! | Missing optional field with default | default inserted |
//! | Wrong JSON type | `SchemaViolation` (integers accepted as floats) |
//! | Number outside `min`/`max` | `SchemaViolation` |
//! | String/array length outside `min`/`max` | `SchemaViolation` |
//! | Value not in `allowed` | `SchemaViolation` |
//! | Unknown extra field | accepted unchanged |

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SchemaViolation;

// =============================================================================
// QOS
// =============================================================================

/// Delivery reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    Reliable,
    BestEffort,
}

/// Whether late joiners may expect retained data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    Volatile,
    /// The bus keeps the last `depth` messages and replays them to every
    /// newly bound subscriber.
    Persistent,
}

/// Buffering behaviour of a subscriber queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum History {
    /// Keep the most recent `depth` messages, evicting the oldest.
    KeepLast,
    /// Keep up to `depth` messages, refusing new ones when full.
    KeepAll,
}

/// Per-topic quality-of-service policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QosProfile {
    pub reliability: Reliability,
    pub durability: Durability,
    pub history: History,
    /// Queue capacity. Values below 1 are treated as 1.
    pub depth: usize,
}

impl Default for QosProfile {
    fn default() -> Self {
        Self {
            reliability: Reliability::Reliable,
            durability: Durability::Volatile,
            history: History::KeepAll,
            depth: 10,
        }
    }
}

impl QosProfile {
    /// Lossy-latest: a single slot replaced by every new message.
    pub fn latest() -> Self {
        Self {
            reliability: Reliability::BestEffort,
            durability: Durability::Volatile,
            history: History::KeepLast,
            depth: 1,
        }
    }

    /// Reliable bounded FIFO of `depth` messages.
    pub fn reliable(depth: usize) -> Self {
        Self {
            reliability: Reliability::Reliable,
            durability: Durability::Volatile,
            history: History::KeepAll,
            depth,
        }
    }

    /// Best-effort bounded FIFO of `depth` messages.
    pub fn best_effort(depth: usize) -> Self {
        Self {
            reliability: Reliability::BestEffort,
            ..Self::reliable(depth)
        }
    }

    /// Reliable FIFO whose last `depth` messages are replayed to late joiners.
    pub fn persistent(depth: usize) -> Self {
        Self {
            durability: Durability::Persistent,
            ..Self::reliable(depth)
        }
    }

    /// Set the history policy.
    pub fn with_history(mut self, history: History) -> Self {
        self.history = history;
        self
    }

    /// Queue capacity actually allocated.
    pub fn effective_depth(&self) -> usize {
        self.depth.max(1)
    }

    /// Returns a description of why a subscriber expecting `self` would be
    /// under-served by a publisher offering `offered`, if it would.
    pub fn mismatch_with(&self, offered: &QosProfile) -> Option<String> {
        if self.reliability == Reliability::Reliable && offered.reliability == Reliability::BestEffort
        {
            return Some("subscriber expects reliable, publisher offers best_effort".to_string());
        }
        if self.durability == Durability::Persistent && offered.durability == Durability::Volatile {
            return Some("subscriber expects persistent, publisher offers volatile".to_string());
        }
        None
    }
}

// =============================================================================
// SCHEMA
// =============================================================================

/// JSON type a field must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

/// Constraints on one payload field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Lower bound on numbers, or on length for strings and arrays.
    #[serde(default)]
    pub min: Option<f64>,
    /// Upper bound on numbers, or on length for strings and arrays.
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub allowed: Option<Vec<Value>>,
    #[serde(default)]
    pub default: Option<Value>,
}

impl FieldSpec {
    /// A field of the given type, optional, unconstrained.
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            min: None,
            max: None,
            allowed: None,
            default: None,
        }
    }

    /// Mark as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set inclusive bounds.
    pub fn bounded(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Restrict to an explicit value set.
    pub fn one_of(mut self, allowed: Vec<Value>) -> Self {
        self.allowed = Some(allowed);
        self
    }

    /// Value inserted when the field is absent.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    fn check(&self, name: &str, value: &Value) -> Result<(), SchemaViolation> {
        if !self.field_type.accepts(value) {
            return Err(SchemaViolation::new(
                name,
                format!("expected {}, got {}", self.field_type, json_kind(value)),
            ));
        }

        let measured = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => Some(s.chars().count() as f64),
            Value::Array(items) => Some(items.len() as f64),
            _ => None,
        };
        if let Some(measured) = measured {
            if let Some(min) = self.min {
                if measured < min {
                    return Err(SchemaViolation::new(name, format!("{measured} below minimum {min}")));
                }
            }
            if let Some(max) = self.max {
                if measured > max {
                    return Err(SchemaViolation::new(name, format!("{measured} above maximum {max}")));
                }
            }
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                return Err(SchemaViolation::new(name, format!("{value} not in allowed values")));
            }
        }
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Field name → constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSchema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

impl MessageSchema {
    /// A schema that accepts any payload.
    pub fn any() -> Self {
        Self::default()
    }

    /// Add a field.
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Validate `payload`, returning it with defaults filled in.
    pub fn validate(&self, payload: Value) -> Result<Value, SchemaViolation> {
        if self.fields.is_empty() {
            return Ok(payload);
        }

        let Value::Object(mut map) = payload else {
            return Err(SchemaViolation::new(
                "<payload>",
                format!("expected object, got {}", json_kind(&payload)),
            ));
        };

        for (name, spec) in &self.fields {
            match map.get(name) {
                Some(value) => spec.check(name, value)?,
                None => {
                    if let Some(default) = &spec.default {
                        map.insert(name.clone(), default.clone());
                    } else if spec.required {
                        return Err(SchemaViolation::new(name, "required field missing"));
                    }
                }
            }
        }

        Ok(Value::Object(map))
    }
}

// =============================================================================
// TOPIC DECLARATIONS
// =============================================================================

/// Whether a node writes to or reads from a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Publish,
    Subscribe,
}

/// One topic declaration of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicDescriptor {
    pub topic: String,
    pub direction: Direction,
    #[serde(default)]
    pub schema: MessageSchema,
    #[serde(default)]
    pub qos: QosProfile,
    /// Callback identifier, only meaningful for subscriptions.
    #[serde(default)]
    pub callback: Option<String>,
}

impl TopicDescriptor {
    /// Declare a published topic.
    pub fn publish(topic: impl Into<String>, schema: MessageSchema, qos: QosProfile) -> Self {
        Self {
            topic: topic.into(),
            direction: Direction::Publish,
            schema,
            qos,
            callback: None,
        }
    }

    /// Declare a subscription bound to `callback`.
    pub fn subscribe(
        topic: impl Into<String>,
        schema: MessageSchema,
        qos: QosProfile,
        callback: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            direction: Direction::Subscribe,
            schema,
            qos,
            callback: Some(callback.into()),
        }
    }
}

/// The full messaging interface of one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicDeclarations {
    #[serde(default)]
    pub publishes: Vec<TopicDescriptor>,
    #[serde(default)]
    pub subscribes: Vec<TopicDescriptor>,
}

impl TopicDeclarations {
    /// Create an empty declaration set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a published topic.
    pub fn publish(mut self, topic: impl Into<String>, schema: MessageSchema, qos: QosProfile) -> Self {
        self.publishes.push(TopicDescriptor::publish(topic, schema, qos));
        self
    }

    /// Add a subscription.
    pub fn subscribe(
        mut self,
        topic: impl Into<String>,
        schema: MessageSchema,
        qos: QosProfile,
        callback: impl Into<String>,
    ) -> Self {
        self.subscribes
            .push(TopicDescriptor::subscribe(topic, schema, qos, callback));
        self
    }
}
