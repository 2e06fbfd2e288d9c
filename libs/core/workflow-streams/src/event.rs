//! Workflow events
//!
//! On the wire an event is one flat JSON object: the three header fields
//! `event_id`, `event_name` and `execution_id`, plus whatever payload fields
//! the producing domain event carries. Known event names decode into typed
//! payloads; anything else, including a known name whose fields do not fit
//! the typed shape, is kept as [`EventPayload::Unknown`]. Only the header
//! fields are ever required.

use crate::error::StreamError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

pub const TICKET_CREATED: &str = "TICKET_CREATED";
pub const TASK_COMPLETED: &str = "TASK_COMPLETED";
pub const TASK_FAILED: &str = "TASK_FAILED";
pub const EXECUTION_CANCELLED: &str = "EXECUTION_CANCELLED";

const HEADER_FIELDS: [&str; 3] = ["event_id", "event_name", "execution_id"];

/// A ticket was opened and should start (or advance) a workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketCreated {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A workflow task finished successfully
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCompleted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A workflow task failed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFailed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The execution was cancelled by an operator or the owning system
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCancelled {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Event payload, one variant per known `event_name`
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    TicketCreated(TicketCreated),
    TaskCompleted(TaskCompleted),
    TaskFailed(TaskFailed),
    ExecutionCancelled(ExecutionCancelled),
    /// Unrecognized event name; payload fields kept verbatim
    Unknown(Map<String, Value>),
}

impl EventPayload {
    /// Event name for known variants
    pub fn known_name(&self) -> Option<&'static str> {
        match self {
            EventPayload::TicketCreated(_) => Some(TICKET_CREATED),
            EventPayload::TaskCompleted(_) => Some(TASK_COMPLETED),
            EventPayload::TaskFailed(_) => Some(TASK_FAILED),
            EventPayload::ExecutionCancelled(_) => Some(EXECUTION_CANCELLED),
            EventPayload::Unknown(_) => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, EventPayload::Unknown(_))
    }

    fn decode(event_name: &str, fields: Map<String, Value>) -> Self {
        let typed = match event_name {
            TICKET_CREATED => typed(&fields, EventPayload::TicketCreated),
            TASK_COMPLETED => typed(&fields, EventPayload::TaskCompleted),
            TASK_FAILED => typed(&fields, EventPayload::TaskFailed),
            EXECUTION_CANCELLED => typed(&fields, EventPayload::ExecutionCancelled),
            _ => return EventPayload::Unknown(fields),
        };

        typed.unwrap_or_else(|e| {
            debug!(event_name = %event_name, error = %e, "Payload does not fit typed shape, keeping raw fields");
            EventPayload::Unknown(fields)
        })
    }

    fn encode(&self) -> Result<Map<String, Value>, StreamError> {
        let value = match self {
            EventPayload::TicketCreated(p) => serde_json::to_value(p)?,
            EventPayload::TaskCompleted(p) => serde_json::to_value(p)?,
            EventPayload::TaskFailed(p) => serde_json::to_value(p)?,
            EventPayload::ExecutionCancelled(p) => serde_json::to_value(p)?,
            EventPayload::Unknown(fields) => return Ok(fields.clone()),
        };
        match value {
            Value::Object(fields) => Ok(fields),
            other => Err(StreamError::Serialization(format!(
                "payload encoded as non-object: {}",
                other
            ))),
        }
    }
}

/// The unit carried on an execution stream
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowEvent {
    pub event_id: String,
    pub event_name: String,
    pub execution_id: String,
    pub payload: EventPayload,
}

impl WorkflowEvent {
    /// Create an event for a known payload with a fresh event id
    pub fn new(execution_id: impl Into<String>, payload: EventPayload) -> Self {
        let event_name = payload.known_name().unwrap_or("UNKNOWN").to_string();
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_name,
            execution_id: execution_id.into(),
            payload,
        }
    }

    /// Create an event from a name and raw payload fields, decoding known names
    pub fn from_fields(
        execution_id: impl Into<String>,
        event_name: impl Into<String>,
        fields: Map<String, Value>,
    ) -> Self {
        let event_name = event_name.into();
        let payload = EventPayload::decode(&event_name, fields);
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_name,
            execution_id: execution_id.into(),
            payload,
        }
    }

    /// Override the generated event id
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// Parse the serialized form read from a stream
    pub fn parse(raw: &str) -> Result<Self, StreamError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| StreamError::InvalidEvent(format!("malformed JSON: {}", e)))?;
        let Value::Object(mut fields) = value else {
            return Err(StreamError::InvalidEvent(
                "event must be a JSON object".to_string(),
            ));
        };

        let event_id = take_header(&mut fields, "event_id")?;
        let event_name = take_header(&mut fields, "event_name")?;
        let execution_id = take_header(&mut fields, "execution_id")?;
        let payload = EventPayload::decode(&event_name, fields);

        Ok(Self {
            event_id,
            event_name,
            execution_id,
            payload,
        })
    }

    /// Serialize to the flat JSON object written to the stream
    pub fn to_json(&self) -> Result<String, StreamError> {
        let mut fields = self.payload.encode()?;
        for key in HEADER_FIELDS {
            fields.remove(key);
        }
        fields.insert("event_id".into(), Value::String(self.event_id.clone()));
        fields.insert("event_name".into(), Value::String(self.event_name.clone()));
        fields.insert(
            "execution_id".into(),
            Value::String(self.execution_id.clone()),
        );
        Ok(serde_json::to_string(&Value::Object(fields))?)
    }
}

fn take_header(fields: &mut Map<String, Value>, key: &str) -> Result<String, StreamError> {
    match fields.remove(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) => Err(StreamError::InvalidEvent(format!("empty {}", key))),
        Some(other) => Err(StreamError::InvalidEvent(format!(
            "{} must be a string, got {}",
            key, other
        ))),
        None => Err(StreamError::InvalidEvent(format!("missing {}", key))),
    }
}

fn typed<T: DeserializeOwned>(
    fields: &Map<String, Value>,
    wrap: fn(T) -> EventPayload,
) -> Result<EventPayload, serde_json::Error> {
    serde_json::from_value(Value::Object(fields.clone())).map(wrap)
}
