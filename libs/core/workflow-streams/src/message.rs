//! Stream message envelope

use crate::config::EVENT_FIELD;
use chrono::{DateTime, Utc};
use redis::streams::StreamId;
use std::collections::HashMap;

/// A raw entry read from a stream
///
/// The id is assigned by Redis at append time (`<ms>-<seq>`). Fields are kept
/// as strings; entries whose fields were trimmed away come back empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamMessage {
    pub fn new(id: impl Into<String>, fields: HashMap<String, String>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Look up a field
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// The serialized workflow event, if present
    pub fn payload(&self) -> Option<&str> {
        self.field(EVENT_FIELD)
    }

    /// The entry was deleted or trimmed while still pending
    pub fn is_tombstone(&self) -> bool {
        self.fields.is_empty()
    }

    /// Append time encoded in the stream id
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.id
            .split('-')
            .next()
            .and_then(|ts| ts.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
    }

    /// Time since the entry was appended, in milliseconds
    pub fn age_ms(&self) -> Option<i64> {
        self.timestamp()
            .map(|ts| (Utc::now() - ts).num_milliseconds())
    }
}

impl From<StreamId> for StreamMessage {
    fn from(entry: StreamId) -> Self {
        let fields = entry
            .map
            .into_iter()
            .filter_map(|(key, value)| value_to_string(&value).map(|v| (key, v)))
            .collect();
        Self {
            id: entry.id,
            fields,
        }
    }
}

fn value_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        redis::Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Numeric ordering of stream ids (`ms-seq`)
pub fn parse_stream_id(id: &str) -> Option<(u64, u64)> {
    let (ms, seq) = id.split_once('-')?;
    Some((ms.parse().ok()?, seq.parse().ok()?))
}
