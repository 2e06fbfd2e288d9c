//! Dead letter queue
//!
//! A message that keeps failing is copied to `<stream>:dlq` together with the
//! error that killed it, then acknowledged on the live stream. Entries stay
//! there until an operator replays them with
//! [`DeadLetterQueue::reprocess_dead_letter_queue_message`]; nothing is
//! replayed automatically and the DLQ is never trimmed.

use crate::config::{EVENT_FIELD, StreamSettings};
use crate::error::StreamError;
use crate::event::WorkflowEvent;
use crate::groups::ConsumerGroups;
use crate::message::StreamMessage;
use crate::metrics::StreamMetrics;
use crate::transport::{StreamStats, StreamTransport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

const ORIGINAL_MESSAGE: &str = "original_message";
const ERROR_MESSAGE: &str = "error_message";
const ERROR_STACK: &str = "error_stack";
const SOURCE_STREAM: &str = "source_stream";
const ORIGINAL_ID: &str = "original_id";
const MOVED_AT: &str = "moved_at";

/// What was recorded about a dead-lettered message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterRecord {
    /// Serialized event exactly as it sat on the live stream
    pub original_message: String,
    pub error_message: String,
    pub error_stack: String,
    pub source_stream: String,
    pub original_id: String,
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Build a record for `message`, capturing the error's display and chain
    pub fn new(source_stream: &str, message: &StreamMessage, error: &eyre::Report) -> Self {
        Self {
            original_message: original_payload(message),
            error_message: error.to_string(),
            error_stack: format!("{:?}", error),
            source_stream: source_stream.to_string(),
            original_id: message.id.clone(),
            moved_at: Utc::now(),
        }
    }

    fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (ORIGINAL_MESSAGE, self.original_message.clone()),
            (ERROR_MESSAGE, self.error_message.clone()),
            (ERROR_STACK, self.error_stack.clone()),
            (SOURCE_STREAM, self.source_stream.clone()),
            (ORIGINAL_ID, self.original_id.clone()),
            (MOVED_AT, self.moved_at.to_rfc3339()),
        ]
    }

    fn from_message(message: &StreamMessage) -> Result<Self, StreamError> {
        let required = |field: &str| {
            message.field(field).map(str::to_string).ok_or_else(|| {
                StreamError::InvalidEvent(format!(
                    "dead letter {} is missing field {}",
                    message.id, field
                ))
            })
        };

        let moved_at = DateTime::parse_from_rfc3339(&required(MOVED_AT)?)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| {
                StreamError::InvalidEvent(format!("dead letter {} moved_at: {}", message.id, e))
            })?;

        Ok(Self {
            original_message: required(ORIGINAL_MESSAGE)?,
            error_message: required(ERROR_MESSAGE)?,
            error_stack: message.field(ERROR_STACK).unwrap_or_default().to_string(),
            source_stream: required(SOURCE_STREAM)?,
            original_id: required(ORIGINAL_ID)?,
            moved_at,
        })
    }
}

/// A record together with its id on the DLQ stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterEntry {
    pub id: String,
    #[serde(flatten)]
    pub record: DeadLetterRecord,
}

/// The event field if present, otherwise every field as a JSON object
fn original_payload(message: &StreamMessage) -> String {
    match message.payload() {
        Some(payload) => payload.to_string(),
        None => serde_json::to_string(&message.fields).unwrap_or_default(),
    }
}

#[derive(Clone)]
pub struct DeadLetterQueue {
    transport: StreamTransport,
    groups: ConsumerGroups,
    settings: Arc<StreamSettings>,
    metrics: StreamMetrics,
}

impl DeadLetterQueue {
    pub fn new(
        transport: StreamTransport,
        groups: ConsumerGroups,
        settings: Arc<StreamSettings>,
    ) -> Self {
        let metrics = StreamMetrics::new(&settings.consumer_group);
        Self {
            transport,
            groups,
            settings,
            metrics,
        }
    }

    /// Copy a message to the DLQ and acknowledge it on the live stream
    ///
    /// Never fails: errors are logged and reported as `false`, in which case
    /// the message stays pending on the live stream.
    pub async fn move_to_dead_letter_queue(
        &self,
        execution_id: &str,
        message_id: &str,
        message: &StreamMessage,
        error: &eyre::Report,
    ) -> bool {
        match self.try_move(execution_id, message_id, message, error).await {
            Ok(dlq_id) => {
                self.metrics.message_dead_lettered();
                info!(
                    execution_id = %execution_id,
                    message_id = %message_id,
                    dlq_id = %dlq_id,
                    error = %error,
                    "Moved message to DLQ"
                );
                true
            }
            Err(e) => {
                self.metrics.dead_letter_move_failed();
                error!(
                    execution_id = %execution_id,
                    message_id = %message_id,
                    error = %e,
                    "Failed to move message to DLQ"
                );
                false
            }
        }
    }

    async fn try_move(
        &self,
        execution_id: &str,
        message_id: &str,
        message: &StreamMessage,
        error: &eyre::Report,
    ) -> Result<String, StreamError> {
        let source = self.settings.stream_name(execution_id);
        let dlq = self.settings.dlq_stream_name(execution_id);

        let mut record = DeadLetterRecord::new(&source, message, error);
        record.original_id = message_id.to_string();

        let fields = record.to_fields();
        let borrowed: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        // XADD and XACK commit together: the entry is dead-lettered at most once
        self.transport
            .append_and_ack(&dlq, &borrowed, &source, message_id)
            .await
    }

    /// Oldest-first page of DLQ entries for an execution
    ///
    /// Entries that cannot be decoded are skipped with a warning.
    pub async fn list_dead_letter_queue_messages(
        &self,
        execution_id: &str,
        count: usize,
    ) -> Result<Vec<DeadLetterEntry>, StreamError> {
        let dlq = self.settings.dlq_stream_name(execution_id);
        let messages = self.transport.range(&dlq, "-", "+", count).await?;

        Ok(messages
            .iter()
            .filter_map(|message| match DeadLetterRecord::from_message(message) {
                Ok(record) => Some(DeadLetterEntry {
                    id: message.id.clone(),
                    record,
                }),
                Err(e) => {
                    warn!(stream = %dlq, dlq_id = %message.id, error = %e, "Skipping undecodable DLQ entry");
                    None
                }
            })
            .collect())
    }

    /// Fetch one DLQ entry by id
    pub async fn get(
        &self,
        execution_id: &str,
        dlq_message_id: &str,
    ) -> Result<Option<DeadLetterEntry>, StreamError> {
        let dlq = self.settings.dlq_stream_name(execution_id);
        let Some(message) = self
            .transport
            .range(&dlq, dlq_message_id, dlq_message_id, 1)
            .await?
            .pop()
        else {
            return Ok(None);
        };

        let record = DeadLetterRecord::from_message(&message)?;
        Ok(Some(DeadLetterEntry {
            id: message.id,
            record,
        }))
    }

    /// Replay a DLQ entry onto the live stream and delete it from the DLQ
    ///
    /// Returns the new live message id, or `None` when the entry does not
    /// exist. The original must still parse as a workflow event.
    pub async fn reprocess(
        &self,
        execution_id: &str,
        dlq_message_id: &str,
    ) -> Result<Option<String>, StreamError> {
        let Some(entry) = self.get(execution_id, dlq_message_id).await? else {
            return Ok(None);
        };

        let event = WorkflowEvent::parse(&entry.record.original_message)?;
        if event.execution_id != execution_id {
            warn!(
                execution_id = %execution_id,
                event_execution_id = %event.execution_id,
                dlq_id = %dlq_message_id,
                "Replaying event whose execution id differs from its DLQ"
            );
        }

        let stream = self.settings.stream_name(execution_id);
        self.groups.ensure_stream_and_group(&stream).await?;
        let new_id = self
            .transport
            .append(
                &stream,
                &[(EVENT_FIELD, entry.record.original_message.as_str())],
                Some(self.settings.max_length),
            )
            .await?;

        let dlq = self.settings.dlq_stream_name(execution_id);
        self.transport.delete(&dlq, dlq_message_id).await?;

        self.metrics.dead_letter_reprocessed();
        info!(
            execution_id = %execution_id,
            dlq_id = %dlq_message_id,
            original_id = %entry.record.original_id,
            message_id = %new_id,
            "Reprocessed DLQ message"
        );
        Ok(Some(new_id))
    }

    /// [`reprocess`](Self::reprocess) reported as success/failure
    pub async fn reprocess_dead_letter_queue_message(
        &self,
        execution_id: &str,
        dlq_message_id: &str,
    ) -> bool {
        match self.reprocess(execution_id, dlq_message_id).await {
            Ok(Some(_)) => true,
            Ok(None) => {
                warn!(execution_id = %execution_id, dlq_id = %dlq_message_id, "DLQ message not found");
                false
            }
            Err(e) => {
                error!(
                    execution_id = %execution_id,
                    dlq_id = %dlq_message_id,
                    error = %e,
                    "Failed to reprocess DLQ message"
                );
                false
            }
        }
    }

    /// Length and boundary ids of an execution's DLQ
    pub async fn dead_letter_stats(&self, execution_id: &str) -> Result<StreamStats, StreamError> {
        self.transport
            .stream_stats(&self.settings.dlq_stream_name(execution_id))
            .await
    }
}
