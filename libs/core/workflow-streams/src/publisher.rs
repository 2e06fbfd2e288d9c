//! Event publisher
//!
//! Appends workflow events to their execution stream, creating the stream and
//! consumer group on first use.
//!
//! # Example
//!
//! ```rust,ignore
//! use workflow_streams::{EventPayload, TicketCreated, WorkflowEvent};
//!
//! let event = WorkflowEvent::new("x1", EventPayload::TicketCreated(TicketCreated::default()));
//! let message_id = streams.publisher().publish_event(&event).await?;
//! ```

use crate::config::{EVENT_FIELD, StreamSettings};
use crate::error::StreamError;
use crate::event::WorkflowEvent;
use crate::groups::ConsumerGroups;
use crate::metrics::StreamMetrics;
use crate::transport::{StreamTransport, append_cmd};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct EventPublisher {
    transport: StreamTransport,
    groups: ConsumerGroups,
    settings: Arc<StreamSettings>,
    metrics: StreamMetrics,
}

impl EventPublisher {
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

    /// Append one event to its execution stream
    ///
    /// Returns the id Redis assigned to the new entry. Transport errors are
    /// returned as-is; retrying is up to the caller.
    pub async fn publish_event(&self, event: &WorkflowEvent) -> Result<String, StreamError> {
        let stream = self.settings.stream_name(&event.execution_id);
        self.groups.ensure_stream_and_group(&stream).await?;

        let json = event.to_json()?;
        let id = self
            .transport
            .append(
                &stream,
                &[(EVENT_FIELD, json.as_str())],
                Some(self.settings.max_length),
            )
            .await?;

        self.metrics.events_published(1);
        debug!(
            stream = %stream,
            message_id = %id,
            event_id = %event.event_id,
            event_name = %event.event_name,
            "Published event"
        );
        Ok(id)
    }

    /// Append several events in one pipeline
    ///
    /// Ids are returned in input order. Events for the same execution keep
    /// their relative order on the stream.
    pub async fn publish_events(
        &self,
        events: &[WorkflowEvent],
    ) -> Result<Vec<String>, StreamError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let streams: BTreeSet<String> = events
            .iter()
            .map(|e| self.settings.stream_name(&e.execution_id))
            .collect();
        for stream in &streams {
            self.groups.ensure_stream_and_group(stream).await?;
        }

        let mut pipe = redis::pipe();
        for event in events {
            let stream = self.settings.stream_name(&event.execution_id);
            let json = event.to_json()?;
            pipe.add_command(append_cmd(
                &stream,
                &[(EVENT_FIELD, json.as_str())],
                Some(self.settings.max_length),
            ));
        }

        let mut conn = self.transport.connection();
        let ids: Vec<String> = pipe.query_async(&mut conn).await?;

        self.metrics.events_published(ids.len());
        debug!(count = ids.len(), streams = streams.len(), "Published event batch");
        Ok(ids)
    }
}
