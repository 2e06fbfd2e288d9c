//! Workflow Event Streams
//!
//! At-least-once delivery of workflow events over Redis Streams, one stream
//! per workflow execution.
//!
//! ## Features
//!
//! - **Publisher**: append events to `workflow:events:<execution_id>` with bounded trimming
//! - **Consumer groups**: lazily created, memoized per process, safe under races
//! - **Consumer loop**: pending-first reads, stale message claiming, concurrent batches
//! - **Dead Letter Queue**: failing messages moved to `<stream>:dlq` after max retries, replayable
//! - **Distributed lock**: advisory `SET NX PX` lock with owner-checked release/extend
//! - **Prometheus metrics**: counters for publish, process, claim and DLQ outcomes
//!
//! ## Example
//!
//! ```ignore
//! use workflow_streams::{handler_fn, RedisSettings, StreamSettings, WorkflowStreams};
//! use core_config::FromEnv;
//!
//! let streams = WorkflowStreams::connect(&RedisSettings::from_env()?, StreamSettings::from_env()?).await?;
//!
//! streams.consumer().register_consumer("x1", handler_fn(|incoming| async move {
//!     executor.apply(incoming.event).await
//! }));
//!
//! streams.publisher().publish_event(&event).await?;
//! // ...
//! streams.shutdown().await;
//! ```

pub mod config;
mod connection;
mod consumer;
mod dlq;
mod error;
mod event;
mod groups;
mod handler;
mod lock;
mod message;
pub mod metrics;
mod publisher;
mod transport;

use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::info;

// Re-export main types
pub use config::{RedisSettings, ReconnectPolicy, StreamSettings};
pub use connection::{connect, connect_reader, ping};
pub use consumer::{CycleReport, EventConsumer};
pub use dlq::{DeadLetterEntry, DeadLetterQueue, DeadLetterRecord};
pub use error::StreamError;
pub use event::{
    EXECUTION_CANCELLED, EventPayload, ExecutionCancelled, TASK_COMPLETED, TASK_FAILED,
    TICKET_CREATED, TaskCompleted, TaskFailed, TicketCreated, WorkflowEvent,
};
pub use groups::ConsumerGroups;
pub use handler::{ChannelHandler, Delivery, EventHandler, FnHandler, IncomingEvent, handler_fn};
pub use lock::DistributedLock;
pub use message::{StreamMessage, parse_stream_id};
pub use crate::metrics::{StreamMetrics, init_metrics};
pub use publisher::EventPublisher;
pub use transport::{PendingEntry, ReadCursor, StreamStats, StreamTransport};

/// Handle owning the connection and every component built on it
///
/// Clone freely; clones share the connection, group memo and consumer loop.
#[derive(Clone)]
pub struct WorkflowStreams {
    settings: Arc<StreamSettings>,
    transport: StreamTransport,
    groups: ConsumerGroups,
    publisher: EventPublisher,
    consumer: EventConsumer,
    dlq: DeadLetterQueue,
    locks: DistributedLock,
}

impl WorkflowStreams {
    /// Connect with retry, then build the components
    ///
    /// When `block_timeout_ms` is set, a second connection is opened for
    /// blocking reads.
    pub async fn connect(
        redis: &RedisSettings,
        settings: StreamSettings,
    ) -> Result<Self, StreamError> {
        let manager = connection::connect(redis).await?;
        let reader = match settings.block_timeout_ms {
            Some(block_ms) => Some(connection::connect_reader(redis, block_ms).await?),
            None => None,
        };
        Ok(Self::build(manager, reader, settings))
    }

    /// Build the components on an existing connection
    ///
    /// Reads never block on a shared connection; use
    /// [`with_blocking_reader`](Self::with_blocking_reader) to honour
    /// `block_timeout_ms`.
    pub fn new(redis: ConnectionManager, settings: StreamSettings) -> Self {
        Self::build(redis, None, settings)
    }

    /// Build the components with a dedicated connection for blocking reads
    ///
    /// The reader's response timeout must outlast `block_timeout_ms`, as
    /// [`connect_reader`] ensures.
    pub fn with_blocking_reader(
        redis: ConnectionManager,
        reader: ConnectionManager,
        settings: StreamSettings,
    ) -> Self {
        Self::build(redis, Some(reader), settings)
    }

    fn build(
        redis: ConnectionManager,
        reader: Option<ConnectionManager>,
        settings: StreamSettings,
    ) -> Self {
        let settings = Arc::new(settings);
        let mut transport = StreamTransport::new(
            redis.clone(),
            settings.consumer_group.clone(),
            settings.consumer_id.clone(),
        );
        if let Some(reader) = reader {
            transport = transport.with_blocking_reader(reader);
        }
        let groups = ConsumerGroups::new(transport.clone());
        let publisher = EventPublisher::new(transport.clone(), groups.clone(), settings.clone());
        let dlq = DeadLetterQueue::new(transport.clone(), groups.clone(), settings.clone());
        let consumer = EventConsumer::new(
            transport.clone(),
            groups.clone(),
            dlq.clone(),
            settings.clone(),
        );
        let locks = DistributedLock::new(redis);

        info!(
            consumer = %settings.consumer_id,
            group = %settings.consumer_group,
            prefix = %settings.stream_prefix,
            blocking_reads = transport.has_blocking_reader(),
            "Workflow streams ready"
        );

        Self {
            settings,
            transport,
            groups,
            publisher,
            consumer,
            dlq,
            locks,
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn consumer(&self) -> &EventConsumer {
        &self.consumer
    }

    pub fn dlq(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    pub fn locks(&self) -> &DistributedLock {
        &self.locks
    }

    pub fn groups(&self) -> &ConsumerGroups {
        &self.groups
    }

    pub fn transport(&self) -> &StreamTransport {
        &self.transport
    }

    /// Stream stats for an execution
    pub async fn stream_stats(&self, execution_id: &str) -> Result<StreamStats, StreamError> {
        self.transport
            .stream_stats(&self.settings.stream_name(execution_id))
            .await
    }

    /// Stop the consumer loop, letting in-flight handlers finish
    pub async fn shutdown(&self) {
        self.consumer.stop_consumer().await;
        info!(consumer = %self.settings.consumer_id, "Workflow streams shut down");
    }
}
