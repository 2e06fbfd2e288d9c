//! Polling consumer loop
//!
//! One loop per process serves every registered execution. Each cycle walks
//! the registered executions in turn and, for each one:
//!
//! 1. ensures the stream and consumer group exist
//! 2. re-reads this consumer's own pending entries (cursor `0`) if the group
//!    has any, so a restarted consumer drains its backlog first
//! 3. reads new entries (cursor `>`)
//! 4. every `claim_interval`, claims entries idle longer than `claim_idle_ms`
//!    from consumers presumed dead
//!
//! Messages from one read are handled concurrently and awaited together.
//! Success acknowledges; failure leaves the entry pending until its delivery
//! count reaches `max_retries`, at which point it is dead-lettered.
//!
//! Handler failures never stop the loop. Transport errors are logged per
//! execution and the next cycle starts after `error_backoff`.

use crate::config::StreamSettings;
use crate::dlq::DeadLetterQueue;
use crate::error::StreamError;
use crate::event::WorkflowEvent;
use crate::groups::ConsumerGroups;
use crate::handler::{ChannelHandler, Delivery, EventHandler, IncomingEvent};
use crate::message::StreamMessage;
use crate::metrics::StreamMetrics;
use crate::transport::{ReadCursor, StreamTransport};
use eyre::eyre;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Counters for one pass over the registered executions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub executions: usize,
    pub processed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub claimed: usize,
    pub errors: usize,
}

impl CycleReport {
    fn merge(&mut self, other: CycleReport) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
        self.claimed += other.claimed;
        self.errors += other.errors;
    }

    /// Whether any message was read this cycle
    pub fn found_work(&self) -> bool {
        self.processed + self.failed + self.claimed > 0
    }
}

enum Outcome {
    Processed,
    Failed { dead_lettered: bool },
    TransportError,
}

struct ConsumerInner {
    transport: StreamTransport,
    groups: ConsumerGroups,
    dlq: DeadLetterQueue,
    settings: Arc<StreamSettings>,
    metrics: StreamMetrics,
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
    last_claim: Mutex<HashMap<String, Instant>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Registers execution handlers and drives the shared polling loop
#[derive(Clone)]
pub struct EventConsumer {
    inner: Arc<ConsumerInner>,
}

impl EventConsumer {
    pub fn new(
        transport: StreamTransport,
        groups: ConsumerGroups,
        dlq: DeadLetterQueue,
        settings: Arc<StreamSettings>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let metrics = StreamMetrics::new(&settings.consumer_group);
        Self {
            inner: Arc::new(ConsumerInner {
                transport,
                groups,
                dlq,
                settings,
                metrics,
                handlers: RwLock::new(HashMap::new()),
                last_claim: Mutex::new(HashMap::new()),
                shutdown,
                task: Mutex::new(None),
            }),
        }
    }

    /// Register a handler for an execution and make sure the loop is running
    ///
    /// Replaces any handler already registered for the execution. Must be
    /// called from within a Tokio runtime.
    pub fn register_consumer<H>(&self, execution_id: impl Into<String>, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.register_handler(execution_id, Arc::new(handler));
    }

    /// [`register_consumer`](Self::register_consumer) for a shared handler
    pub fn register_handler(
        &self,
        execution_id: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        self.attach(execution_id, handler);
        self.ensure_running();
    }

    /// Register an execution whose events are delivered over a channel
    ///
    /// Every [`Delivery`] must be answered with `ack` or `nack`; until then the
    /// loop waits on it.
    pub fn register_channel(
        &self,
        execution_id: impl Into<String>,
        capacity: usize,
    ) -> mpsc::Receiver<Delivery> {
        let (handler, rx) = ChannelHandler::channel(capacity);
        self.register_consumer(execution_id, handler);
        rx
    }

    /// Add a handler without starting the loop; drive it with [`poll_once`](Self::poll_once)
    pub fn attach(&self, execution_id: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let execution_id = execution_id.into();
        info!(
            execution_id = %execution_id,
            handler = handler.name(),
            consumer = %self.inner.settings.consumer_id,
            "Registered consumer"
        );
        self.handlers_mut().insert(execution_id, handler);
    }

    /// Remove an execution's handler
    ///
    /// Messages already delivered but not acknowledged stay pending and are
    /// picked up by whichever consumer next claims them.
    pub fn unregister_consumer(&self, execution_id: &str) -> bool {
        let removed = self.handlers_mut().remove(execution_id).is_some();
        self.last_claim().remove(execution_id);
        if removed {
            info!(execution_id = %execution_id, "Unregistered consumer");
        }
        removed
    }

    pub fn registered_executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_running(&self) -> bool {
        self.task_slot()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Ask the loop to stop and wait for the current cycle to finish
    ///
    /// In-flight handlers run to completion. Handlers stay registered, so a
    /// later registration restarts the loop with all of them.
    pub async fn stop_consumer(&self) {
        self.inner.shutdown.send_replace(true);

        let handle = self.task_slot().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Consumer loop task failed");
            }
            info!(consumer = %self.inner.settings.consumer_id, "Consumer loop stopped");
        }
    }

    fn ensure_running(&self) {
        let mut slot = self.task_slot();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        self.inner.shutdown.send_replace(false);
        let consumer = self.clone();
        let shutdown = self.inner.shutdown.subscribe();
        *slot = Some(tokio::spawn(async move { consumer.run(shutdown).await }));
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            consumer = %self.inner.settings.consumer_id,
            group = %self.inner.settings.consumer_group,
            "Consumer loop started"
        );

        while !*shutdown.borrow() {
            let report = self.poll_once().await;

            let delay = if report.errors > 0 {
                self.inner.settings.error_backoff()
            } else {
                self.inner.settings.poll_interval()
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Run one cycle over every registered execution
    pub async fn poll_once(&self) -> CycleReport {
        let started = Instant::now();
        let handlers: Vec<(String, Arc<dyn EventHandler>)> = self
            .handlers()
            .iter()
            .map(|(id, handler)| (id.clone(), handler.clone()))
            .collect();

        // Blocking on one stream would starve the others
        let block_ms = if handlers.len() == 1 {
            self.inner.settings.block_timeout_ms
        } else {
            None
        };

        let mut report = CycleReport {
            executions: handlers.len(),
            ..Default::default()
        };

        for (execution_id, handler) in handlers {
            let stream = self.inner.settings.stream_name(&execution_id);
            match self
                .poll_execution(&execution_id, &stream, &handler, block_ms)
                .await
            {
                Ok(execution_report) => report.merge(execution_report),
                Err(e) => {
                    report.errors += 1;
                    if e.is_nogroup() {
                        self.inner.groups.forget(&stream);
                    }
                    error!(
                        execution_id = %execution_id,
                        stream = %stream,
                        error = %e,
                        "Consumer cycle failed for execution"
                    );
                }
            }
        }

        self.inner
            .metrics
            .cycle_completed(started.elapsed(), report.errors > 0);
        if report.found_work() {
            debug!(?report, "Consumer cycle complete");
        }
        report
    }

    async fn poll_execution(
        &self,
        execution_id: &str,
        stream: &str,
        handler: &Arc<dyn EventHandler>,
        block_ms: Option<u64>,
    ) -> Result<CycleReport, StreamError> {
        let transport = &self.inner.transport;
        let batch_size = self.inner.settings.batch_size;
        let mut report = CycleReport::default();

        self.inner.groups.ensure_stream_and_group(stream).await?;

        if transport.pending_count(stream).await? > 0 {
            let pending = transport
                .read_group(stream, ReadCursor::Pending, batch_size, None)
                .await?;
            if !pending.is_empty() {
                debug!(stream = %stream, count = pending.len(), "Re-reading pending messages");
                report.merge(self.process_batch(execution_id, stream, handler, pending).await);
            }
        }

        let fresh = transport
            .read_group(stream, ReadCursor::New, batch_size, block_ms)
            .await?;
        if !fresh.is_empty() {
            report.merge(self.process_batch(execution_id, stream, handler, fresh).await);
        }

        if self.claim_due(execution_id) {
            let claimed = transport
                .claim_stale(stream, self.inner.settings.claim_idle_ms, batch_size)
                .await?;
            if !claimed.is_empty() {
                warn!(stream = %stream, count = claimed.len(), "Claimed stale messages");
                self.inner.metrics.messages_claimed(claimed.len());
                report.claimed += claimed.len();
                report.merge(self.process_batch(execution_id, stream, handler, claimed).await);
            }
        }

        Ok(report)
    }

    fn claim_due(&self, execution_id: &str) -> bool {
        let interval = self.inner.settings.claim_interval();
        let now = Instant::now();
        let mut last_claim = self.last_claim();
        match last_claim.get(execution_id) {
            Some(last) if now.duration_since(*last) < interval => false,
            _ => {
                last_claim.insert(execution_id.to_string(), now);
                true
            }
        }
    }

    async fn process_batch(
        &self,
        execution_id: &str,
        stream: &str,
        handler: &Arc<dyn EventHandler>,
        messages: Vec<StreamMessage>,
    ) -> CycleReport {
        let outcomes = join_all(
            messages
                .into_iter()
                .map(|message| self.process_message(execution_id, stream, handler.clone(), message)),
        )
        .await;

        let mut report = CycleReport::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Processed => report.processed += 1,
                Outcome::Failed { dead_lettered } => {
                    report.failed += 1;
                    if dead_lettered {
                        report.dead_lettered += 1;
                    }
                }
                Outcome::TransportError => report.errors += 1,
            }
        }
        report
    }

    async fn process_message(
        &self,
        execution_id: &str,
        stream: &str,
        handler: Arc<dyn EventHandler>,
        message: StreamMessage,
    ) -> Outcome {
        let transport = &self.inner.transport;

        if message.is_tombstone() {
            warn!(stream = %stream, message_id = %message.id, "Acknowledging trimmed pending entry");
            return match transport.ack(stream, &[message.id.as_str()]).await {
                Ok(_) => Outcome::Processed,
                Err(e) => {
                    error!(stream = %stream, message_id = %message.id, error = %e, "Failed to ack trimmed entry");
                    Outcome::TransportError
                }
            };
        }

        let started = Instant::now();
        let result = match decode(&message) {
            Ok(event) => {
                let incoming = IncomingEvent {
                    stream: stream.to_string(),
                    message_id: message.id.clone(),
                    event,
                };
                invoke(handler, incoming).await
            }
            Err(e) => Err(HandlerFailure {
                reason: "invalid_event",
                error: eyre!(e),
            }),
        };

        match result {
            Ok(()) => match transport.ack(stream, &[message.id.as_str()]).await {
                Ok(_) => {
                    self.inner.metrics.message_processed(started.elapsed());
                    debug!(stream = %stream, message_id = %message.id, "Message processed");
                    Outcome::Processed
                }
                Err(e) => {
                    error!(stream = %stream, message_id = %message.id, error = %e, "Failed to ack message");
                    Outcome::TransportError
                }
            },
            Err(failure) => {
                self.inner.metrics.message_failed(failure.reason);
                self.handle_failure(execution_id, stream, &message, failure.error)
                    .await
            }
        }
    }

    async fn handle_failure(
        &self,
        execution_id: &str,
        stream: &str,
        message: &StreamMessage,
        error: eyre::Report,
    ) -> Outcome {
        let entry = match self.inner.transport.pending_entry(stream, &message.id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(stream = %stream, message_id = %message.id, "Failed message no longer pending");
                return Outcome::Failed { dead_lettered: false };
            }
            Err(e) => {
                error!(stream = %stream, message_id = %message.id, error = %e, "Failed to read delivery count");
                return Outcome::TransportError;
            }
        };

        let max_retries = u64::from(self.inner.settings.max_retries);
        if entry.delivery_count >= max_retries {
            let moved = self
                .inner
                .dlq
                .move_to_dead_letter_queue(execution_id, &message.id, message, &error)
                .await;
            return Outcome::Failed {
                dead_lettered: moved,
            };
        }

        warn!(
            stream = %stream,
            message_id = %message.id,
            delivery_count = entry.delivery_count,
            max_retries,
            error = %error,
            "Handler failed, message left pending for retry"
        );
        Outcome::Failed {
            dead_lettered: false,
        }
    }

    fn handlers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn EventHandler>>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handlers_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn EventHandler>>> {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn last_claim(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.inner
            .last_claim
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct HandlerFailure {
    reason: &'static str,
    error: eyre::Report,
}

fn decode(message: &StreamMessage) -> Result<WorkflowEvent, StreamError> {
    let payload = message.payload().ok_or_else(|| {
        StreamError::InvalidEvent(format!("message {} has no event field", message.id))
    })?;
    WorkflowEvent::parse(payload)
}

/// Run the handler on its own task so a panic is contained as a failure
async fn invoke(
    handler: Arc<dyn EventHandler>,
    incoming: IncomingEvent,
) -> Result<(), HandlerFailure> {
    let name = handler.name();
    match tokio::spawn(async move { handler.handle(incoming).await }).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(HandlerFailure {
            reason: "handler",
            error,
        }),
        Err(join_error) => Err(HandlerFailure {
            reason: "panic",
            error: eyre!("handler {} panicked: {}", name, join_error),
        }),
    }
}
