//! Event handlers
//!
//! The consumer loop hands each parsed event to an [`EventHandler`]. Returning
//! `Ok` acknowledges the message; returning `Err` leaves it pending so it is
//! retried and, past the retry ceiling, dead-lettered with the error.
//!
//! Handlers can be plain trait impls, closures via [`handler_fn`], or a
//! channel via [`ChannelHandler`], which lets a separate task own processing
//! and answer each [`Delivery`] with [`Delivery::ack`] or [`Delivery::nack`].

use crate::event::WorkflowEvent;
use async_trait::async_trait;
use eyre::eyre;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};

/// A parsed event together with where it came from
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub stream: String,
    pub message_id: String,
    pub event: WorkflowEvent,
}

/// Processes events for one execution
///
/// # Example
///
/// ```rust,ignore
/// struct Executor { machine: Arc<StateMachine> }
///
/// #[async_trait]
/// impl EventHandler for Executor {
///     async fn handle(&self, incoming: IncomingEvent) -> eyre::Result<()> {
///         self.machine.apply(&incoming.event).await
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, incoming: IncomingEvent) -> eyre::Result<()>;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "EventHandler"
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as an [`EventHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(IncomingEvent) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<()>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(IncomingEvent) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<()>> + Send,
{
    async fn handle(&self, incoming: IncomingEvent) -> eyre::Result<()> {
        (self.f)(incoming).await
    }

    fn name(&self) -> &'static str {
        "FnHandler"
    }
}

/// An event waiting for a verdict from the receiving task
#[derive(Debug)]
pub struct Delivery {
    pub incoming: IncomingEvent,
    reply: oneshot::Sender<eyre::Result<()>>,
}

impl Delivery {
    pub fn event(&self) -> &WorkflowEvent {
        &self.incoming.event
    }

    /// Mark the event as handled
    pub fn ack(self) {
        let _ = self.reply.send(Ok(()));
    }

    /// Mark the event as failed; it will be retried or dead-lettered
    pub fn nack(self, error: eyre::Report) {
        let _ = self.reply.send(Err(error));
    }
}

/// Forwards events over a bounded channel and waits for the verdict
///
/// A full channel applies backpressure to the consumer loop. A closed
/// receiver, or a [`Delivery`] dropped without a verdict, counts as failure.
#[derive(Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<Delivery>,
}

impl ChannelHandler {
    /// Create a handler and the receiving end of its channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn handle(&self, incoming: IncomingEvent) -> eyre::Result<()> {
        let (reply, verdict) = oneshot::channel();
        self.tx
            .send(Delivery { incoming, reply })
            .await
            .map_err(|_| eyre!("event receiver closed"))?;

        verdict
            .await
            .map_err(|_| eyre!("delivery dropped without ack or nack"))?
    }

    fn name(&self) -> &'static str {
        "ChannelHandler"
    }
}
