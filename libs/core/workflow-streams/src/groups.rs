//! Consumer group bootstrap with a per-process memo

use crate::error::StreamError;
use crate::transport::StreamTransport;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Ensures each stream has the consumer group, at most once per process
///
/// The memo only saves round trips. Group creation is idempotent on the
/// server, so a cold or stale memo costs one redundant XGROUP CREATE.
#[derive(Clone)]
pub struct ConsumerGroups {
    transport: StreamTransport,
    known: Arc<Mutex<HashSet<String>>>,
}

impl ConsumerGroups {
    pub fn new(transport: StreamTransport) -> Self {
        Self {
            transport,
            known: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Create the stream and its group at `0` unless already known
    pub async fn ensure_stream_and_group(&self, stream: &str) -> Result<(), StreamError> {
        if self.is_known(stream) {
            return Ok(());
        }

        self.transport.create_group(stream).await?;
        self.lock_known().insert(stream.to_string());
        debug!(stream = %stream, "Consumer group ensured");
        Ok(())
    }

    /// Drop a stream from the memo so the next call re-creates its group
    pub fn forget(&self, stream: &str) {
        if self.lock_known().remove(stream) {
            debug!(stream = %stream, "Forgot consumer group");
        }
    }

    pub fn is_known(&self, stream: &str) -> bool {
        self.lock_known().contains(stream)
    }

    fn lock_known(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // The set stays valid even if a holder panicked
        self.known.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
