//! Thin wrapper over the Redis Streams commands used by the core
//!
//! Every call clones the shared [`ConnectionManager`]; the clone is cheap and
//! multiplexes onto the same connection. Blocking reads go to a separate
//! reader connection when one is attached, and are sent without BLOCK
//! otherwise.

use crate::error::StreamError;
use crate::message::{StreamMessage, parse_stream_id};
use redis::aio::ConnectionManager;
use redis::streams::{StreamAutoClaimReply, StreamClaimReply, StreamRangeReply, StreamReadReply};
use redis::RedisResult;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// PEL rows fetched per XPENDING call when scanning for claim candidates
const CLAIM_SCAN_PAGE: usize = 100;

/// Where an XREADGROUP call starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries already delivered to this consumer but not acknowledged (`0`)
    Pending,
    /// Entries never delivered to any consumer in the group (`>`)
    New,
}

impl ReadCursor {
    fn as_arg(self) -> &'static str {
        match self {
            ReadCursor::Pending => "0",
            ReadCursor::New => ">",
        }
    }
}

/// One row of the pending entries list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// Summary counters for a stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub stream: String,
    pub length: u64,
    pub pending: u64,
    pub first_entry_id: Option<String>,
    pub last_entry_id: Option<String>,
}

/// Redis Streams client bound to one consumer group and consumer identity
#[derive(Clone)]
pub struct StreamTransport {
    redis: ConnectionManager,
    reader: Option<ConnectionManager>,
    group: String,
    consumer_id: String,
    autoclaim_supported: Arc<AtomicBool>,
}

impl StreamTransport {
    pub fn new(
        redis: ConnectionManager,
        group: impl Into<String>,
        consumer_id: impl Into<String>,
    ) -> Self {
        Self {
            redis,
            reader: None,
            group: group.into(),
            consumer_id: consumer_id.into(),
            autoclaim_supported: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Attach a dedicated connection for `XREADGROUP ... BLOCK`
    ///
    /// Its response timeout must outlast the block timeout. Without a reader,
    /// `block_ms` is ignored and reads return immediately.
    pub fn with_blocking_reader(mut self, reader: ConnectionManager) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn has_blocking_reader(&self) -> bool {
        self.reader.is_some()
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn connection(&self) -> ConnectionManager {
        self.redis.clone()
    }

    /// XADD with approximate trimming; returns the assigned id
    pub async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        max_length: Option<usize>,
    ) -> Result<String, StreamError> {
        let mut conn = self.redis.clone();

        let id: String = append_cmd(stream, fields, max_length)
            .query_async(&mut conn)
            .await?;

        debug!(stream = %stream, message_id = %id, "Appended to stream");
        Ok(id)
    }

    /// XGROUP CREATE at `0` with MKSTREAM
    ///
    /// Returns `false` when the group already existed.
    pub async fn create_group(&self, stream: &str) -> Result<bool, StreamError> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %stream, group = %self.group, "Created consumer group");
                Ok(true)
            }
            Err(e) => {
                let err = StreamError::Redis(e);
                if err.is_busygroup() {
                    debug!(stream = %stream, group = %self.group, "Consumer group already exists");
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// XREADGROUP for this consumer
    ///
    /// `block_ms` is only honoured for [`ReadCursor::New`] on a transport with
    /// a blocking reader; pending reads never block.
    pub async fn read_group(
        &self,
        stream: &str,
        cursor: ReadCursor,
        count: usize,
        block_ms: Option<u64>,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let block_ms = match cursor {
            ReadCursor::New => block_ms.filter(|_| self.reader.is_some()),
            ReadCursor::Pending => None,
        };
        let mut conn = match (&self.reader, block_ms) {
            (Some(reader), Some(_)) => reader.clone(),
            _ => self.redis.clone(),
        };

        let cmd = read_cmd(&self.group, &self.consumer_id, stream, cursor, count, block_ms);

        // nil when BLOCK times out with nothing new
        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(StreamMessage::from)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// XACK; returns how many entries were removed from the PEL
    pub async fn ack(&self, stream: &str, ids: &[&str]) -> Result<u64, StreamError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.redis.clone();

        let acked: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(&self.group)
            .arg(ids)
            .query_async(&mut conn)
            .await?;

        debug!(stream = %stream, count = acked, "Acknowledged messages");
        Ok(acked)
    }

    /// Total pending entries for the group (XPENDING summary form)
    pub async fn pending_count(&self, stream: &str) -> Result<u64, StreamError> {
        let mut conn = self.redis.clone();

        let (count, _, _, _): (u64, Option<String>, Option<String>, Option<Vec<(String, u64)>>) =
            redis::cmd("XPENDING")
                .arg(stream)
                .arg(&self.group)
                .query_async(&mut conn)
                .await?;

        Ok(count)
    }

    /// Pending entries, oldest first, optionally filtered to one consumer
    pub async fn pending_entries(
        &self,
        stream: &str,
        count: usize,
        consumer: Option<&str>,
    ) -> Result<Vec<PendingEntry>, StreamError> {
        self.pending_range(stream, "-", "+", count, consumer).await
    }

    /// Pending entry for one message id, if it is still pending
    pub async fn pending_entry(
        &self,
        stream: &str,
        id: &str,
    ) -> Result<Option<PendingEntry>, StreamError> {
        Ok(self
            .pending_range(stream, id, id, 1, None)
            .await?
            .into_iter()
            .next())
    }

    async fn pending_range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
        consumer: Option<&str>,
    ) -> Result<Vec<PendingEntry>, StreamError> {
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream)
            .arg(&self.group)
            .arg(start)
            .arg(end)
            .arg(count);
        if let Some(consumer) = consumer {
            cmd.arg(consumer);
        }

        let rows: Vec<(String, String, u64, u64)> = cmd.query_async(&mut conn).await?;

        Ok(rows
            .into_iter()
            .map(|(id, consumer, idle_ms, delivery_count)| PendingEntry {
                id,
                consumer,
                idle_ms,
                delivery_count,
            })
            .collect())
    }

    /// Claim entries idle for at least `min_idle_ms` into this consumer
    ///
    /// Uses XAUTOCLAIM; a server that does not know the command is remembered
    /// and served by XPENDING + XCLAIM from then on.
    pub async fn claim_stale(
        &self,
        stream: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        if self.autoclaim_supported.load(Ordering::Relaxed) {
            match self.autoclaim(stream, min_idle_ms, count).await {
                Ok(claimed) => return Ok(claimed),
                Err(e) if e.is_unknown_command() => {
                    warn!("XAUTOCLAIM not supported by server, falling back to XCLAIM");
                    self.autoclaim_supported.store(false, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }

        self.claim_with_xclaim(stream, min_idle_ms, count).await
    }

    pub fn autoclaim_supported(&self) -> bool {
        self.autoclaim_supported.load(Ordering::Relaxed)
    }

    async fn autoclaim(
        &self,
        stream: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut conn = self.redis.clone();

        let reply: Option<StreamAutoClaimReply> = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(&self.group)
            .arg(&self.consumer_id)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let Some(reply) = reply else {
            return Ok(vec![]);
        };

        if !reply.deleted_ids.is_empty() {
            debug!(
                stream = %stream,
                count = reply.deleted_ids.len(),
                "Dropped deleted entries from PEL during claim"
            );
        }

        Ok(reply.claimed.into_iter().map(StreamMessage::from).collect())
    }

    async fn claim_with_xclaim(
        &self,
        stream: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut candidates: Vec<String> = Vec::new();
        let mut start = "-".to_string();

        // XPENDING is ordered by id, not idle time, so fresh entries can sit
        // ahead of stale ones; page until enough candidates or the PEL ends
        loop {
            let page = self
                .pending_range(stream, &start, "+", CLAIM_SCAN_PAGE, None)
                .await?;
            let exhausted = page.len() < CLAIM_SCAN_PAGE;
            let Some(last_id) = page.last().map(|entry| entry.id.clone()) else {
                break;
            };

            candidates.extend(
                page.into_iter()
                    .filter(|entry| {
                        entry.idle_ms >= min_idle_ms && entry.consumer != self.consumer_id
                    })
                    .map(|entry| entry.id),
            );

            if candidates.len() >= count || exhausted {
                break;
            }
            match next_stream_id(&last_id) {
                Some(next) => start = next,
                None => break,
            }
        }
        candidates.truncate(count);

        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(&self.group)
            .arg(&self.consumer_id)
            .arg(min_idle_ms);
        for id in &candidates {
            cmd.arg(id);
        }

        let reply: StreamClaimReply = cmd.query_async(&mut conn).await?;
        Ok(reply.ids.into_iter().map(StreamMessage::from).collect())
    }

    /// XRANGE, oldest first
    pub async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut conn = self.redis.clone();

        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(stream)
            .arg(start)
            .arg(end)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(reply.ids.into_iter().map(StreamMessage::from).collect())
    }

    /// XREVRANGE, newest first
    pub async fn rev_range(
        &self,
        stream: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut conn = self.redis.clone();

        let reply: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(reply.ids.into_iter().map(StreamMessage::from).collect())
    }

    /// XDEL; returns the number of entries removed
    pub async fn delete(&self, stream: &str, id: &str) -> Result<u64, StreamError> {
        let mut conn = self.redis.clone();

        let deleted: u64 = redis::cmd("XDEL")
            .arg(stream)
            .arg(id)
            .query_async(&mut conn)
            .await?;

        Ok(deleted)
    }

    /// XLEN (0 for a missing stream)
    pub async fn length(&self, stream: &str) -> Result<u64, StreamError> {
        let mut conn = self.redis.clone();

        let len: u64 = redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut conn)
            .await?;

        Ok(len)
    }

    /// Names of the consumer groups attached to a stream
    pub async fn group_names(&self, stream: &str) -> Result<Vec<String>, StreamError> {
        let mut conn = self.redis.clone();

        let reply: redis::streams::StreamInfoGroupsReply = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut conn)
            .await?;

        Ok(reply.groups.into_iter().map(|g| g.name).collect())
    }

    /// XADD to `dest` and XACK `id` on `source` in one MULTI/EXEC
    ///
    /// Returns the id assigned on `dest`.
    pub async fn append_and_ack(
        &self,
        dest: &str,
        fields: &[(&str, &str)],
        source: &str,
        id: &str,
    ) -> Result<String, StreamError> {
        let mut conn = self.redis.clone();

        let (new_id,): (String,) = append_and_ack_pipe(dest, fields, source, &self.group, id)
            .query_async(&mut conn)
            .await?;

        debug!(dest = %dest, source = %source, message_id = %id, new_id = %new_id, "Moved entry");
        Ok(new_id)
    }

    /// Length, pending count and boundary ids for a stream
    pub async fn stream_stats(&self, stream: &str) -> Result<StreamStats, StreamError> {
        let length = self.length(stream).await?;
        if length == 0 {
            return Ok(StreamStats {
                stream: stream.to_string(),
                ..Default::default()
            });
        }

        let pending = match self.pending_count(stream).await {
            Ok(count) => count,
            Err(e) if e.is_nogroup() => 0,
            Err(e) => return Err(e),
        };
        let first_entry_id = self.range(stream, "-", "+", 1).await?.pop().map(|m| m.id);
        let last_entry_id = self.rev_range(stream, 1).await?.pop().map(|m| m.id);

        Ok(StreamStats {
            stream: stream.to_string(),
            length,
            pending,
            first_entry_id,
            last_entry_id,
        })
    }
}

/// Build an XADD, trimming with `MAXLEN ~` when a bound is given
pub(crate) fn append_cmd(
    stream: &str,
    fields: &[(&str, &str)],
    max_length: Option<usize>,
) -> redis::Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream);
    if let Some(max_length) = max_length {
        cmd.arg("MAXLEN").arg("~").arg(max_length);
    }
    cmd.arg("*");
    for (field, value) in fields {
        cmd.arg(*field).arg(*value);
    }
    cmd
}

fn read_cmd(
    group: &str,
    consumer_id: &str,
    stream: &str,
    cursor: ReadCursor,
    count: usize,
    block_ms: Option<u64>,
) -> redis::Cmd {
    let mut cmd = redis::cmd("XREADGROUP");
    cmd.arg("GROUP").arg(group).arg(consumer_id);
    if let Some(timeout) = block_ms {
        cmd.arg("BLOCK").arg(timeout);
    }
    cmd.arg("COUNT")
        .arg(count)
        .arg("STREAMS")
        .arg(stream)
        .arg(cursor.as_arg());
    cmd
}

fn append_and_ack_pipe(
    dest: &str,
    fields: &[(&str, &str)],
    source: &str,
    group: &str,
    id: &str,
) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .add_command(append_cmd(dest, fields, None))
        .cmd("XACK")
        .arg(source)
        .arg(group)
        .arg(id)
        .ignore();
    pipe
}

/// Smallest id strictly greater than `id`, for paging without exclusive ranges
fn next_stream_id(id: &str) -> Option<String> {
    let (ms, seq) = parse_stream_id(id)?;
    match seq.checked_add(1) {
        Some(seq) => Some(format!("{}-{}", ms, seq)),
        None => ms.checked_add(1).map(|ms| format!("{}-0", ms)),
    }
}
