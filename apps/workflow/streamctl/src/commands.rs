use eyre::{Result, WrapErr, bail};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::info;
use workflow_streams::{StreamStats, WorkflowEvent, WorkflowStreams};

pub async fn publish(
    streams: &WorkflowStreams,
    execution_id: &str,
    name: &str,
    data: &str,
    event_id: Option<String>,
) -> Result<()> {
    let fields = parse_fields(data)?;
    let mut event = WorkflowEvent::from_fields(execution_id, name, fields);
    if let Some(event_id) = event_id {
        event = event.with_event_id(event_id);
    }

    let message_id = streams.publisher().publish_event(&event).await?;
    println!("{}", message_id);
    Ok(())
}

pub async fn tail(streams: &WorkflowStreams, execution_id: &str, capacity: usize) -> Result<()> {
    let mut deliveries = streams
        .consumer()
        .register_channel(execution_id, capacity.max(1));
    info!(execution_id = %execution_id, "Tailing, Ctrl-C to stop");

    loop {
        tokio::select! {
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else { break };
                let encoded = delivery.event().to_json();
                match encoded {
                    Ok(json) => {
                        println!("{} {}", delivery.incoming.message_id, json);
                        delivery.ack();
                    }
                    Err(e) => delivery.nack(eyre::Report::new(e)),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    streams.shutdown().await;
    Ok(())
}

pub async fn dlq_list(streams: &WorkflowStreams, execution_id: &str, count: usize) -> Result<()> {
    let entries = streams
        .dlq()
        .list_dead_letter_queue_messages(execution_id, count)
        .await?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

pub async fn dlq_stats(streams: &WorkflowStreams, execution_id: &str) -> Result<()> {
    let stats = streams.dlq().dead_letter_stats(execution_id).await?;
    print_stats(&stats);
    Ok(())
}

pub async fn dlq_reprocess(
    streams: &WorkflowStreams,
    execution_id: &str,
    dlq_message_id: &str,
) -> Result<()> {
    match streams.dlq().reprocess(execution_id, dlq_message_id).await? {
        Some(message_id) => {
            println!("{}", message_id);
            Ok(())
        }
        None => bail!("DLQ message {} not found for {}", dlq_message_id, execution_id),
    }
}

pub async fn info(streams: &WorkflowStreams, execution_id: &str) -> Result<()> {
    let stream = streams.settings().stream_name(execution_id);
    let stats = streams.stream_stats(execution_id).await?;
    let groups = if stats.length > 0 {
        streams.transport().group_names(&stream).await?
    } else {
        Vec::new()
    };
    let dlq = streams.dlq().dead_letter_stats(execution_id).await?;

    print_stats(&stats);
    println!("groups:   {}", groups.join(", "));
    print_stats(&dlq);
    Ok(())
}

pub async fn lock_acquire(
    streams: &WorkflowStreams,
    key: &str,
    owner: &str,
    ttl_ms: u64,
) -> Result<()> {
    let acquired = streams
        .locks()
        .acquire_lock(key, owner, Duration::from_millis(ttl_ms))
        .await?;
    if !acquired {
        let holder = streams.locks().lock_owner(key).await?;
        bail!(
            "lock {} is held by {}",
            key,
            holder.as_deref().unwrap_or("<expired>")
        );
    }
    println!("acquired");
    Ok(())
}

pub async fn lock_release(streams: &WorkflowStreams, key: &str, owner: &str) -> Result<()> {
    if !streams.locks().release_lock(key, owner).await? {
        bail!("lock {} is not held by {}", key, owner);
    }
    println!("released");
    Ok(())
}

pub async fn lock_extend(
    streams: &WorkflowStreams,
    key: &str,
    owner: &str,
    ttl_ms: u64,
) -> Result<()> {
    let extended = streams
        .locks()
        .extend_lock(key, owner, Duration::from_millis(ttl_ms))
        .await?;
    if !extended {
        bail!("lock {} is not held by {}", key, owner);
    }
    println!("extended");
    Ok(())
}

pub async fn lock_show(streams: &WorkflowStreams, key: &str) -> Result<()> {
    let owner = streams.locks().lock_owner(key).await?;
    let ttl = streams.locks().lock_ttl(key).await?;
    match (owner, ttl) {
        (Some(owner), Some(ttl)) => println!("{} held by {} ({}ms left)", key, owner, ttl.as_millis()),
        (Some(owner), None) => println!("{} held by {} (no expiry)", key, owner),
        _ => println!("{} is free", key),
    }
    Ok(())
}

fn print_stats(stats: &StreamStats) {
    println!("stream:   {}", stats.stream);
    println!("length:   {}", stats.length);
    println!("pending:  {}", stats.pending);
    println!(
        "range:    {} .. {}",
        stats.first_entry_id.as_deref().unwrap_or("-"),
        stats.last_entry_id.as_deref().unwrap_or("-")
    );
}

fn parse_fields(data: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(data).wrap_err("--data is not valid JSON")?;
    match value {
        Value::Object(fields) => Ok(fields),
        other => bail!("--data must be a JSON object, got {}", other),
    }
}
