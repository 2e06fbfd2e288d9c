//! Integration tests against a real Redis

use eyre::eyre;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use test_utils::assertions::{assert_some, eventually};
use test_utils::{TestDataBuilder, TestRedis};
use workflow_streams::{
    EventPayload, EventHandler, IncomingEvent, RedisSettings, StreamSettings, TaskCompleted,
    TicketCreated, WorkflowEvent, WorkflowStreams, handler_fn, parse_stream_id,
};

/// Settings tuned for fast, deterministic cycles
fn test_settings(consumer_id: &str) -> StreamSettings {
    StreamSettings::new()
        .with_consumer_id(consumer_id)
        .with_blocking(None)
        .with_poll_interval_ms(10)
        .with_error_backoff_ms(50)
}

fn ticket(execution_id: &str, event_id: &str) -> WorkflowEvent {
    WorkflowEvent::new(
        execution_id,
        EventPayload::TicketCreated(TicketCreated {
            ticket_id: Some(format!("T-{}", event_id)),
            ..Default::default()
        }),
    )
    .with_event_id(event_id)
}

fn always_ok() -> Arc<dyn EventHandler> {
    Arc::new(handler_fn(|_incoming: IncomingEvent| async { Ok::<(), eyre::Report>(()) }))
}

fn always_fail() -> Arc<dyn EventHandler> {
    Arc::new(handler_fn(|_incoming: IncomingEvent| async {
        Err(eyre!("executor unavailable"))
    }))
}

mod publish_tests {
    use super::*;

    #[tokio::test]
    async fn test_events_read_back_in_publish_order() {
        let redis = TestRedis::new().await;
        let builder = TestDataBuilder::from_test_name("publish_order");
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-order"));
        let x1 = builder.execution_id("x1");
        let x2 = builder.execution_id("x2");

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                streams
                    .publisher()
                    .publish_event(&ticket(&x1, &format!("e{}", i)))
                    .await
                    .unwrap(),
            );
            // Interleave another execution; it must not affect x1's order
            streams
                .publisher()
                .publish_event(&ticket(&x2, &format!("other{}", i)))
                .await
                .unwrap();
        }

        let stream = streams.settings().stream_name(&x1);
        let messages = streams.transport().range(&stream, "-", "+", 100).await.unwrap();

        assert_eq!(messages.len(), 5);
        let read_ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(read_ids, ids.iter().map(String::as_str).collect::<Vec<_>>());
        for pair in messages.windows(2) {
            assert!(parse_stream_id(&pair[0].id) < parse_stream_id(&pair[1].id));
        }
        let event_ids: Vec<String> = messages
            .iter()
            .map(|m| WorkflowEvent::parse(m.payload().unwrap()).unwrap().event_id)
            .collect();
        assert_eq!(event_ids, vec!["e0", "e1", "e2", "e3", "e4"]);
    }

    #[tokio::test]
    async fn test_publish_creates_stream_and_group() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-create"));

        streams.publisher().publish_event(&ticket("x1", "e1")).await.unwrap();

        let stream = streams.settings().stream_name("x1");
        assert_eq!(stream, "workflow:events:x1");
        assert!(streams.groups().is_known(&stream));
        assert_eq!(
            streams.transport().group_names(&stream).await.unwrap(),
            vec!["workflow-processors".to_string()]
        );
    }

    #[tokio::test]
    async fn test_publish_events_pipeline_keeps_order() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-batch"));

        let events = vec![
            ticket("a", "a1"),
            ticket("b", "b1"),
            ticket("a", "a2"),
            ticket("a", "a3"),
        ];
        let ids = streams.publisher().publish_events(&events).await.unwrap();
        assert_eq!(ids.len(), 4);

        let a_stream = streams.settings().stream_name("a");
        let a_ids: Vec<String> = streams
            .transport()
            .range(&a_stream, "-", "+", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(a_ids, vec![ids[0].clone(), ids[2].clone(), ids[3].clone()]);
        assert!(streams.publisher().publish_events(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_is_trimmed_approximately() {
        let redis = TestRedis::new().await;
        let settings = test_settings("consumer-trim").with_max_length(10);
        let streams = WorkflowStreams::new(redis.connection(), settings);

        let events: Vec<WorkflowEvent> = (0..500)
            .map(|i| ticket("trim", &format!("e{}", i)))
            .collect();
        streams.publisher().publish_events(&events).await.unwrap();

        let stats = streams.stream_stats("trim").await.unwrap();
        assert!(stats.length < 500, "stream was not trimmed: {}", stats.length);
        assert!(stats.length >= 10);
    }
}

mod group_tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_ensure_creates_one_group() {
        let redis = TestRedis::new().await;
        let stream = "workflow:events:race";

        // Separate handles so every caller misses its memo and hits the server
        let handles: Vec<WorkflowStreams> = (0..10)
            .map(|i| {
                WorkflowStreams::new(redis.connection(), test_settings(&format!("consumer-{}", i)))
            })
            .collect();

        let results = futures::future::join_all(
            handles
                .iter()
                .map(|streams| streams.groups().ensure_stream_and_group(stream)),
        )
        .await;

        for result in results {
            assert!(result.is_ok(), "ensure failed: {:?}", result);
        }
        let groups = handles[0].transport().group_names(stream).await.unwrap();
        assert_eq!(groups, vec!["workflow-processors".to_string()]);
        assert_eq!(handles[0].transport().length(stream).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deleted_stream_group_is_recreated() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-nogroup"));
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = processed.clone();
        streams.consumer().attach(
            "x1",
            Arc::new(handler_fn(move |_incoming: IncomingEvent| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), eyre::Report>(())
                }
            })),
        );

        streams.publisher().publish_event(&ticket("x1", "e1")).await.unwrap();
        assert_eq!(streams.consumer().poll_once().await.processed, 1);

        // Stream vanishes; the memo still believes the group exists
        let mut conn = redis.connection();
        let _: () = redis::cmd("DEL")
            .arg("workflow:events:x1")
            .query_async(&mut conn)
            .await
            .unwrap();
        streams.publisher().publish_event(&ticket("x1", "e2")).await.unwrap();

        let report = streams.consumer().poll_once().await;
        assert_eq!(report.errors, 1);
        assert!(!streams.groups().is_known("workflow:events:x1"));

        let report = streams.consumer().poll_once().await;
        assert_eq!(report.errors, 0);
        assert_eq!(report.processed, 1);
        assert_eq!(processed.load(Ordering::SeqCst), 2);
    }
}

mod consumer_tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_handler_is_dead_lettered_after_three_cycles() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-dlq"));

        let message_id = streams
            .publisher()
            .publish_event(&ticket("x1", "e1"))
            .await
            .unwrap();
        streams.consumer().attach("x1", always_fail());

        let first = streams.consumer().poll_once().await;
        assert_eq!((first.failed, first.dead_lettered), (1, 0));
        let second = streams.consumer().poll_once().await;
        assert_eq!((second.failed, second.dead_lettered), (1, 0));
        let third = streams.consumer().poll_once().await;
        assert_eq!((third.failed, third.dead_lettered), (1, 1));

        let entries = streams
            .dlq()
            .list_dead_letter_queue_messages("x1", 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.original_id, message_id);
        assert_eq!(entries[0].record.source_stream, "workflow:events:x1");
        assert_eq!(entries[0].record.error_message, "executor unavailable");
        assert!(entries[0].record.original_message.contains("\"e1\""));

        let stream = streams.settings().stream_name("x1");
        assert_eq!(streams.transport().pending_count(&stream).await.unwrap(), 0);

        // Nothing left to do
        let fourth = streams.consumer().poll_once().await;
        assert!(!fourth.found_work());
    }

    #[tokio::test]
    async fn test_failed_message_is_redelivered() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-retry"));
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let log = seen.clone();

        streams.consumer().attach(
            "x1",
            Arc::new(handler_fn(move |incoming: IncomingEvent| {
                let log = log.clone();
                async move {
                    let mut log = log.lock().unwrap();
                    log.push(incoming.message_id.clone());
                    if log.len() == 1 {
                        Err(eyre!("transient"))
                    } else {
                        Ok(())
                    }
                }
            })),
        );

        let message_id = streams
            .publisher()
            .publish_event(&ticket("x1", "e1"))
            .await
            .unwrap();

        assert_eq!(streams.consumer().poll_once().await.failed, 1);
        let stream = streams.settings().stream_name("x1");
        let pending = streams
            .transport()
            .pending_entry(&stream, &message_id)
            .await
            .unwrap()
            .expect("message should stay pending after failure");
        assert_eq!(pending.consumer, "consumer-retry");
        assert_eq!(pending.delivery_count, 1);

        assert_eq!(streams.consumer().poll_once().await.processed, 1);
        assert_eq!(*seen.lock().unwrap(), vec![message_id.clone(), message_id]);
        assert_eq!(streams.transport().pending_count(&stream).await.unwrap(), 0);
        assert_eq!(
            streams.dlq().dead_letter_stats("x1").await.unwrap().length,
            0
        );
    }

    #[tokio::test]
    async fn test_batch_is_processed_concurrently() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-batch"));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (in_flight_h, peak_h) = (in_flight.clone(), peak.clone());
        streams.consumer().attach(
            "x1",
            Arc::new(handler_fn(move |_incoming: IncomingEvent| {
                let (in_flight, peak) = (in_flight_h.clone(), peak_h.clone());
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), eyre::Report>(())
                }
            })),
        );

        for i in 0..5 {
            streams
                .publisher()
                .publish_event(&ticket("x1", &format!("e{}", i)))
                .await
                .unwrap();
        }

        assert_eq!(streams.consumer().poll_once().await.processed, 5);
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_poison_message_is_dead_lettered_with_parse_error() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-poison"));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        streams.consumer().attach(
            "x1",
            Arc::new(handler_fn(move |_incoming: IncomingEvent| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), eyre::Report>(())
                }
            })),
        );

        let stream = streams.settings().stream_name("x1");
        streams.groups().ensure_stream_and_group(&stream).await.unwrap();
        streams
            .transport()
            .append(&stream, &[("event", "not json")], None)
            .await
            .unwrap();

        for _ in 0..3 {
            streams.consumer().poll_once().await;
        }

        let entries = streams
            .dlq()
            .list_dead_letter_queue_messages("x1", 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].record.error_message.contains("Invalid event"));
        assert_eq!(entries[0].record.original_message, "not json");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_channel_consumer_acks_through_loop() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-channel"));

        let mut rx = streams.consumer().register_channel("x1", 8);
        assert!(streams.consumer().is_running());

        let event = WorkflowEvent::new(
            "x1",
            EventPayload::TaskCompleted(TaskCompleted {
                task_id: Some("t1".into()),
                output: Some(json!({"approved": true})),
                ..Default::default()
            }),
        );
        streams.publisher().publish_event(&event).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no delivery within timeout")
            .expect("channel closed");
        assert_eq!(delivery.event().event_id, event.event_id);
        delivery.ack();

        let stream = streams.settings().stream_name("x1");
        let transport = streams.transport().clone();
        eventually(Duration::from_secs(5), "message acknowledged", || {
            let transport = transport.clone();
            let stream = stream.clone();
            async move { transport.pending_count(&stream).await.unwrap() == 0 }
        })
        .await;

        streams.shutdown().await;
        assert!(!streams.consumer().is_running());
    }

    #[tokio::test]
    async fn test_trimmed_pending_entry_is_acknowledged() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-trimmed"));
        streams.consumer().attach("x1", always_fail());
        let stream = streams.settings().stream_name("x1");
        let id = streams.publisher().publish_event(&ticket("x1", "e1")).await.unwrap();

        assert_eq!(streams.consumer().poll_once().await.failed, 1);
        assert_eq!(streams.transport().pending_count(&stream).await.unwrap(), 1);

        // Entry disappears from the stream while still in the PEL
        assert_eq!(streams.transport().delete(&stream, &id).await.unwrap(), 1);

        let report = streams.consumer().poll_once().await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(streams.transport().pending_count(&stream).await.unwrap(), 0);
        assert_eq!(streams.dlq().dead_letter_stats("x1").await.unwrap().length, 0);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_handler() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-stop"));
        let stream = streams.settings().stream_name("x1");
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        streams.publisher().publish_event(&ticket("x1", "e1")).await.unwrap();

        let (on_start, on_finish) = (started.clone(), finished.clone());
        streams.consumer().register_handler(
            "x1",
            Arc::new(handler_fn(move |_incoming: IncomingEvent| {
                let (on_start, on_finish) = (on_start.clone(), on_finish.clone());
                async move {
                    on_start.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    on_finish.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), eyre::Report>(())
                }
            })),
        );

        eventually(Duration::from_secs(5), "handler started", || {
            let started = started.clone();
            async move { started.load(Ordering::SeqCst) == 1 }
        })
        .await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        streams.shutdown().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!streams.consumer().is_running());
        assert_eq!(streams.transport().pending_count(&stream).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_execution_is_not_polled() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-unreg"));

        streams.consumer().attach("x1", always_ok());
        streams.consumer().attach("x2", always_ok());
        assert_eq!(streams.consumer().registered_executions(), vec!["x1", "x2"]);
        assert!(streams.consumer().unregister_consumer("x2"));
        assert!(!streams.consumer().unregister_consumer("x2"));

        streams.publisher().publish_event(&ticket("x2", "e1")).await.unwrap();
        let report = streams.consumer().poll_once().await;
        assert_eq!(report.executions, 1);
        assert_eq!(report.processed, 0);

        let stats = streams.stream_stats("x2").await.unwrap();
        assert_eq!(stats.length, 1);
        assert_eq!(stats.pending, 0);
    }
}

mod claim_tests {
    use super::*;

    async fn abandoned_message_is_claimed(redis: &TestRedis) -> WorkflowStreams {
        let dead = WorkflowStreams::new(redis.connection(), test_settings("consumer-dead"));
        let stream = dead.settings().stream_name("x1");

        dead.publisher().publish_event(&ticket("x1", "e1")).await.unwrap();
        // Delivered to the dead consumer and never acknowledged
        let taken = dead
            .transport()
            .read_group(&stream, workflow_streams::ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);

        let settings = test_settings("consumer-alive")
            .with_claim_idle_ms(100)
            .with_claim_interval_ms(0);
        let alive = WorkflowStreams::new(redis.connection(), settings);
        alive.consumer().attach("x1", always_ok());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let report = alive.consumer().poll_once().await;
        assert_eq!(report.claimed, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(alive.transport().pending_count(&stream).await.unwrap(), 0);
        alive
    }

    #[tokio::test]
    async fn test_stale_message_claimed_from_dead_consumer() {
        let redis = TestRedis::new().await;
        let alive = abandoned_message_is_claimed(&redis).await;
        assert!(alive.transport().autoclaim_supported());
    }

    #[tokio::test]
    async fn test_claim_falls_back_to_xclaim_on_old_servers() {
        // 6.0 predates XAUTOCLAIM
        let redis = TestRedis::with_tag("6.0-alpine").await;
        let alive = abandoned_message_is_claimed(&redis).await;
        assert!(!alive.transport().autoclaim_supported());
    }

    #[tokio::test]
    async fn test_xclaim_scan_looks_past_fresh_entries() {
        let redis = TestRedis::with_tag("6.0-alpine").await;
        let dead = WorkflowStreams::new(redis.connection(), test_settings("consumer-dead"));
        let stream = dead.settings().stream_name("x1");

        let events: Vec<WorkflowEvent> = (0..4)
            .map(|i| ticket("x1", &format!("e{}", i)))
            .collect();
        let ids = dead.publisher().publish_events(&events).await.unwrap();
        dead.transport()
            .read_group(&stream, workflow_streams::ReadCursor::New, 10, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        // A busy consumer just took the three oldest; only the newest is idle
        let mut conn = redis.connection();
        let _: redis::Value = redis::cmd("XCLAIM")
            .arg(&stream)
            .arg("workflow-processors")
            .arg("consumer-busy")
            .arg(0)
            .arg(&ids[0])
            .arg(&ids[1])
            .arg(&ids[2])
            .query_async(&mut conn)
            .await
            .unwrap();

        let alive = WorkflowStreams::new(
            redis.connection(),
            test_settings("consumer-alive").with_batch_size(2),
        );
        let claimed = alive.transport().claim_stale(&stream, 100, 2).await.unwrap();

        let claimed_ids: Vec<&str> = claimed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(claimed_ids, vec![ids[3].as_str()]);
        assert!(!alive.transport().autoclaim_supported());
    }

    #[tokio::test]
    async fn test_fresh_pending_message_is_not_claimed() {
        let redis = TestRedis::new().await;
        let dead = WorkflowStreams::new(redis.connection(), test_settings("consumer-dead"));
        let stream = dead.settings().stream_name("x1");
        dead.publisher().publish_event(&ticket("x1", "e1")).await.unwrap();
        dead.transport()
            .read_group(&stream, workflow_streams::ReadCursor::New, 10, None)
            .await
            .unwrap();

        let alive = WorkflowStreams::new(redis.connection(), test_settings("consumer-alive"));
        alive.consumer().attach("x1", always_ok());

        let report = alive.consumer().poll_once().await;
        assert_eq!(report.claimed, 0);
        assert_eq!(alive.transport().pending_count(&stream).await.unwrap(), 1);
    }
}

mod dlq_tests {
    use super::*;
    use workflow_streams::StreamMessage;

    async fn dead_letter(streams: &WorkflowStreams, event_id: &str) -> String {
        let id = streams
            .publisher()
            .publish_event(&ticket("x1", event_id))
            .await
            .unwrap();
        let stream = streams.settings().stream_name("x1");
        let message: StreamMessage = assert_some(
            streams
                .transport()
                .range(&stream, &id, &id, 1)
                .await
                .unwrap()
                .pop(),
            "published message",
        );

        assert!(
            streams
                .dlq()
                .move_to_dead_letter_queue("x1", &id, &message, &eyre!("rejected {}", event_id))
                .await
        );
        id
    }

    #[tokio::test]
    async fn test_list_is_oldest_first_and_bounded() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-list"));

        let ids = vec![
            dead_letter(&streams, "e1").await,
            dead_letter(&streams, "e2").await,
            dead_letter(&streams, "e3").await,
        ];

        let page = streams
            .dlq()
            .list_dead_letter_queue_messages("x1", 2)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].record.original_id, ids[0]);
        assert_eq!(page[1].record.original_id, ids[1]);
        assert_eq!(page[1].record.error_message, "rejected e2");

        let stats = streams.dlq().dead_letter_stats("x1").await.unwrap();
        assert_eq!(stats.stream, "workflow:events:x1:dlq");
        assert_eq!(stats.length, 3);
        assert_eq!(stats.first_entry_id.as_deref(), Some(page[0].id.as_str()));
    }

    #[tokio::test]
    async fn test_reprocess_replays_with_new_id() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-replay"));

        let original_id = dead_letter(&streams, "e1").await;
        let entry = assert_some(
            streams
                .dlq()
                .list_dead_letter_queue_messages("x1", 1)
                .await
                .unwrap()
                .pop(),
            "dead-lettered entry",
        );

        let stream = streams.settings().stream_name("x1");
        let before = streams.transport().length(&stream).await.unwrap();

        assert!(
            streams
                .dlq()
                .reprocess_dead_letter_queue_message("x1", &entry.id)
                .await
        );

        assert!(
            streams
                .dlq()
                .list_dead_letter_queue_messages("x1", 10)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(streams.transport().length(&stream).await.unwrap(), before + 1);

        let newest = streams.transport().rev_range(&stream, 1).await.unwrap().pop().unwrap();
        assert_ne!(newest.id, original_id);
        let replayed = WorkflowEvent::parse(newest.payload().unwrap()).unwrap();
        assert_eq!(replayed.event_id, "e1");

        // The replayed message is consumed like any other
        streams.consumer().attach("x1", always_ok());
        assert_eq!(streams.consumer().poll_once().await.processed, 2);
    }

    #[tokio::test]
    async fn test_reprocess_unknown_id_fails() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-missing"));

        assert!(
            !streams
                .dlq()
                .reprocess_dead_letter_queue_message("x1", "1-0")
                .await
        );
        assert!(streams.dlq().reprocess("x1", "1-0").await.unwrap().is_none());
    }
}

mod lock_tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-lock"));
        let locks = streams.locks();
        let ttl = Duration::from_millis(1000);

        assert!(locks.acquire_lock("k", "A", ttl).await.unwrap());
        assert!(!locks.acquire_lock("k", "B", ttl).await.unwrap());
        assert_eq!(locks.lock_owner("k").await.unwrap().as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_release_requires_owner() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-lock"));
        let locks = streams.locks();

        assert!(locks.acquire_lock("k", "A", Duration::from_secs(5)).await.unwrap());

        assert!(!locks.release_lock("k", "B").await.unwrap());
        assert_eq!(locks.lock_owner("k").await.unwrap().as_deref(), Some("A"));

        assert!(locks.release_lock("k", "A").await.unwrap());
        assert_eq!(locks.lock_owner("k").await.unwrap(), None);
        assert!(!locks.release_lock("k", "A").await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_requires_owner() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-lock"));
        let locks = streams.locks();

        assert!(locks.acquire_lock("k", "A", Duration::from_millis(500)).await.unwrap());
        assert!(!locks.extend_lock("k", "B", Duration::from_secs(60)).await.unwrap());
        assert!(locks.lock_ttl("k").await.unwrap().unwrap() <= Duration::from_millis(500));

        assert!(locks.extend_lock("k", "A", Duration::from_secs(60)).await.unwrap());
        assert!(locks.lock_ttl("k").await.unwrap().unwrap() > Duration::from_secs(30));

        assert!(!locks.extend_lock("missing", "A", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_expires() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(redis.connection(), test_settings("consumer-lock"));
        let locks = streams.locks();

        assert!(locks.acquire_lock("k", "A", Duration::from_millis(100)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(locks.lock_ttl("k").await.unwrap().is_none());
        assert!(locks.acquire_lock("k", "B", Duration::from_secs(1)).await.unwrap());
    }
}

mod connection_tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_from_settings() {
        let redis = TestRedis::new().await;
        let settings = RedisSettings::from_url(redis.connection_string()).unwrap();

        let streams = WorkflowStreams::connect(&settings, test_settings("consumer-connect"))
            .await
            .unwrap();

        workflow_streams::ping(&streams.transport().connection()).await.unwrap();
        assert_eq!(streams.settings().consumer_id, "consumer-connect");
        assert!(!streams.transport().has_blocking_reader());
    }

    #[tokio::test]
    async fn test_default_blocking_read_leaves_shared_connection_free() {
        let redis = TestRedis::new().await;
        let settings = RedisSettings::from_url(redis.connection_string()).unwrap();
        let stream_settings = StreamSettings::new().with_consumer_id("consumer-blocking");
        assert_eq!(stream_settings.block_timeout_ms, Some(5000));

        let streams = WorkflowStreams::connect(&settings, stream_settings).await.unwrap();
        assert!(streams.transport().has_blocking_reader());
        streams.consumer().attach("x1", always_ok());
        let stream = streams.settings().stream_name("x1");
        streams.groups().ensure_stream_and_group(&stream).await.unwrap();

        let poller = {
            let streams = streams.clone();
            tokio::spawn(async move { streams.consumer().poll_once().await })
        };
        // Longer than the shared connection's response timeout
        tokio::time::sleep(Duration::from_millis(700)).await;

        let started = std::time::Instant::now();
        streams.publisher().publish_event(&ticket("x1", "e1")).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        let report = poller.await.unwrap();
        assert_eq!(report.errors, 0);
        assert_eq!(report.processed, 1);
        assert_eq!(streams.transport().pending_count(&stream).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_default_settings_on_shared_connection_poll_without_blocking() {
        let redis = TestRedis::new().await;
        let streams = WorkflowStreams::new(
            redis.connection(),
            StreamSettings::new().with_consumer_id("consumer-shared"),
        );
        streams.consumer().attach("x1", always_ok());

        let started = std::time::Instant::now();
        let report = streams.consumer().poll_once().await;

        assert_eq!(report.errors, 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
