//! Dispatcher behaviour against the in-memory inbox

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use idempotent_consumer::{
    DispatchOutcome, EventHandler, IdempotencyError, IdempotentDispatcher, InMemoryAcknowledger,
    InMemoryInboxStore, InMemoryInboxTransaction, InboundMessage,
};
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

const GROUP: &str = "search-service";

/// Appends the event id to `applied` when the inbox transaction commits.
#[derive(Default)]
struct Projection {
    applied: Arc<Mutex<Vec<String>>>,
    calls: AtomicU32,
    fail: AtomicBool,
}

#[async_trait]
impl EventHandler<InMemoryInboxTransaction> for Projection {
    async fn handle(
        &self,
        msg: &InboundMessage,
        tx: &mut InMemoryInboxTransaction,
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("projection unavailable");
        }
        let applied = self.applied.clone();
        let event_id = msg.event_id()?;
        tx.on_commit(move || applied.lock().push(event_id));
        Ok(())
    }
}

fn message(event_id: &str, offset: i64) -> InboundMessage {
    InboundMessage {
        topic: "identity.user.events".to_string(),
        partition: 0,
        offset,
        key: Some("user-1".to_string()),
        headers: vec![
            ("event_id".to_string(), event_id.to_string()),
            ("event_type".to_string(), "X.v1".to_string()),
        ],
        payload: b"{}".to_vec(),
    }
}

fn dispatcher() -> (
    IdempotentDispatcher<InMemoryInboxStore, Projection>,
    Arc<Projection>,
) {
    let projection = Arc::new(Projection::default());
    let dispatcher = IdempotentDispatcher::from_shared(
        Arc::new(InMemoryInboxStore::new()),
        projection.clone(),
        GROUP,
    );
    (dispatcher, projection)
}

#[tokio::test]
async fn test_identical_message_twice_effect_once_both_acked() {
    let (dispatcher, projection) = dispatcher();
    let ack = InMemoryAcknowledger::new();
    let msg = message("e-1", 5);

    assert_eq!(
        dispatcher.dispatch(&msg, &ack).await.unwrap(),
        DispatchOutcome::Processed
    );
    assert_eq!(
        dispatcher.dispatch(&msg, &ack).await.unwrap(),
        DispatchOutcome::Duplicate
    );

    assert_eq!(*projection.applied.lock(), vec!["e-1".to_string()]);
    assert_eq!(projection.calls.load(Ordering::SeqCst), 1);
    assert_eq!(ack.count(), 2);

    let ledger = dispatcher.store().processed(GROUP);
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].offset, 5);
    assert_eq!(ledger[0].event_type, "X.v1");
}

#[tokio::test]
async fn test_redelivery_on_another_partition_is_duplicate() {
    let (dispatcher, projection) = dispatcher();
    let ack = InMemoryAcknowledger::new();

    dispatcher.dispatch(&message("e-1", 5), &ack).await.unwrap();

    let mut moved = message("e-1", 0);
    moved.partition = 3;
    moved.topic = "identity.user.events.retry".to_string();
    assert!(dispatcher.dispatch(&moved, &ack).await.unwrap().is_duplicate());
    assert_eq!(projection.applied.lock().len(), 1);
}

#[tokio::test]
async fn test_handler_failure_leaves_message_unacked_then_retry_succeeds() {
    let (dispatcher, projection) = dispatcher();
    let ack = InMemoryAcknowledger::new();
    let msg = message("e-1", 5);

    projection.fail.store(true, Ordering::SeqCst);
    let err = dispatcher.dispatch(&msg, &ack).await.unwrap_err();
    assert!(matches!(err, IdempotencyError::HandlerFailed { ref event_id, .. } if event_id == "e-1"));
    assert_eq!(ack.count(), 0);
    assert!(projection.applied.lock().is_empty());
    assert!(!dispatcher.store().contains(GROUP, "e-1"));

    // Redelivery after the handler recovers
    projection.fail.store(false, Ordering::SeqCst);
    assert_eq!(
        dispatcher.dispatch(&msg, &ack).await.unwrap(),
        DispatchOutcome::Processed
    );
    assert_eq!(ack.count(), 1);
    assert_eq!(*projection.applied.lock(), vec!["e-1".to_string()]);
}

#[tokio::test]
async fn test_consumer_groups_are_independent() {
    let store = Arc::new(InMemoryInboxStore::new());
    let search = Arc::new(Projection::default());
    let feed = Arc::new(Projection::default());
    let ack = InMemoryAcknowledger::new();

    let a = IdempotentDispatcher::from_shared(store.clone(), search.clone(), "search-service");
    let b = IdempotentDispatcher::from_shared(store.clone(), feed.clone(), "feed-service");

    let msg = message("e-1", 1);
    assert_eq!(a.dispatch(&msg, &ack).await.unwrap(), DispatchOutcome::Processed);
    assert_eq!(b.dispatch(&msg, &ack).await.unwrap(), DispatchOutcome::Processed);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn test_event_id_from_envelope_when_headers_missing() {
    let (dispatcher, projection) = dispatcher();
    let ack = InMemoryAcknowledger::new();
    let id = Uuid::new_v4();

    let msg = InboundMessage {
        topic: "identity.user.events".to_string(),
        partition: 0,
        offset: 1,
        key: None,
        headers: Vec::new(),
        payload: serde_json::to_vec(&json!({
            "event_id": id,
            "event_type": "UserDeleted.v1",
            "data": {}
        }))
        .unwrap(),
    };

    dispatcher.dispatch(&msg, &ack).await.unwrap();
    assert_eq!(*projection.applied.lock(), vec![id.to_string()]);
    assert!(dispatcher.store().contains(GROUP, &id.to_string()));
}

#[tokio::test]
async fn test_message_without_event_id_is_poison() {
    let (dispatcher, projection) = dispatcher();
    let ack = InMemoryAcknowledger::new();

    let mut msg = message("unused", 9);
    msg.headers.clear();
    let err = dispatcher.dispatch(&msg, &ack).await.unwrap_err();

    assert!(err.is_poison());
    assert_eq!(projection.calls.load(Ordering::SeqCst), 0);
    assert_eq!(ack.count(), 0);
}

#[tokio::test]
async fn test_oversized_event_type_is_poison_before_handler() {
    let (dispatcher, projection) = dispatcher();
    let ack = InMemoryAcknowledger::new();

    let mut msg = message("e-long-type", 12);
    msg.headers[1].1 = "X".repeat(256);
    let err = dispatcher.dispatch(&msg, &ack).await.unwrap_err();

    assert!(matches!(err, IdempotencyError::InvalidEventType(_)));
    assert!(err.is_poison());
    assert_eq!(projection.calls.load(Ordering::SeqCst), 0);
    assert_eq!(ack.count(), 0);
    assert!(dispatcher.store().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_single_effect() {
    let (dispatcher, projection) = dispatcher();
    let ack = InMemoryAcknowledger::new();

    let mut tasks = Vec::new();
    for offset in 0..10 {
        let dispatcher = dispatcher.clone();
        let ack = ack.clone();
        tasks.push(tokio::spawn(async move {
            dispatcher.dispatch(&message("e-race", offset), &ack).await.unwrap()
        }));
    }

    let mut processed = 0;
    for task in tasks {
        if task.await.unwrap() == DispatchOutcome::Processed {
            processed += 1;
        }
    }

    assert_eq!(processed, 1);
    assert_eq!(projection.applied.lock().len(), 1);
    assert_eq!(ack.count(), 10);
}
