//! Shared scenarios for bus integration tests.
//!
//! Every scenario takes a store handle so the same checks run against the
//! in-memory store and a real Redis server.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use angzarr_redistream::bus::{
    Delivery, Envelope, Publisher, PublisherConfig, StreamPublisher, StreamSubscriber, Subscriber,
    SubscriberConfig, Subscription,
};
use angzarr_redistream::storage::{EntryId, ReadCursor, StartCursor, StreamStore};
use angzarr_redistream::utils::bootstrap::try_init_tracing;
use angzarr_redistream::utils::retry::RetryPolicy;
use uuid::Uuid;

/// Upper bound for any single expected delivery.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init() {
    try_init_tracing();
}

pub fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(3)
        .with_delays(Duration::from_millis(1), Duration::from_millis(5))
}

/// Subscriber settings scaled down for tests.
pub fn fast(config: SubscriberConfig) -> SubscriberConfig {
    config
        .with_block_time(Duration::from_millis(20))
        .with_nack_resend_sleep(Duration::from_millis(20))
        .with_close_timeout(Duration::from_millis(100))
        .with_retry(fast_retry())
}

pub fn publisher(store: &Arc<dyn StreamStore>) -> StreamPublisher {
    StreamPublisher::new(
        Arc::clone(store),
        PublisherConfig::default().with_retry(fast_retry()),
    )
}

pub fn subscriber(store: &Arc<dyn StreamStore>, config: SubscriberConfig) -> StreamSubscriber {
    StreamSubscriber::new(Arc::clone(store), fast(config))
}

pub async fn publish_range(publisher: &StreamPublisher, topic: &str, range: std::ops::Range<usize>) {
    for i in range {
        let envelope = Envelope::with_random_id(format!("test{}", i));
        publisher.publish(topic, &envelope).await.unwrap();
    }
}

pub async fn recv(subscription: &mut Subscription) -> Delivery {
    tokio::time::timeout(RECV_TIMEOUT, subscription.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("subscription ended unexpectedly")
}

/// Assert nothing is delivered within `wait`.
pub async fn assert_quiet(subscription: &mut Subscription, wait: Duration) {
    if let Ok(Some(delivery)) = tokio::time::timeout(wait, subscription.recv()).await {
        panic!("unexpected delivery: {:?}", delivery.envelope());
    }
}

pub fn payload(delivery: &Delivery) -> String {
    String::from_utf8(delivery.envelope().payload().to_vec()).unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

/// Envelope identity, payload, and metadata survive the trip.
pub async fn round_trip(store: Arc<dyn StreamStore>) {
    let topic = unique("roundtrip");
    let subscriber = subscriber(&store, SubscriberConfig::grouped(unique("g")));
    let mut subscription = subscriber.subscribe(&topic).await.unwrap();

    let envelope = Envelope::with_random_id(vec![0u8, 1, 2, 255])
        .with_metadata("trace_id", "abc")
        .with_metadata("ключ", "значение");
    publisher(&store).publish(&topic, &envelope).await.unwrap();

    let delivery = recv(&mut subscription).await;
    assert_eq!(delivery.envelope(), &envelope);
    assert!(!delivery.is_redelivery());
    assert!(delivery.ack());

    subscriber.close().await.unwrap();
}

/// 50 envelopes through one grouped subscriber: all, in order, each acked once.
pub async fn grouped_fifty_in_order(store: Arc<dyn StreamStore>) {
    let topic = unique("grouped");
    let group = unique("g");
    let subscriber = subscriber(&store, SubscriberConfig::grouped(group.clone()));
    let mut subscription = subscriber.subscribe(&topic).await.unwrap();

    let publisher = publisher(&store);
    publish_range(&publisher, &topic, 0..50).await;

    let mut last = None;
    for i in 0..50 {
        let delivery = recv(&mut subscription).await;
        assert_eq!(payload(&delivery), format!("test{}", i));
        if let Some(last) = last {
            assert!(delivery.entry_id() > last);
        }
        last = Some(delivery.entry_id());
        assert!(delivery.ack());
    }

    subscription.close().await;
    assert!(subscription.recv().await.is_none());

    let pending = store
        .list_pending(&topic, &group, Duration::ZERO, EntryId::MIN, 100)
        .await
        .unwrap();
    assert!(pending.is_empty(), "unacknowledged entries: {:?}", pending);
}

/// Two fan-out subscribers each get every envelope published after they started.
pub async fn fan_out_ten_then_forty(store: Arc<dyn StreamStore>) {
    let topic = unique("fanout");
    let publisher = publisher(&store);
    publish_range(&publisher, &topic, 0..10).await;

    let subscriber = subscriber(&store, SubscriberConfig::fan_out());
    let mut first = subscriber.subscribe(&topic).await.unwrap();
    let mut second = subscriber.subscribe(&topic).await.unwrap();
    assert_ne!(first.group(), second.group());

    tokio::time::sleep(subscriber.config().block_time).await;
    publish_range(&publisher, &topic, 10..50).await;

    // Drain the second one only after the first, so their pace differs.
    for subscription in [&mut first, &mut second] {
        for i in 10..50 {
            let delivery = recv(subscription).await;
            assert_eq!(payload(&delivery), format!("test{}", i));
            assert!(delivery.ack());
        }
        assert_quiet(subscription, Duration::from_millis(100)).await;
    }

    subscriber.close().await.unwrap();
}

/// A grouped subscription created late sees the backlog first.
pub async fn backlog_visible(store: Arc<dyn StreamStore>) {
    let topic = unique("backlog");
    let publisher = publisher(&store);
    publish_range(&publisher, &topic, 0..5).await;

    let subscriber = subscriber(&store, SubscriberConfig::grouped(unique("g")));
    let mut subscription = subscriber.subscribe(&topic).await.unwrap();
    publish_range(&publisher, &topic, 5..10).await;

    for i in 0..10 {
        let delivery = recv(&mut subscription).await;
        assert_eq!(payload(&delivery), format!("test{}", i));
        assert!(delivery.ack());
    }

    subscriber.close().await.unwrap();
}

/// An entry consumer A holds past `min_idle` is redelivered to consumer B;
/// A's late ack is harmless.
pub async fn reclaim_from_stalled_consumer(store: Arc<dyn StreamStore>) {
    let topic = unique("reclaim");
    let group = unique("g");
    let config = SubscriberConfig::grouped(group.clone())
        .with_claim_interval(Duration::from_millis(50))
        .with_min_idle(Duration::from_millis(300));

    let a = subscriber(&store, config.clone().with_consumer("a"));
    let mut from_a = a.subscribe(&topic).await.unwrap();

    let envelope = Envelope::with_random_id("work");
    publisher(&store).publish(&topic, &envelope).await.unwrap();
    let held = recv(&mut from_a).await;
    assert_eq!(held.envelope(), &envelope);

    let b = subscriber(&store, config.with_consumer("b"));
    let mut from_b = b.subscribe(&topic).await.unwrap();

    let redelivered = recv(&mut from_b).await;
    assert_eq!(redelivered.envelope().id(), envelope.id());
    assert!(redelivered.is_redelivery());
    assert!(redelivered.ack());

    // A's acknowledgment after the takeover does not fail.
    assert!(held.ack());
    assert_quiet(&mut from_a, Duration::from_millis(100)).await;

    let pending = store
        .list_pending(&topic, &group, Duration::ZERO, EntryId::MIN, 10)
        .await
        .unwrap();
    assert!(pending.is_empty());

    a.close().await.unwrap();
    b.close().await.unwrap();
}

/// A crashed peer's entry is reclaimed even when a full page of the pending
/// list belongs to the reclaiming consumer itself.
pub async fn reclaim_past_own_pending_entries(store: Arc<dyn StreamStore>) {
    let topic = unique("reclaim-paging");
    let group = unique("g");
    store
        .create_group(&topic, &group, StartCursor::Beginning)
        .await
        .unwrap();

    // Two undecodable entries "b" will keep pending, then one good entry.
    for _ in 0..2 {
        store
            .append(&topic, &[("payload".to_string(), b"no id".to_vec())], None)
            .await
            .unwrap();
    }
    let envelope = Envelope::with_random_id("stranded");
    publisher(&store).publish(&topic, &envelope).await.unwrap();

    store
        .read_group(&topic, &group, "b", ReadCursor::New, None, 2)
        .await
        .unwrap();
    // "c" takes the good entry and crashes.
    store
        .read_group(&topic, &group, "c", ReadCursor::New, None, 1)
        .await
        .unwrap();

    let subscriber = subscriber(
        &store,
        SubscriberConfig::grouped(group.clone())
            .with_consumer("b")
            .with_claim_batch_size(2)
            .with_claim_interval(Duration::from_millis(50))
            .with_min_idle(Duration::from_millis(50)),
    );
    let mut subscription = subscriber.subscribe(&topic).await.unwrap();

    let delivery = recv(&mut subscription).await;
    assert_eq!(delivery.envelope(), &envelope);
    assert!(delivery.is_redelivery());
    assert!(delivery.ack());

    subscriber.close().await.unwrap();

    let owners: Vec<String> = store
        .list_pending(&topic, &group, Duration::ZERO, EntryId::MIN, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.consumer)
        .collect();
    assert_eq!(owners, vec!["b".to_string(), "b".to_string()]);
}

/// A nacked entry comes back before anything after it.
pub async fn nack_redelivers_in_order(store: Arc<dyn StreamStore>) {
    let topic = unique("nack");
    let subscriber = subscriber(&store, SubscriberConfig::grouped(unique("g")));
    let mut subscription = subscriber.subscribe(&topic).await.unwrap();
    publish_range(&publisher(&store), &topic, 0..3).await;

    let first = recv(&mut subscription).await;
    assert_eq!(payload(&first), "test0");
    assert!(first.ack());

    let refused = recv(&mut subscription).await;
    assert_eq!(payload(&refused), "test1");
    let refused_id = refused.entry_id();
    assert!(refused.nack());

    let again = recv(&mut subscription).await;
    assert_eq!(payload(&again), "test1");
    assert_eq!(again.entry_id(), refused_id);
    assert!(again.is_redelivery());
    assert!(again.ack());

    let last = recv(&mut subscription).await;
    assert_eq!(payload(&last), "test2");
    assert!(last.ack());

    subscriber.close().await.unwrap();
}

/// Dropping a delivery without answering counts as a nack.
pub async fn dropped_delivery_is_redelivered(store: Arc<dyn StreamStore>) {
    let topic = unique("dropped");
    let subscriber = subscriber(&store, SubscriberConfig::grouped(unique("g")));
    let mut subscription = subscriber.subscribe(&topic).await.unwrap();
    publish_range(&publisher(&store), &topic, 0..1).await;

    let dropped = recv(&mut subscription).await;
    let id = dropped.entry_id();
    drop(dropped);

    let again = recv(&mut subscription).await;
    assert_eq!(again.entry_id(), id);
    assert!(again.ack());

    subscriber.close().await.unwrap();
}

/// Undecodable entries are skipped and left pending.
pub async fn malformed_entry_skipped(store: Arc<dyn StreamStore>) {
    let topic = unique("malformed");
    let group = unique("g");
    let subscriber = subscriber(&store, SubscriberConfig::grouped(group.clone()));
    let mut subscription = subscriber.subscribe(&topic).await.unwrap();

    let bad = store
        .append(&topic, &[("payload".to_string(), b"no id".to_vec())], None)
        .await
        .unwrap();
    publish_range(&publisher(&store), &topic, 0..1).await;

    let delivery = recv(&mut subscription).await;
    assert_eq!(payload(&delivery), "test0");
    assert!(delivery.ack());

    let pending = store
        .list_pending(&topic, &group, Duration::ZERO, EntryId::MIN, 10)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, bad);

    subscriber.close().await.unwrap();
}

/// Closing a fan-out subscription removes its private group.
pub async fn fan_out_group_removed_on_close(store: Arc<dyn StreamStore>) {
    let topic = unique("fanout-close");
    let subscriber = subscriber(&store, SubscriberConfig::fan_out());
    let mut subscription = subscriber.subscribe(&topic).await.unwrap();
    let group = subscription.group().to_string();
    assert!(store.list_consumers(&topic, &group).await.is_ok());

    subscription.close().await;
    assert!(store.list_consumers(&topic, &group).await.is_err());
}
