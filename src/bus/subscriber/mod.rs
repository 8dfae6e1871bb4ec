//! Stream subscriber: consumer-group subscriptions with explicit acknowledgment.
//!
//! Each subscription runs two tasks:
//! - read loop: blocking group reads, decode, deliver, wait for ack/nack
//! - reclaim loop (grouped mode only): takes over entries other consumers
//!   left pending too long, and removes long-idle consumers
//!
//! Both stop on a shared watch-channel cancellation signal and are joined
//! on close.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use super::{BusError, DefaultMarshaler, Delivery, Marshaler, Result, Subscriber};
use crate::storage::{PendingEntry, StartCursor, StreamStore};
use crate::utils::retry::RetryPolicy;

pub mod group;
mod read_loop;
mod reclaim;

pub use group::fan_out_group_name;

/// Predicate deciding whether an idle pending entry may be reclaimed.
pub type ClaimPredicate = Arc<dyn Fn(&PendingEntry) -> bool + Send + Sync>;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a stream subscriber.
#[derive(Clone)]
pub struct SubscriberConfig {
    /// Consumer name within the group (default: random UUID).
    pub consumer: String,
    /// Consumer group name. Empty selects fan-out mode.
    pub consumer_group: String,
    /// Upper bound of one blocking read; cancellation is noticed within it.
    pub block_time: Duration,
    /// Maximum entries fetched per read.
    pub read_batch_size: usize,
    /// How often the reclaim loop scans the pending entry list.
    pub claim_interval: Duration,
    /// Page size when scanning the pending entry list.
    pub claim_batch_size: usize,
    /// Minimum idle time before another consumer's entry may be reclaimed.
    pub min_idle: Duration,
    /// How often idle consumers are looked for.
    pub check_consumers_interval: Duration,
    /// Idle time after which a consumer without pending entries is removed.
    /// Zero disables removal.
    pub consumer_timeout: Duration,
    /// Pause after a nack before pending entries are delivered again.
    pub nack_resend_sleep: Duration,
    /// Grace period for an in-flight acknowledgment when closing.
    pub close_timeout: Duration,
    /// Retry policy for store calls.
    pub retry: RetryPolicy,
    /// Optional filter applied to reclaim candidates.
    pub should_claim: Option<ClaimPredicate>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            consumer: Uuid::new_v4().to_string(),
            consumer_group: String::new(),
            block_time: Duration::from_millis(100),
            read_batch_size: 10,
            claim_interval: Duration::from_secs(5),
            claim_batch_size: 100,
            min_idle: Duration::from_secs(60),
            check_consumers_interval: Duration::from_secs(300),
            consumer_timeout: Duration::from_secs(600),
            nack_resend_sleep: Duration::from_secs(2),
            close_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            should_claim: None,
        }
    }
}

impl fmt::Debug for SubscriberConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberConfig")
            .field("consumer", &self.consumer)
            .field("consumer_group", &self.consumer_group)
            .field("block_time", &self.block_time)
            .field("read_batch_size", &self.read_batch_size)
            .field("claim_interval", &self.claim_interval)
            .field("claim_batch_size", &self.claim_batch_size)
            .field("min_idle", &self.min_idle)
            .field("check_consumers_interval", &self.check_consumers_interval)
            .field("consumer_timeout", &self.consumer_timeout)
            .field("nack_resend_sleep", &self.nack_resend_sleep)
            .field("close_timeout", &self.close_timeout)
            .field("retry", &self.retry)
            .field("should_claim", &self.should_claim.is_some())
            .finish()
    }
}

impl SubscriberConfig {
    /// Load-balanced subscriptions sharing `group`.
    pub fn grouped(group: impl Into<String>) -> Self {
        Self {
            consumer_group: group.into(),
            ..Self::default()
        }
    }

    /// Broadcast subscriptions, each on a private group.
    pub fn fan_out() -> Self {
        Self::default()
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_block_time(mut self, block_time: Duration) -> Self {
        self.block_time = block_time;
        self
    }

    pub fn with_read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = size;
        self
    }

    pub fn with_claim_interval(mut self, interval: Duration) -> Self {
        self.claim_interval = interval;
        self
    }

    pub fn with_claim_batch_size(mut self, size: usize) -> Self {
        self.claim_batch_size = size;
        self
    }

    pub fn with_min_idle(mut self, min_idle: Duration) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn with_check_consumers_interval(mut self, interval: Duration) -> Self {
        self.check_consumers_interval = interval;
        self
    }

    pub fn with_consumer_timeout(mut self, timeout: Duration) -> Self {
        self.consumer_timeout = timeout;
        self
    }

    pub fn with_nack_resend_sleep(mut self, sleep: Duration) -> Self {
        self.nack_resend_sleep = sleep;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Only reclaim pending entries the predicate accepts.
    pub fn with_should_claim<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PendingEntry) -> bool + Send + Sync + 'static,
    {
        self.should_claim = Some(Arc::new(predicate));
        self
    }

    /// Subscription mode implied by the group name.
    pub fn mode(&self) -> SubscriptionMode {
        if self.consumer_group.is_empty() {
            SubscriptionMode::FanOut
        } else {
            SubscriptionMode::Grouped
        }
    }

    /// Reject values the loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(BusError::Config(msg.to_string()));
        if self.consumer.is_empty() {
            return invalid("consumer name must not be empty");
        }
        if self.block_time.is_zero() {
            return invalid("block_time must be positive");
        }
        if self.read_batch_size == 0 {
            return invalid("read_batch_size must be positive");
        }
        if self.claim_interval.is_zero() {
            return invalid("claim_interval must be positive");
        }
        if self.claim_batch_size == 0 {
            return invalid("claim_batch_size must be positive");
        }
        if self.check_consumers_interval.is_zero() {
            return invalid("check_consumers_interval must be positive");
        }
        Ok(())
    }
}

/// How a subscription shares its topic with others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Named group: entries are split between the group's consumers.
    Grouped,
    /// Private group: every subscription sees every new entry.
    FanOut,
}

impl SubscriptionMode {
    /// Cursor for a newly created group.
    ///
    /// Grouped subscriptions see the backlog; fan-out ones only new entries.
    pub fn start_cursor(self) -> StartCursor {
        match self {
            SubscriptionMode::Grouped => StartCursor::Beginning,
            SubscriptionMode::FanOut => StartCursor::Tail,
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionState {
    Starting = 0,
    Reading = 1,
    Delivering = 2,
    Closing = 3,
    Closed = 4,
}

impl SubscriptionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SubscriptionState::Starting,
            1 => SubscriptionState::Reading,
            2 => SubscriptionState::Delivering,
            3 => SubscriptionState::Closing,
            _ => SubscriptionState::Closed,
        }
    }
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: SubscriptionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: SubscriptionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

// ============================================================================
// Loop context
// ============================================================================

/// Everything one subscription's tasks share.
#[derive(Clone)]
pub(crate) struct LoopContext {
    /// Dedicated handle for blocking reads.
    pub(crate) reader: Arc<dyn StreamStore>,
    /// Shared handle for acknowledgments, group and pending management.
    pub(crate) store: Arc<dyn StreamStore>,
    pub(crate) marshaler: Arc<dyn Marshaler>,
    pub(crate) config: Arc<SubscriberConfig>,
    pub(crate) topic: String,
    pub(crate) group: String,
    pub(crate) consumer: String,
    pub(crate) mode: SubscriptionMode,
    pub(crate) output: mpsc::Sender<Delivery>,
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) cancel_tx: Arc<watch::Sender<bool>>,
    /// Signalled by the reclaim loop after entries were transferred to this consumer.
    pub(crate) claimed: Arc<Notify>,
    pub(crate) state: Arc<StateCell>,
}

impl LoopContext {
    /// Whether the subscription was cancelled or its receiver dropped.
    pub(crate) fn is_stopped(&self) -> bool {
        *self.cancel.borrow() || self.output.is_closed()
    }

    /// Resolves once the subscription is cancelled or its receiver dropped.
    pub(crate) async fn stopped(&mut self) {
        let output = &self.output;
        tokio::select! {
            _ = cancelled(&mut self.cancel) => {}
            _ = output.closed() => {}
        }
    }
}

/// Resolves once the watch value is `true` or its sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Shared control block of one subscription.
struct SubscriptionHandle {
    topic: String,
    group: String,
    consumer: String,
    mode: SubscriptionMode,
    store: Arc<dyn StreamStore>,
    cancel: Arc<watch::Sender<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    state: Arc<StateCell>,
}

impl SubscriptionHandle {
    fn is_finished(&self) -> bool {
        self.state.get() == SubscriptionState::Closed
    }

    /// Cancel both tasks and wait for them. Idempotent.
    async fn shutdown(&self) {
        self.cancel.send_replace(true);

        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            return;
        }
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                error!(topic = %self.topic, group = %self.group, error = %e, "Subscription task failed");
            }
        }

        if self.mode == SubscriptionMode::FanOut {
            group::remove_group(self.store.as_ref(), &self.topic, &self.group).await;
        }
        info!(
            topic = %self.topic,
            group = %self.group,
            consumer = %self.consumer,
            "Subscription closed"
        );
    }
}

/// A running subscription: an ordered feed of deliveries.
///
/// The feed ends (`recv` returns `None`) once the subscription is closed or
/// its read loop gave up on the store.
pub struct Subscription {
    receiver: mpsc::Receiver<Delivery>,
    handle: Arc<SubscriptionHandle>,
}

impl Subscription {
    /// Next delivery, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    pub fn topic(&self) -> &str {
        &self.handle.topic
    }

    pub fn group(&self) -> &str {
        &self.handle.group
    }

    pub fn consumer(&self) -> &str {
        &self.handle.consumer
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.handle.mode
    }

    pub fn state(&self) -> SubscriptionState {
        self.handle.state.get()
    }

    /// Stop the subscription and wait for its tasks to finish. Idempotent.
    ///
    /// Deliveries still queued are dropped, which leaves their entries
    /// pending for redelivery.
    pub async fn close(&mut self) {
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}
        self.handle.shutdown().await;
    }
}

impl futures::Stream for Subscription {
    type Item = Delivery;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.cancel.send_replace(true);
        // Join the tasks and remove a fan-out group in the background.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let handle = Arc::clone(&self.handle);
            runtime.spawn(async move { handle.shutdown().await });
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.handle.topic)
            .field("group", &self.handle.group)
            .field("consumer", &self.handle.consumer)
            .field("mode", &self.handle.mode)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Subscriber
// ============================================================================

/// Subscriber opening consumer-group subscriptions on a stream store.
pub struct StreamSubscriber {
    store: Arc<dyn StreamStore>,
    config: Arc<SubscriberConfig>,
    marshaler: Arc<dyn Marshaler>,
    subscriptions: Mutex<Vec<Arc<SubscriptionHandle>>>,
    closed: AtomicBool,
}

impl StreamSubscriber {
    pub fn new(store: Arc<dyn StreamStore>, config: SubscriberConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            marshaler: Arc::new(DefaultMarshaler),
            subscriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Connect to Redis and subscribe over connections owned by this subscriber.
    #[cfg(feature = "redis")]
    pub async fn connect(url: &str, config: SubscriberConfig) -> Result<Self> {
        let store = crate::storage::RedisStreamStore::new(url).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Replace the envelope codec.
    pub fn with_marshaler(mut self, marshaler: Arc<dyn Marshaler>) -> Self {
        self.marshaler = marshaler;
        self
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Subscribe, closing the subscription when `shutdown` turns `true`.
    pub async fn subscribe_until(
        &self,
        topic: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Subscription> {
        self.start(topic, Some(shutdown)).await
    }

    async fn start(
        &self,
        topic: &str,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<Subscription> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::SubscriptionClosed);
        }
        self.config.validate()?;

        let consumer = self.config.consumer.clone();
        let mode = self.config.mode();
        let group = match mode {
            SubscriptionMode::Grouped => self.config.consumer_group.clone(),
            SubscriptionMode::FanOut => fan_out_group_name(topic, &consumer),
        };

        group::ensure_group(
            self.store.as_ref(),
            topic,
            &group,
            mode.start_cursor(),
            &self.config.retry,
        )
        .await?;

        let reader = match self.store.dedicated().await {
            Ok(reader) => reader,
            Err(e) => {
                if mode == SubscriptionMode::FanOut {
                    group::remove_group(self.store.as_ref(), topic, &group).await;
                }
                return Err(e.into());
            }
        };

        let (output, receiver) = mpsc::channel(1);
        let (cancel_tx, cancel) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let state = Arc::new(StateCell::new(SubscriptionState::Starting));

        let ctx = LoopContext {
            reader,
            store: Arc::clone(&self.store),
            marshaler: Arc::clone(&self.marshaler),
            config: Arc::clone(&self.config),
            topic: topic.to_string(),
            group: group.clone(),
            consumer: consumer.clone(),
            mode,
            output,
            cancel,
            cancel_tx: Arc::clone(&cancel_tx),
            claimed: Arc::new(Notify::new()),
            state: Arc::clone(&state),
        };

        let span = tracing::info_span!(
            "bus.subscription",
            topic = %topic,
            group = %group,
            consumer = %consumer
        );
        let mut tasks = Vec::with_capacity(2);
        if mode == SubscriptionMode::Grouped {
            tasks.push(tokio::spawn(reclaim::run(ctx.clone()).instrument(span.clone())));
        }
        tasks.push(tokio::spawn(read_loop::run(ctx).instrument(span)));

        let handle = Arc::new(SubscriptionHandle {
            topic: topic.to_string(),
            group,
            consumer,
            mode,
            store: Arc::clone(&self.store),
            cancel: cancel_tx,
            tasks: Mutex::new(tasks),
            state,
        });

        if let Some(shutdown) = shutdown {
            spawn_shutdown_forwarder(Arc::clone(&handle), shutdown);
        }

        {
            let mut subscriptions = self.subscriptions.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                drop(subscriptions);
                handle.shutdown().await;
                return Err(BusError::SubscriptionClosed);
            }
            subscriptions.retain(|h| !h.is_finished());
            subscriptions.push(Arc::clone(&handle));
        }

        info!(
            topic = %handle.topic,
            group = %handle.group,
            consumer = %handle.consumer,
            mode = ?mode,
            "Subscribed"
        );

        Ok(Subscription { receiver, handle })
    }
}

/// Close the subscription when the parent signal fires.
fn spawn_shutdown_forwarder(handle: Arc<SubscriptionHandle>, mut shutdown: watch::Receiver<bool>) {
    let mut own = handle.cancel.subscribe();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancelled(&mut shutdown) => handle.shutdown().await,
            _ = cancelled(&mut own) => {}
        }
    });
}

#[async_trait]
impl Subscriber for StreamSubscriber {
    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.start(topic, None).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let handles = std::mem::take(&mut *self.subscriptions.lock().await);
        for handle in handles {
            handle.shutdown().await;
        }
        info!("Subscriber closed");
        Ok(())
    }
}
