#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-bus-core** – In-process pub/sub for the Kira kernel.
//!
//! The bus delivers events synchronously on the publisher's task: `publish`
//! awaits every matching subscriber in registration order and returns the
//! count of successful deliveries. That keeps ordering deterministic — the
//! only suspension points are handler bodies and retry sleeps. Handlers that
//! need long work should schedule a job instead of blocking the bus.
//!
//! Failed handlers are retried per their [`RetryPolicy`] (exponential
//! backoff with optional jitter); after exhaustion the delivery is counted
//! as failed and logged, and remaining subscribers still receive the event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rand::Rng;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

//─────────────────────────────
//  Retry policy
//─────────────────────────────

/// Retry policy for event handlers.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
    /// Exponential growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Multiply each delay by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Backoff before retrying after `attempt` failures (0-based).
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}

//─────────────────────────────
//  Events
//─────────────────────────────

/// Event container delivered to subscribers.
#[derive(Debug, Clone)]
pub struct Event {
    /// Dot-separated event name (`entity.created`, `sync.tick`, …).
    pub name: String,
    /// Event payload.
    pub payload: Value,
    /// Optional metadata headers.
    pub headers: serde_json::Map<String, Value>,
    /// Correlation ID for tracing; generated when the publisher supplies
    /// none.
    pub correlation_id: String,
    /// Publication instant.
    pub timestamp: DateTime<Utc>,
}

/// Async event handler. The bus awaits the returned future inline.
pub type EventHandler =
    Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Predicate deciding whether a subscription sees an event.
pub type FilterPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Handle identifying a subscription for later cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    /// Unique subscription ID.
    pub subscription_id: Uuid,
    /// Event name the subscription is registered under.
    pub event_name: String,
}

struct Subscription {
    id: Uuid,
    handler: EventHandler,
    filter: Option<FilterPredicate>,
    once: bool,
    retry_policy: RetryPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Per-event delivery counters.
pub struct DeliveryStats {
    /// `publish` calls for the event name.
    pub published: u64,
    /// Successful handler deliveries.
    pub delivered: u64,
    /// Deliveries that exhausted their retries.
    pub failed: u64,
}

//─────────────────────────────
//  Event bus
//─────────────────────────────

/// In-process event bus with deterministic sequential dispatch.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<HashMap<String, Vec<Arc<Subscription>>>>,
    stats: Mutex<HashMap<String, DeliveryStats>>,
}

impl EventBus {
    /// Bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `name`.
    ///
    /// Subscribers are invoked in registration order. A `once` subscriber is
    /// removed after its first successful handling. A filter returning false
    /// skips the event without consuming the `once` slot.
    pub fn subscribe(
        &self,
        name: &str,
        handler: EventHandler,
        filter: Option<FilterPredicate>,
        once: bool,
        retry_policy: Option<RetryPolicy>,
    ) -> SubscriptionHandle {
        let subscription = Arc::new(Subscription {
            id: Uuid::new_v4(),
            handler,
            filter,
            once,
            retry_policy: retry_policy.unwrap_or_default(),
        });

        let handle = SubscriptionHandle {
            subscription_id: subscription.id,
            event_name: name.to_string(),
        };

        self.subscriptions
            .lock()
            .expect("bus registry poisoned")
            .entry(name.to_string())
            .or_default()
            .push(subscription);

        debug!(event_name = name, subscription_id = %handle.subscription_id, once, "subscription created");
        handle
    }

    /// Publish an event, delivering to every current subscriber of `name`.
    /// Returns the number of successful deliveries.
    pub async fn publish(&self, name: &str, payload: Value) -> usize {
        self.publish_with(name, payload, serde_json::Map::new(), None)
            .await
    }

    /// [`publish`](Self::publish) with explicit headers and correlation ID.
    pub async fn publish_with(
        &self,
        name: &str,
        payload: Value,
        headers: serde_json::Map<String, Value>,
        correlation_id: Option<String>,
    ) -> usize {
        let event = Event {
            name: name.to_string(),
            payload,
            headers,
            correlation_id: correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp: Utc::now(),
        };

        info!(event_name = name, correlation_id = %event.correlation_id, "event published");
        self.stats
            .lock()
            .expect("bus stats poisoned")
            .entry(name.to_string())
            .or_default()
            .published += 1;

        // Snapshot so subscribe/unsubscribe during delivery cannot affect
        // this publish; cancelled handles are re-checked before invocation.
        let snapshot: Vec<Arc<Subscription>> = self
            .subscriptions
            .lock()
            .expect("bus registry poisoned")
            .get(name)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0usize;
        for subscription in snapshot {
            if !self.is_subscribed(name, subscription.id) {
                continue;
            }
            if let Some(filter) = &subscription.filter {
                if !filter(&event) {
                    continue;
                }
            }

            if self.deliver(&subscription, event.clone()).await {
                delivered += 1;
                self.stats
                    .lock()
                    .expect("bus stats poisoned")
                    .entry(name.to_string())
                    .or_default()
                    .delivered += 1;

                if subscription.once {
                    self.remove_subscription(name, subscription.id);
                }
            } else {
                self.stats
                    .lock()
                    .expect("bus stats poisoned")
                    .entry(name.to_string())
                    .or_default()
                    .failed += 1;
            }
        }

        delivered
    }

    async fn deliver(&self, subscription: &Subscription, event: Event) -> bool {
        let policy = &subscription.retry_policy;

        for attempt in 0..policy.max_attempts {
            match (subscription.handler)(event.clone()).await {
                Ok(()) => {
                    debug!(
                        event_name = %event.name,
                        correlation_id = %event.correlation_id,
                        attempts = attempt + 1,
                        "handler executed"
                    );
                    return true;
                }
                Err(err) if attempt + 1 < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        event_name = %event.name,
                        correlation_id = %event.correlation_id,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "handler failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        event_name = %event.name,
                        correlation_id = %event.correlation_id,
                        attempts = policy.max_attempts,
                        error = %err,
                        "handler failed after all attempts"
                    );
                }
            }
        }

        false
    }

    fn is_subscribed(&self, name: &str, id: Uuid) -> bool {
        self.subscriptions
            .lock()
            .expect("bus registry poisoned")
            .get(name)
            .is_some_and(|subs| subs.iter().any(|s| s.id == id))
    }

    fn remove_subscription(&self, name: &str, id: Uuid) -> bool {
        let mut registry = self.subscriptions.lock().expect("bus registry poisoned");
        let Some(subs) = registry.get_mut(name) else { return false };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    /// Remove one subscription. Returns whether it was present.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.remove_subscription(&handle.event_name, handle.subscription_id);
        if removed {
            debug!(subscription_id = %handle.subscription_id, "subscription removed");
        }
        removed
    }

    /// Remove every subscription for `name`. Returns how many were removed.
    pub fn unsubscribe_all(&self, name: &str) -> usize {
        let mut registry = self.subscriptions.lock().expect("bus registry poisoned");
        registry.remove(name).map(|subs| subs.len()).unwrap_or(0)
    }

    /// Remove all subscriptions and reset statistics.
    pub fn clear(&self) {
        self.subscriptions.lock().expect("bus registry poisoned").clear();
        self.stats.lock().expect("bus stats poisoned").clear();
    }

    /// Number of live subscriptions for `name`.
    pub fn subscription_count(&self, name: &str) -> usize {
        self.subscriptions
            .lock()
            .expect("bus registry poisoned")
            .get(name)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Delivery statistics per event name.
    pub fn stats(&self) -> HashMap<String, DeliveryStats> {
        self.stats.lock().expect("bus stats poisoned").clone()
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        handler(move |_event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn publish_delivers_to_all_subscribers() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("task.created", counting_handler(counter.clone()), None, false, None);
        bus.subscribe("task.created", counting_handler(counter.clone()), None, false, None);

        let delivered = bus.publish("task.created", json!({"id": "task-1"})).await;
        assert_eq!(delivered, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn subscribers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(
                "ordered",
                handler(move |_| {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(tag);
                        Ok(())
                    }
                }),
                None,
                false,
                None,
            );
        }
        bus.publish("ordered", json!({})).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn once_subscriber_fires_exactly_once() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("one.shot", counting_handler(counter.clone()), None, true, None);

        assert_eq!(bus.publish("one.shot", json!({})).await, 1);
        assert_eq!(bus.publish("one.shot", json!({})).await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscription_count("one.shot"), 0);
    }

    #[tokio::test]
    async fn filter_skips_without_consuming_once() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let filter: FilterPredicate =
            Arc::new(|event| event.payload.get("wanted").and_then(Value::as_bool) == Some(true));
        bus.subscribe("filtered", counting_handler(counter.clone()), Some(filter), true, None);

        bus.publish("filtered", json!({"wanted": false})).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscription_count("filtered"), 1);

        bus.publish("filtered", json!({"wanted": true})).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscription_count("filtered"), 0);
    }

    #[tokio::test]
    async fn failing_handler_is_retried_until_success() {
        let bus = EventBus::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        bus.subscribe(
            "flaky",
            handler(move |_| {
                let attempts = attempts_clone.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient failure");
                    }
                    Ok(())
                }
            }),
            None,
            false,
            Some(fast_policy(3)),
        );

        let delivered = bus.publish("flaky", json!({})).await;
        assert_eq!(delivered, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_do_not_abort_other_subscribers() {
        let bus = EventBus::new();
        bus.subscribe(
            "mixed",
            handler(|_| async { anyhow::bail!("always fails") }),
            None,
            false,
            Some(fast_policy(2)),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("mixed", counting_handler(counter.clone()), None, false, None);

        let delivered = bus.publish("mixed", json!({})).await;
        assert_eq!(delivered, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let stats = bus.stats();
        assert_eq!(stats["mixed"].failed, 1);
        assert_eq!(stats["mixed"].delivered, 1);
    }

    #[tokio::test]
    async fn unsubscribe_takes_immediate_effect() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = bus.subscribe("cancellable", counting_handler(counter.clone()), None, false, None);

        assert!(bus.unsubscribe(&handle));
        assert!(!bus.unsubscribe(&handle));
        bus.publish("cancellable", json!({})).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_event_name() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("bulk", counting_handler(counter.clone()), None, false, None);
        bus.subscribe("bulk", counting_handler(counter.clone()), None, false, None);

        assert_eq!(bus.unsubscribe_all("bulk"), 2);
        assert_eq!(bus.publish("bulk", json!({})).await, 0);
    }

    #[tokio::test]
    async fn stats_track_published_counts() {
        let bus = EventBus::new();
        bus.publish("unheard", json!({})).await;
        bus.publish("unheard", json!({})).await;
        let stats = bus.stats();
        assert_eq!(stats["unheard"].published, 2);
        assert_eq!(stats["unheard"].delivered, 0);
    }

    #[tokio::test]
    async fn correlation_id_is_propagated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(String::new()));
        let seen_clone = seen.clone();
        bus.subscribe(
            "traced",
            handler(move |event| {
                let seen = seen_clone.clone();
                async move {
                    *seen.lock().unwrap() = event.correlation_id.clone();
                    Ok(())
                }
            }),
            None,
            false,
            None,
        );

        bus.publish_with("traced", json!({}), serde_json::Map::new(), Some("corr-42".into()))
            .await;
        assert_eq!(*seen.lock().unwrap(), "corr-42");
    }
}
