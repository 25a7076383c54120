#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-ordering** – Out-of-order tolerance for the event pipeline.
//!
//! Events arriving from adapters may be reordered in transit. The
//! [`EventBuffer`] holds envelopes for a short grace period (default 5 s,
//! sensible range 3–10 s) so late arrivals can be sequenced before they
//! mutate state, then replays them in the canonical order
//! `(event_ts, seq, event_id)`. State mutation goes through
//! [`EventReducer`]s, which must be idempotent, commutative for independent
//! events, and deterministic (no wall-clock reads; every effect derives from
//! the envelope). Under those contracts any permutation of a finite event
//! set converges to the same final state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use kira_dedupe::EventEnvelope;

pub mod reducers;
pub use reducers::TaskReducer;

/// State folded by reducers: entity buckets keyed by string.
pub type State = serde_json::Map<String, Value>;

//─────────────────────────────
//  Reducer contract
//─────────────────────────────

/// A commutative, idempotent fold step over the event stream.
///
/// Contract:
/// - **Idempotent**: `apply(apply(s, e), e) == apply(s, e)`.
/// - **Commutative** for independent events: events touching different
///   entities (or independent fields of one entity) may apply in any order.
/// - **Deterministic**: no wall-clock reads; effects derive only from the
///   envelope.
pub trait EventReducer: Send + Sync {
    /// Fold `envelope` into `state`, returning the new state.
    fn apply(&self, state: State, envelope: &EventEnvelope) -> State;

    /// Whether the event's dependencies are met in `state`, enabling the
    /// early fast path before the grace period expires. What "dependencies
    /// met" means is reducer-specific; the default accepts everything.
    fn can_apply(&self, _state: &State, _envelope: &EventEnvelope) -> bool {
        true
    }
}

/// Registry resolving reducers by event type: exact match first, then
/// wildcard prefixes (`task.*` matches `task.created`).
#[derive(Default)]
pub struct ReducerRegistry {
    reducers: HashMap<String, Arc<dyn EventReducer>>,
}

impl ReducerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reducer under an exact type or a `prefix.*` pattern.
    pub fn register(&mut self, pattern: &str, reducer: Arc<dyn EventReducer>) {
        self.reducers.insert(pattern.to_string(), reducer);
    }

    /// Resolve the reducer for `event_type`.
    pub fn resolve(&self, event_type: &str) -> Option<Arc<dyn EventReducer>> {
        if let Some(reducer) = self.reducers.get(event_type) {
            return Some(Arc::clone(reducer));
        }
        for (pattern, reducer) in &self.reducers {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if event_type.starts_with(prefix)
                    && event_type[prefix.len()..].starts_with('.')
                {
                    return Some(Arc::clone(reducer));
                }
            }
        }
        None
    }
}

//─────────────────────────────
//  Grace buffer
//─────────────────────────────

#[derive(Debug, Clone)]
struct BufferedEvent {
    envelope: EventEnvelope,
    received_at: DateTime<Utc>,
}

impl BufferedEvent {
    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.received_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Counters exposed by [`EventBuffer::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Envelopes offered to the buffer (duplicates included).
    pub total_received: u64,
    /// Envelopes applied to state.
    pub total_processed: u64,
    /// Envelopes dropped by the size limit before processing.
    pub total_evicted: u64,
    /// Largest number of simultaneously buffered envelopes.
    pub buffered_peak: usize,
    /// Currently buffered envelopes.
    pub currently_buffered: usize,
    /// Distinct entity buckets currently held.
    pub unique_entities: usize,
}

/// Grace buffer absorbing out-of-order events before they mutate state.
///
/// Events are grouped per entity (payload `entity_id`/`id`/`task_id`/
/// `note_id`, else the event type) and become ready when their grace period
/// expires, or earlier when a registered reducer reports `can_apply`. Ready
/// events drain in the canonical `(event_ts, seq, event_id)` order.
pub struct EventBuffer {
    grace_period: Duration,
    max_buffer_size: usize,
    buffers: HashMap<String, VecDeque<BufferedEvent>>,
    processed_ids: HashSet<String>,
    reducers: ReducerRegistry,
    total_received: u64,
    total_processed: u64,
    total_evicted: u64,
    buffered_peak: usize,
}

/// Fast path below this grace period is disabled; with an almost-zero grace
/// the buffer would never actually buffer.
const FAST_PATH_MIN_GRACE: Duration = Duration::from_secs(1);

impl EventBuffer {
    /// Buffer with the given grace period and size limit.
    pub fn new(grace_period: Duration, max_buffer_size: usize) -> Self {
        Self {
            grace_period,
            max_buffer_size,
            buffers: HashMap::new(),
            processed_ids: HashSet::new(),
            reducers: ReducerRegistry::new(),
            total_received: 0,
            total_processed: 0,
            total_evicted: 0,
            buffered_peak: 0,
        }
    }

    /// Buffer with the default 5 s grace period and 1000-event limit.
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(5), 1000)
    }

    /// Configured grace period.
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Register a reducer for an event type or `prefix.*` pattern.
    pub fn register_reducer(&mut self, pattern: &str, reducer: Arc<dyn EventReducer>) {
        self.reducers.register(pattern, reducer);
    }

    /// Offer an envelope to the buffer. Returns `false` for duplicates
    /// (already processed or already buffered).
    pub fn add_event(&mut self, envelope: EventEnvelope) -> bool {
        self.total_received += 1;

        if self.processed_ids.contains(&envelope.event_id) {
            return false;
        }
        if self
            .buffers
            .values()
            .flatten()
            .any(|b| b.envelope.event_id == envelope.event_id)
        {
            return false;
        }

        let key = entity_key(&envelope);
        debug!(event_id = %envelope.event_id, entity = %key, "event buffered");
        self.buffers.entry(key).or_default().push_back(BufferedEvent {
            envelope,
            received_at: Utc::now(),
        });

        let buffered = self.buffered_len();
        self.buffered_peak = self.buffered_peak.max(buffered);
        if buffered > self.max_buffer_size {
            self.evict_oldest();
        }

        true
    }

    /// Apply every ready event to `state`, returning the new state and the
    /// processed envelopes in application order.
    pub fn process_ready(&mut self, state: State) -> (State, Vec<EventEnvelope>) {
        let now = Utc::now();
        let mut current = state;
        let mut processed = Vec::new();

        let keys: Vec<String> = self.buffers.keys().cloned().collect();
        for key in keys {
            let Some(buffer) = self.buffers.remove(&key) else { continue };
            let mut events: Vec<BufferedEvent> = buffer.into_iter().collect();
            sort_events(&mut events);

            let mut remaining = VecDeque::new();
            for buffered in events {
                if self.is_ready(&buffered, &current, now) {
                    current = self.apply(current, &buffered.envelope);
                    self.processed_ids.insert(buffered.envelope.event_id.clone());
                    self.total_processed += 1;
                    processed.push(buffered.envelope);
                } else {
                    remaining.push_back(buffered);
                }
            }
            if !remaining.is_empty() {
                self.buffers.insert(key, remaining);
            }
        }

        (current, processed)
    }

    /// Drain everything regardless of age, in globally deterministic order.
    pub fn flush_all(&mut self, state: State) -> (State, Vec<EventEnvelope>) {
        let mut events: Vec<BufferedEvent> = self.buffers.drain().flat_map(|(_, b)| b).collect();
        sort_events(&mut events);

        let mut current = state;
        let mut processed = Vec::new();
        for buffered in events {
            if self.processed_ids.contains(&buffered.envelope.event_id) {
                continue;
            }
            current = self.apply(current, &buffered.envelope);
            self.processed_ids.insert(buffered.envelope.event_id.clone());
            self.total_processed += 1;
            processed.push(buffered.envelope);
        }

        (current, processed)
    }

    fn is_ready(&self, buffered: &BufferedEvent, state: &State, now: DateTime<Utc>) -> bool {
        if buffered.age(now) >= self.grace_period {
            return true;
        }
        if self.grace_period > FAST_PATH_MIN_GRACE {
            if let Some(reducer) = self.reducers.resolve(&buffered.envelope.event_type) {
                return reducer.can_apply(state, &buffered.envelope);
            }
        }
        false
    }

    fn apply(&self, state: State, envelope: &EventEnvelope) -> State {
        match self.reducers.resolve(&envelope.event_type) {
            Some(reducer) => reducer.apply(state, envelope),
            // No reducer registered: the event is still marked processed.
            None => state,
        }
    }

    fn evict_oldest(&mut self) {
        let oldest_key = self
            .buffers
            .iter()
            .filter_map(|(key, buffer)| buffer.front().map(|b| (key.clone(), b.received_at)))
            .min_by_key(|(_, received_at)| *received_at)
            .map(|(key, _)| key);

        if let Some(key) = oldest_key {
            if let Some(buffer) = self.buffers.get_mut(&key) {
                if let Some(dropped) = buffer.pop_front() {
                    warn!(
                        event_id = %dropped.envelope.event_id,
                        entity = %key,
                        "buffer full, evicting oldest event"
                    );
                    self.total_evicted += 1;
                }
                if buffer.is_empty() {
                    self.buffers.remove(&key);
                }
            }
        }
    }

    /// Currently buffered envelope count.
    pub fn buffered_len(&self) -> usize {
        self.buffers.values().map(VecDeque::len).sum()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            total_received: self.total_received,
            total_processed: self.total_processed,
            total_evicted: self.total_evicted,
            buffered_peak: self.buffered_peak,
            currently_buffered: self.buffered_len(),
            unique_entities: self.buffers.len(),
        }
    }
}

/// Bucket key for an envelope: the first of the payload's `entity_id`,
/// `id`, `task_id`, `note_id`, else the event type.
pub fn entity_key(envelope: &EventEnvelope) -> String {
    for key in ["entity_id", "id", "task_id", "note_id"] {
        if let Some(value) = envelope.payload.get(key) {
            match value {
                Value::String(s) => return s.clone(),
                other => return other.to_string(),
            }
        }
    }
    envelope.event_type.clone()
}

fn sort_events(events: &mut [BufferedEvent]) {
    events.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
}

fn sort_key(buffered: &BufferedEvent) -> (DateTime<Utc>, i64, String) {
    let ts = kira_time::parse_utc_iso8601(&buffered.envelope.event_ts)
        .unwrap_or(buffered.received_at);
    (
        ts,
        buffered.envelope.seq.unwrap_or(0),
        buffered.envelope.event_id.clone(),
    )
}
