use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowgate_core::config::EventsConfig;
use flowgate_core::error::Result;
use flowgate_core::event::{EventBus, EventEnvelope, Topic};

use crate::socket::{ObserverSocket, ReadyState};

pub type ObserverId = u64;

/// Pongs may lag this many heartbeat intervals before the observer is dropped.
const IDLE_INTERVALS: u32 = 3;

struct Observer {
    socket: Arc<dyn ObserverSocket>,
    topics: HashSet<Topic>,
    last_pong: Instant,
}

/// Per-publish delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub sent: usize,
    pub dropped: usize,
}

/// Fans validated envelopes out to connected observers by topic.
///
/// Publishing never waits on a reader: an observer whose outbound buffer is
/// over the threshold simply misses the message, and the miss is counted.
pub struct ObserverHub {
    observers: Mutex<HashMap<ObserverId, Observer>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    buffer_threshold: usize,
    heartbeat: Duration,
}

impl ObserverHub {
    pub fn new(buffer_threshold: usize, heartbeat: Duration) -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            buffer_threshold,
            heartbeat,
        }
    }

    pub fn from_config(config: &EventsConfig) -> Self {
        Self::new(
            config.buffer_threshold_bytes,
            Duration::from_secs(config.heartbeat_interval_secs.max(1)),
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ObserverId, Observer>> {
        // A panic mid-update leaves the map itself intact.
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an observer. New observers start subscribed to every topic.
    pub fn register(&self, socket: Arc<dyn ObserverSocket>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(
            id,
            Observer {
                socket,
                topics: Topic::ALL.into_iter().collect(),
                last_pong: Instant::now(),
            },
        );
        debug!(observer = id, "Observer registered");
        id
    }

    pub fn remove(&self, id: ObserverId) {
        if self.lock().remove(&id).is_some() {
            debug!(observer = id, "Observer removed");
        }
    }

    /// Returns the observer's topic set after the change.
    pub fn subscribe(&self, id: ObserverId, topics: &[Topic]) -> Option<Vec<Topic>> {
        let mut observers = self.lock();
        let observer = observers.get_mut(&id)?;
        observer.topics.extend(topics.iter().copied());
        Some(sorted(&observer.topics))
    }

    pub fn unsubscribe(&self, id: ObserverId, topics: &[Topic]) -> Option<Vec<Topic>> {
        let mut observers = self.lock();
        let observer = observers.get_mut(&id)?;
        for topic in topics {
            observer.topics.remove(topic);
        }
        Some(sorted(&observer.topics))
    }

    pub fn topics(&self, id: ObserverId) -> Option<Vec<Topic>> {
        self.lock().get(&id).map(|o| sorted(&o.topics))
    }

    pub fn pong(&self, id: ObserverId) {
        if let Some(observer) = self.lock().get_mut(&id) {
            observer.last_pong = Instant::now();
        }
    }

    pub fn observer_count(&self) -> usize {
        self.lock().len()
    }

    /// Messages skipped for slow observers since startup.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Validate `payload` for `event` and deliver it.
    pub fn publish<P: Serialize>(&self, event: &str, payload: &P) -> Result<EventEnvelope> {
        let envelope = EventEnvelope::build(event, serde_json::to_value(payload)?)?;
        self.deliver(&envelope)?;
        Ok(envelope)
    }

    /// Deliver an already validated envelope to every matching observer.
    pub fn deliver(&self, envelope: &EventEnvelope) -> Result<Delivery> {
        let text = serde_json::to_string(envelope)?;
        let mut delivery = Delivery::default();

        for (id, observer) in self.lock().iter() {
            if !envelope.topics.iter().any(|t| observer.topics.contains(t)) {
                continue;
            }
            if observer.socket.ready_state() != ReadyState::Open {
                continue;
            }
            if observer.socket.buffered_amount() > self.buffer_threshold {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                delivery.dropped += 1;
                debug!(observer = id, event = %envelope.event, "Observer backlogged, message dropped");
                continue;
            }
            match observer.socket.send(text.clone()) {
                Ok(()) => delivery.sent += 1,
                Err(e) => debug!(observer = id, error = %e, "Send failed"),
            }
        }
        Ok(delivery)
    }

    /// One heartbeat round: close idle observers, drop closed ones, ping the rest.
    ///
    /// Returns the ids that were removed.
    pub fn heartbeat_tick(&self) -> Vec<ObserverId> {
        let idle_after = self.heartbeat * IDLE_INTERVALS;
        let now = Instant::now();
        let mut removed = Vec::new();

        let mut observers = self.lock();
        observers.retain(|id, observer| {
            if observer.socket.ready_state() == ReadyState::Closed {
                removed.push(*id);
                return false;
            }
            if now.duration_since(observer.last_pong) >= idle_after {
                info!(observer = id, "Closing idle observer");
                observer.socket.close("idle");
                removed.push(*id);
                return false;
            }
            observer.socket.ping();
            true
        });
        removed
    }

    /// Ping on every heartbeat interval until `shutdown`.
    pub fn spawn_heartbeat(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(Instant::now() + hub.heartbeat, hub.heartbeat);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => {
                        hub.heartbeat_tick();
                    }
                }
            }
        })
    }

    /// Forward everything published on `bus` to observers until `shutdown`.
    pub fn spawn_relay(self: &Arc<Self>, bus: &EventBus, shutdown: CancellationToken) -> JoinHandle<()> {
        let hub = self.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    received = rx.recv() => received,
                };
                match envelope {
                    Ok(envelope) => {
                        if let Err(e) = hub.deliver(&envelope) {
                            warn!(event = %envelope.event, error = %e, "Failed to relay event");
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        // Lost for every observer; counted with backpressure drops.
                        hub.dropped.fetch_add(n, Ordering::SeqCst);
                        warn!(skipped = n, "Observer relay lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }
}

fn sorted(topics: &HashSet<Topic>) -> Vec<Topic> {
    Topic::ALL.into_iter().filter(|t| topics.contains(t)).collect()
}
