//! Concurrency-safe event fan-out to stream subscribers.

use chrono::Utc;
use gantry_core::events::{Event, EventType};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Bounded capacity of each subscriber's delivery channel.
pub const SUBSCRIBER_BUFFER: usize = 100;

struct BroadcasterState {
    clients: HashMap<String, mpsc::Sender<Event>>,
    closed: bool,
}

/// Fan-out of structured events to zero or more subscribers.
///
/// Delivery is best-effort per subscriber: a full sink never delays the
/// others and gets its subscriber evicted. There is no replay of missed
/// events. Broadcasts take the subscriber table read lock;
/// registration and removal take the write lock.
#[derive(Clone)]
pub struct EventBroadcaster {
    state: Arc<RwLock<BroadcasterState>>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(BroadcasterState {
                clients: HashMap::new(),
                closed: false,
            })),
        }
    }

    /// Register a delivery sink and return the subscriber id.
    ///
    /// The subscriber immediately receives one `connection` event
    /// carrying its id. Registration fails if the broadcaster is closed
    /// or the sink cannot accept that first event.
    pub fn add_subscriber(&self, sink: mpsc::Sender<Event>) -> Option<String> {
        let mut state = self.state.write().unwrap();
        if state.closed {
            return None;
        }

        let subscriber_id = Uuid::new_v4().to_string();

        let mut data = Map::new();
        data.insert(
            "message".to_string(),
            Value::String("Connected to Gantry event stream".to_string()),
        );
        data.insert(
            "clientId".to_string(),
            Value::String(subscriber_id.clone()),
        );
        let mut welcome = Event::new(EventType::Connection, data);
        stamp(&mut welcome);

        if sink.try_send(welcome).is_err() {
            return None;
        }

        state.clients.insert(subscriber_id.clone(), sink);
        debug!(subscriber = %subscriber_id, "Subscriber registered");
        Some(subscriber_id)
    }

    /// Remove a subscriber, closing its sink.
    pub fn remove_subscriber(&self, subscriber_id: &str) {
        let mut state = self.state.write().unwrap();
        if state.clients.remove(subscriber_id).is_some() {
            debug!(subscriber = %subscriber_id, "Subscriber removed");
        }
    }

    /// Deliver an event to every current subscriber without blocking.
    ///
    /// Assigns the event id and timestamp if unset. Subscribers whose
    /// sink is full or gone are evicted after the delivery pass.
    pub fn broadcast(&self, mut event: Event) {
        stamp(&mut event);

        let stale: Vec<String> = {
            let state = self.state.read().unwrap();
            if state.closed {
                return;
            }

            state
                .clients
                .iter()
                .filter_map(|(id, sink)| sink.try_send(event.clone()).is_err().then(|| id.clone()))
                .collect()
        };

        for subscriber_id in stale {
            self.remove_subscriber(&subscriber_id);
        }
    }

    /// Close the broadcaster: drop every sink and turn further
    /// broadcasts into no-ops.
    pub fn close(&self) {
        let mut state = self.state.write().unwrap();
        state.closed = true;
        state.clients.clear();
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.read().unwrap().clients.len()
    }
}

fn stamp(event: &mut Event) {
    if event.id.is_empty() {
        event.id = Uuid::new_v4().to_string();
    }
    if event.timestamp.is_none() {
        event.timestamp = Some(Utc::now());
    }
}
