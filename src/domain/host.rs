//! Receive-side state shared between a communicator and its transport

use crate::domain::handshake::{HandshakePolicy, HandshakeTracker, Inspection};
use crate::domain::listener::BodynodeListener;
use crate::domain::models::{ConnectionStatus, Endpoint, SensorKey, SensorMessage};
use crate::domain::store::MessageStore;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct HostState {
    store: MessageStore,
    tracker: Mutex<HandshakeTracker>,
    listeners: Mutex<Vec<Weak<dyn BodynodeListener>>>,
}

impl HostState {
    pub fn new(keep_alive: Duration) -> Self {
        Self {
            store: MessageStore::new(),
            tracker: Mutex::new(HandshakeTracker::new(keep_alive)),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn inspect(
        &self,
        endpoint: &Endpoint,
        bytes: &[u8],
        policy: HandshakePolicy,
        now: Instant,
    ) -> Inspection {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .inspect(endpoint, bytes, policy, now)
    }

    pub fn touch(&self, endpoint: &Endpoint, now: Instant) {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .touch(endpoint, now);
    }

    /// Expire silent connections
    pub fn sweep(&self, now: Instant) -> Vec<Endpoint> {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .expire(now)
    }

    pub fn connection_status(&self, endpoint: &Endpoint) -> Option<ConnectionStatus> {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status(endpoint)
    }

    pub fn freeze(&self) {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .freeze();
    }

    /// Forget readings, bindings and connection states
    pub fn reset(&self) {
        self.store.clear();
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Validate one parsed JSON object and process it.
    ///
    /// Returns `false` when the object is not a complete sensor message.
    pub fn handle_message(&self, endpoint: &Endpoint, message: &Value) -> bool {
        match SensorMessage::from_json(message) {
            Some(message) => {
                self.handle_sensor_message(endpoint, message);
                true
            }
            None => {
                warn!("Incomplete message from {}: {}", endpoint, message);
                false
            }
        }
    }

    /// Bind the sender, store the value and notify listeners
    pub fn handle_sensor_message(&self, endpoint: &Endpoint, message: SensorMessage) {
        let SensorMessage { key, value } = message;
        self.store.bind(&key.player, &key.bodypart, endpoint.clone());
        self.store.put(key.clone(), value.clone(), endpoint.clone());
        self.dispatch(&key, &value);
    }

    fn dispatch(&self, key: &SensorKey, value: &Value) {
        let listeners: Vec<Arc<dyn BodynodeListener>> = {
            let mut guard = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            guard.retain(|l| l.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };

        for listener in listeners {
            if listener.is_of_interest(&key.player, &key.bodypart, &key.sensortype) {
                listener.on_message_received(&key.player, &key.bodypart, &key.sensortype, value);
            }
        }
    }

    pub fn add_listener(&self, listener: Weak<dyn BodynodeListener>) -> bool {
        if listener.strong_count() == 0 {
            warn!("Given listener is empty");
            return false;
        }
        let mut guard = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.iter().any(|l| Weak::ptr_eq(l, &listener)) {
            debug!("Listener already registered");
            return false;
        }
        guard.push(listener);
        true
    }

    pub fn remove_listener(&self, listener: &Weak<dyn BodynodeListener>) -> bool {
        let mut guard = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = guard.len();
        guard.retain(|l| !Weak::ptr_eq(l, listener));
        guard.len() != before
    }

    pub fn remove_all_listeners(&self) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }
}
