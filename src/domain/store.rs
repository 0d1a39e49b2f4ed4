//! Latest-value message store and endpoint bindings

use crate::domain::models::{BodynodeId, Endpoint, SensorKey, SensorReading};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

/// Concurrent map of the most recent reading per key.
///
/// Written by transport receive threads, read by anyone. There is no
/// per-endpoint partitioning: the last writer for a key wins.
#[derive(Debug, Default)]
pub struct MessageStore {
    readings: RwLock<HashMap<SensorKey, SensorReading>>,
    bindings: RwLock<HashMap<BodynodeId, Endpoint>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: SensorKey, value: Value, source: Endpoint) {
        let reading = SensorReading {
            value,
            source,
            received_at: Instant::now(),
        };
        self.readings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, reading);
    }

    pub fn get(&self, key: &SensorKey) -> Option<Value> {
        self.reading(key).map(|r| r.value)
    }

    pub fn reading(&self, key: &SensorKey) -> Option<SensorReading> {
        self.readings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn bind(&self, player: &str, bodypart: &str, endpoint: Endpoint) {
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(BodynodeId::new(player, bodypart), endpoint);
    }

    pub fn resolve(&self, player: &str, bodypart: &str) -> Option<Endpoint> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&BodynodeId::new(player, bodypart))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.readings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.readings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
