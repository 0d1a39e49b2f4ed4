//! Connection handshake and keep-alive tracking
//!
//! A node announces itself with `ACK` (unicast hosts) or `ACKN` (keep-alive
//! hosts) and expects `ACK` / `ACKH` back. Tokens are searched anywhere in the
//! received window, not only as a prefix.

use crate::domain::models::{ConnectionStatus, Endpoint};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const DEFAULT_KEEP_ALIVE_MS: u64 = 60_000;

/// Handshake token found in a received window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckToken {
    Ack,
    Ackn,
}

impl AckToken {
    pub fn find(bytes: &[u8]) -> Option<Self> {
        if contains(bytes, b"ACKN") {
            Some(Self::Ackn)
        } else if contains(bytes, b"ACK") {
            Some(Self::Ack)
        } else {
            None
        }
    }

    pub fn reply(self) -> &'static [u8] {
        match self {
            Self::Ack => b"ACK",
            Self::Ackn => b"ACKH",
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Whether payloads are accepted before the handshake completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakePolicy {
    RequireAck,
    ParseImmediately,
}

/// What to do with one received window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inspection {
    /// A token was found: send `reply`, do not parse the window
    Handshake { reply: &'static [u8] },
    /// Parse the window as sensor data
    Payload,
    /// Endpoint has not completed the handshake, drop the window
    Ignored,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub last_received_at: Instant,
}

#[derive(Debug)]
pub struct HandshakeTracker {
    keep_alive: Duration,
    connections: HashMap<Endpoint, ConnectionState>,
}

impl HandshakeTracker {
    pub fn new(keep_alive: Duration) -> Self {
        Self {
            keep_alive,
            connections: HashMap::new(),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn state(&self, endpoint: &Endpoint) -> Option<ConnectionState> {
        self.connections.get(endpoint).copied()
    }

    pub fn status(&self, endpoint: &Endpoint) -> Option<ConnectionStatus> {
        self.state(endpoint).map(|s| s.status)
    }

    /// Classify a received window and update the endpoint's state.
    ///
    /// Unseen endpoints are created in `WaitingAck`.
    pub fn inspect(
        &mut self,
        endpoint: &Endpoint,
        bytes: &[u8],
        policy: HandshakePolicy,
        now: Instant,
    ) -> Inspection {
        let state = self
            .connections
            .entry(endpoint.clone())
            .or_insert_with(|| {
                debug!("New connection from {}", endpoint);
                ConnectionState {
                    status: ConnectionStatus::WaitingAck,
                    last_received_at: now,
                }
            });

        if let Some(token) = AckToken::find(bytes) {
            if state.status != ConnectionStatus::Connected {
                info!("{} connected ({:?})", endpoint, token);
            }
            state.status = ConnectionStatus::Connected;
            state.last_received_at = now;
            return Inspection::Handshake {
                reply: token.reply(),
            };
        }

        if state.status == ConnectionStatus::WaitingAck && policy == HandshakePolicy::RequireAck {
            return Inspection::Ignored;
        }

        state.last_received_at = now;
        Inspection::Payload
    }

    /// Record traffic on a link that has no handshake: any data counts as
    /// being connected.
    pub fn touch(&mut self, endpoint: &Endpoint, now: Instant) {
        let state = self
            .connections
            .entry(endpoint.clone())
            .or_insert(ConnectionState {
                status: ConnectionStatus::WaitingAck,
                last_received_at: now,
            });
        if state.status != ConnectionStatus::Connected {
            info!("{} connected", endpoint);
        }
        state.status = ConnectionStatus::Connected;
        state.last_received_at = now;
    }

    /// Move silent `Connected` endpoints to `Disconnected`.
    ///
    /// Returns the endpoints that changed state.
    pub fn expire(&mut self, now: Instant) -> Vec<Endpoint> {
        let keep_alive = self.keep_alive;
        let mut expired = Vec::new();
        for (endpoint, state) in self.connections.iter_mut() {
            if state.status == ConnectionStatus::Connected
                && now.saturating_duration_since(state.last_received_at) > keep_alive
            {
                state.status = ConnectionStatus::Disconnected;
                expired.push(endpoint.clone());
            }
        }
        for endpoint in &expired {
            info!("{} disconnected: keep-alive expired", endpoint);
        }
        expired
    }

    /// Mark every endpoint `Disconnected`, used when the transport stops
    pub fn freeze(&mut self) {
        for state in self.connections.values_mut() {
            state.status = ConnectionStatus::Disconnected;
        }
    }

    pub fn clear(&mut self) {
        self.connections.clear();
    }
}
