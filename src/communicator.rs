//! Host communicator: the consumer-facing API over one transport

use crate::domain::actions::Action;
use crate::domain::host::HostState;
use crate::domain::listener::BodynodeListener;
use crate::domain::models::{ConnectionStatus, Endpoint, SensorKey};
use crate::domain::settings::HostSettings;
use crate::error::Result;
use crate::infrastructure::ble::central::BleCentral;
use crate::infrastructure::ble::BleTransport;
use crate::infrastructure::bluetooth::sdp::RfcommConnector;
use crate::infrastructure::bluetooth::RfcommTransport;
use crate::infrastructure::transport::Transport;
use crate::infrastructure::wifi::WifiTransport;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Receives sensor data from Bodynodes and sends actions back to them.
///
/// `start` returns immediately; data arrives on a background thread and is
/// both stored (see [`HostCommunicator::get_message_value`]) and pushed to
/// registered listeners.
pub struct HostCommunicator {
    transport: Box<dyn Transport>,
    state: Arc<HostState>,
    actions: Mutex<Vec<Action>>,
}

impl HostCommunicator {
    pub fn new(transport: Box<dyn Transport>, keep_alive: Duration) -> Self {
        Self {
            transport,
            state: Arc::new(HostState::new(keep_alive)),
            actions: Mutex::new(Vec::new()),
        }
    }

    pub fn wifi(settings: &HostSettings) -> Self {
        let transport = WifiTransport::new(settings.wifi.clone());
        Self::new(Box::new(transport), settings.wifi.keep_alive())
    }

    pub fn bluetooth(settings: &HostSettings) -> Self {
        let transport = RfcommTransport::new(settings.bluetooth.clone());
        Self::new(Box::new(transport), settings.bluetooth.keep_alive())
    }

    pub fn bluetooth_with(settings: &HostSettings, connector: Arc<dyn RfcommConnector>) -> Self {
        let transport = RfcommTransport::with_connector(settings.bluetooth.clone(), connector);
        Self::new(Box::new(transport), settings.bluetooth.keep_alive())
    }

    #[cfg(windows)]
    pub fn ble(settings: &HostSettings) -> Self {
        Self::ble_with(settings, crate::infrastructure::ble::winrt::WinRtCentral)
    }

    pub fn ble_with<C>(settings: &HostSettings, central: C) -> Self
    where
        C: BleCentral + Send + Sync + 'static,
    {
        let transport = BleTransport::new(settings.ble.clone(), central);
        // BLE nodes have no keep-alive token; notifications are the only signal
        Self::new(Box::new(transport), settings.ble.keep_alive())
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Start a new session, stopping the previous one first
    pub fn start(&mut self, identifiers: &[String]) -> Result<()> {
        info!("{} communicator starting", self.transport.name());
        if self.transport.is_running() {
            self.stop();
        }
        self.state.reset();
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.transport.start(identifiers, self.state.clone())
    }

    /// Stop the session; returns once every background thread has exited
    pub fn stop(&mut self) {
        info!("{} communicator stopping", self.transport.name());
        self.transport.stop();
        self.state.freeze();
        self.state.remove_all_listeners();
    }

    pub fn is_running(&self) -> bool {
        self.transport.is_running()
    }

    pub fn get_message_value(&self, player: &str, bodypart: &str, sensortype: &str) -> Option<Value> {
        self.state
            .store()
            .get(&SensorKey::new(player, bodypart, sensortype))
    }

    pub fn add_listener(&self, listener: Weak<dyn BodynodeListener>) -> bool {
        self.state.add_listener(listener)
    }

    pub fn remove_listener(&self, listener: &Weak<dyn BodynodeListener>) -> bool {
        self.state.remove_listener(listener)
    }

    pub fn remove_all_listeners(&self) {
        self.state.remove_all_listeners();
    }

    pub fn add_action(&self, action: Action) {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action);
    }

    pub fn pending_actions(&self) -> usize {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Send every queued action to the node bound to its (player, bodypart).
    ///
    /// The queue is always emptied. Returns how many actions were sent.
    pub fn send_all_actions(&self) -> usize {
        let actions = std::mem::take(
            &mut *self.actions.lock().unwrap_or_else(PoisonError::into_inner),
        );

        let mut sent = 0;
        for action in actions {
            let Some(endpoint) = self.state.store().resolve(&action.player, &action.bodypart) else {
                warn!(
                    "Player+Bodypart connection not existing: {} {}",
                    action.player, action.bodypart
                );
                continue;
            };

            let bytes = match action.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Cannot serialize action: {}", e);
                    continue;
                }
            };

            match self.transport.send(&endpoint, &bytes) {
                Ok(()) => {
                    debug!("Action sent to {}", endpoint);
                    sent += 1;
                }
                Err(e) => warn!("Action to {} dropped: {}", endpoint, e),
            }
        }
        sent
    }

    pub fn connection_status(&self, endpoint: &Endpoint) -> Option<ConnectionStatus> {
        self.state.connection_status(endpoint)
    }

    /// Bound socket address of the WiFi transport
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }
}

impl Drop for HostCommunicator {
    fn drop(&mut self) {
        self.transport.stop();
    }
}
