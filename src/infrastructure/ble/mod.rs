//! Bluetooth LE transport
//!
//! - [`central`] - scan/connect capability the transport runs on
//! - [`protocol`] - GATT profile and payload decoding
//! - `winrt` - Windows backend for [`central`]

pub mod central;
pub mod protocol;
#[cfg(windows)]
pub mod winrt;

use crate::domain::host::HostState;
use crate::domain::models::{Endpoint, SensorKey, SensorMessage};
use crate::domain::settings::BleSettings;
use crate::error::{Error, Result};
use crate::infrastructure::transport::Transport;
use central::{BleCentral, BlePeripheral};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::{JoinHandle as TaskHandle, LocalSet};
use tracing::{debug, error, info, warn};

const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(10);

pub struct BleTransport<C> {
    settings: BleSettings,
    central: Arc<C>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl<C> BleTransport<C>
where
    C: BleCentral + Send + Sync + 'static,
{
    pub fn new(settings: BleSettings, central: C) -> Self {
        Self {
            settings,
            central: Arc::new(central),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl<C> Transport for BleTransport<C>
where
    C: BleCentral + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "ble"
    }

    fn start(&mut self, identifiers: &[String], state: Arc<HostState>) -> Result<()> {
        if identifiers.is_empty() {
            return Err(Error::InvalidIdentifiers(
                "BLE expects at least one advertised name".to_string(),
            ));
        }

        self.stop();

        self.running.store(true, Ordering::SeqCst);
        let names = identifiers.to_vec();
        let central = self.central.clone();
        let settings = self.settings.clone();
        let running = self.running.clone();

        let worker = thread::Builder::new()
            .name("bodynodes-ble".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create BLE runtime: {}", e);
                        return;
                    }
                };
                let local = LocalSet::new();
                local.block_on(&rt, run_session(central, settings, names, state, running));
            });

        match worker {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("BLE thread panicked");
            }
            info!("BLE transport stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.worker.is_some() && self.running.load(Ordering::SeqCst)
    }

    fn send(&self, endpoint: &Endpoint, _bytes: &[u8]) -> Result<()> {
        debug!("Dropping outbound message for {}", endpoint);
        Err(Error::NotSupported("BLE outbound messages"))
    }
}

impl<C> Drop for BleTransport<C> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Identity of a connected node, read from its GATT profile
struct NodeIdentity {
    endpoint: Endpoint,
    player: String,
    bodypart: String,
}

async fn run_session<C: BleCentral>(
    central: Arc<C>,
    settings: BleSettings,
    names: Vec<String>,
    state: Arc<HostState>,
    running: Arc<AtomicBool>,
) {
    info!("Scanning for {:?}", names);
    let peripherals = match central.discover(&names, settings.scan_timeout()).await {
        Ok(peripherals) => peripherals,
        Err(e) => {
            warn!("BLE scan failed: {}", e);
            Vec::new()
        }
    };

    let mut connected = Vec::new();
    let mut tasks: Vec<TaskHandle<()>> = Vec::new();

    for peripheral in peripherals {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let name = peripheral.name();
        if !names.contains(&name) {
            debug!("Skipping {}", name);
            continue;
        }

        let peripheral = Rc::new(peripheral);
        match setup_peripheral(peripheral.as_ref(), &settings, &state).await {
            Ok((identity, subscriptions)) => {
                let identity = Rc::new(identity);
                for (characteristic, sensortype, receiver) in subscriptions {
                    tasks.push(tokio::task::spawn_local(listen(
                        peripheral.clone(),
                        identity.clone(),
                        settings.service_uuid.to_lowercase(),
                        characteristic,
                        sensortype,
                        receiver,
                        state.clone(),
                        running.clone(),
                        settings.notification_timeout(),
                    )));
                }
                connected.push(peripheral);
            }
            Err(e) => {
                warn!("Connection failed to {}: {}", name, e);
                let _ = peripheral.disconnect().await;
            }
        }
    }

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(STOP_CHECK_INTERVAL).await;
        state.sweep(Instant::now());
    }

    for task in tasks {
        let _ = task.await;
    }
    for peripheral in connected {
        if let Err(e) = peripheral.disconnect().await {
            debug!("Disconnect of {} failed: {}", peripheral.address(), e);
        }
    }
}

type Subscription = (String, &'static str, UnboundedReceiver<Vec<u8>>);

async fn setup_peripheral<P: BlePeripheral>(
    peripheral: &P,
    settings: &BleSettings,
    state: &HostState,
) -> Result<(NodeIdentity, Vec<Subscription>)> {
    let service = settings.service_uuid.to_lowercase();
    info!("Connecting to {} ({})", peripheral.name(), peripheral.address());
    peripheral.connect().await?;

    let available: Vec<String> = peripheral
        .characteristics(&service)
        .await?
        .into_iter()
        .map(|uuid| uuid.to_lowercase())
        .collect();

    let player_uuid = settings.player_char_uuid.to_lowercase();
    let bodypart_uuid = settings.bodypart_char_uuid.to_lowercase();
    if !available.contains(&player_uuid) || !available.contains(&bodypart_uuid) {
        return Err(Error::Gatt(
            "player/bodypart characteristics not found".to_string(),
        ));
    }

    let player = protocol::decode_text(&peripheral.read(&service, &player_uuid).await?);
    let bodypart = protocol::decode_text(&peripheral.read(&service, &bodypart_uuid).await?);
    let endpoint = Endpoint::new(peripheral.address());
    info!("{} is {} / {}", endpoint, player, bodypart);
    state.store().bind(&player, &bodypart, endpoint.clone());

    let mut subscriptions = Vec::new();
    for (uuid, sensortype) in protocol::data_characteristics(settings) {
        if !available.contains(&uuid) {
            continue;
        }
        match peripheral.subscribe(&service, &uuid).await {
            Ok(receiver) => {
                debug!("Subscribed to {} on {}", sensortype, endpoint);
                subscriptions.push((uuid, sensortype, receiver));
            }
            Err(e) => warn!("Cannot subscribe to {} on {}: {}", sensortype, endpoint, e),
        }
    }

    Ok((
        NodeIdentity {
            endpoint,
            player,
            bodypart,
        },
        subscriptions,
    ))
}

#[allow(clippy::too_many_arguments)]
async fn listen<P: BlePeripheral>(
    peripheral: Rc<P>,
    identity: Rc<NodeIdentity>,
    service: String,
    characteristic: String,
    sensortype: &'static str,
    mut receiver: UnboundedReceiver<Vec<u8>>,
    state: Arc<HostState>,
    running: Arc<AtomicBool>,
    timeout: Duration,
) {
    while running.load(Ordering::SeqCst) {
        match tokio::time::timeout(timeout, receiver.recv()).await {
            Ok(Some(bytes)) => match protocol::decode_characteristic(sensortype, &bytes) {
                Ok(value) => {
                    state.touch(&identity.endpoint, Instant::now());
                    let key = SensorKey::new(
                        identity.player.as_str(),
                        identity.bodypart.as_str(),
                        sensortype,
                    );
                    state.handle_sensor_message(&identity.endpoint, SensorMessage::new(key, value));
                }
                Err(e) => warn!("Discarding notification from {}: {}", identity.endpoint, e),
            },
            Ok(None) => {
                debug!("Notifications of {} on {} ended", sensortype, identity.endpoint);
                break;
            }
            Err(_) => {}
        }
    }

    if let Err(e) = peripheral.unsubscribe(&service, &characteristic).await {
        debug!("Unsubscribe of {} failed: {}", characteristic, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ConnectionStatus;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

    /// In-memory node exposing a fixed GATT table
    #[derive(Clone)]
    struct MockPeripheral {
        name: String,
        address: String,
        values: HashMap<String, Vec<u8>>,
        notifiers: Arc<Mutex<HashMap<String, UnboundedSender<Vec<u8>>>>>,
        unsubscribed: Arc<Mutex<Vec<String>>>,
        disconnected: Arc<AtomicBool>,
    }

    impl BlePeripheral for MockPeripheral {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn address(&self) -> String {
            self.address.clone()
        }

        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn characteristics(&self, _service: &str) -> Result<Vec<String>> {
            Ok(self.values.keys().cloned().collect())
        }

        async fn read(&self, _service: &str, characteristic: &str) -> Result<Vec<u8>> {
            self.values
                .get(characteristic)
                .cloned()
                .ok_or_else(|| Error::Gatt(characteristic.to_string()))
        }

        async fn subscribe(&self, _service: &str, characteristic: &str) -> Result<UnboundedReceiver<Vec<u8>>> {
            let (tx, rx) = unbounded_channel();
            self.notifiers
                .lock()
                .unwrap()
                .insert(characteristic.to_string(), tx);
            Ok(rx)
        }

        async fn unsubscribe(&self, _service: &str, characteristic: &str) -> Result<()> {
            self.unsubscribed.lock().unwrap().push(characteristic.to_string());
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.disconnected.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockCentral {
        peripherals: Vec<MockPeripheral>,
    }

    impl BleCentral for MockCentral {
        type Peripheral = MockPeripheral;

        async fn discover(&self, names: &[String], _timeout: Duration) -> Result<Vec<MockPeripheral>> {
            Ok(self
                .peripherals
                .iter()
                .filter(|p| names.contains(&p.name))
                .cloned()
                .collect())
        }
    }

    fn node(settings: &BleSettings, name: &str, address: &str) -> MockPeripheral {
        let mut values = HashMap::new();
        values.insert(settings.player_char_uuid.clone(), b"mario\0".to_vec());
        values.insert(settings.bodypart_char_uuid.clone(), b"katana".to_vec());
        values.insert(settings.orientation_abs_char_uuid.clone(), Vec::new());
        values.insert(settings.shoe_char_uuid.clone(), Vec::new());
        MockPeripheral {
            name: name.to_string(),
            address: address.to_string(),
            values,
            notifiers: Arc::new(Mutex::new(HashMap::new())),
            unsubscribed: Arc::new(Mutex::new(Vec::new())),
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_notifications_reach_store() {
        let settings = BleSettings::default();
        let peripheral = node(&settings, "Bodynode_katana", "AA:BB:CC:DD:EE:01");
        let other = node(&settings, "SomethingElse", "AA:BB:CC:DD:EE:02");
        let notifiers = peripheral.notifiers.clone();
        let unsubscribed = peripheral.unsubscribed.clone();
        let disconnected = peripheral.disconnected.clone();

        let mut transport = BleTransport::new(
            settings.clone(),
            MockCentral {
                peripherals: vec![peripheral, other.clone()],
            },
        );
        let state = Arc::new(HostState::new(Duration::from_secs(60)));
        transport
            .start(&["Bodynode_katana".to_string()], state.clone())
            .unwrap();

        assert!(wait_for(|| notifiers.lock().unwrap().len() == 2));
        let endpoint = Endpoint::new("AA:BB:CC:DD:EE:01");
        assert_eq!(state.store().resolve("mario", "katana"), Some(endpoint.clone()));
        assert!(other.notifiers.lock().unwrap().is_empty());

        let payload: Vec<u8> = [1.0f32, 0.0, 0.0, 0.0]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();
        notifiers.lock().unwrap()[&settings.orientation_abs_char_uuid]
            .send(payload)
            .unwrap();

        let key = SensorKey::new("mario", "katana", "orientation_abs");
        assert!(wait_for(|| state.store().get(&key).is_some()));
        assert_eq!(state.store().get(&key), Some(json!([1.0, 0.0, 0.0, 0.0])));
        assert_eq!(state.connection_status(&endpoint), Some(ConnectionStatus::Connected));

        assert!(matches!(
            transport.send(&endpoint, b"{}"),
            Err(Error::NotSupported(_))
        ));

        transport.stop();
        assert!(!transport.is_running());
        assert_eq!(unsubscribed.lock().unwrap().len(), 2);
        assert!(disconnected.load(Ordering::SeqCst));
    }

    #[test]
    fn test_silent_node_expires() {
        let settings = BleSettings::default();
        let peripheral = node(&settings, "Bodynode_shoe", "AA:BB:CC:DD:EE:04");
        let notifiers = peripheral.notifiers.clone();

        let mut transport = BleTransport::new(
            settings.clone(),
            MockCentral {
                peripherals: vec![peripheral],
            },
        );
        let state = Arc::new(HostState::new(Duration::from_millis(50)));
        transport
            .start(&["Bodynode_shoe".to_string()], state.clone())
            .unwrap();
        assert!(wait_for(|| notifiers.lock().unwrap().len() == 2));

        notifiers.lock().unwrap()[&settings.shoe_char_uuid]
            .send(vec![1])
            .unwrap();
        let endpoint = Endpoint::new("AA:BB:CC:DD:EE:04");
        assert!(wait_for(|| state.connection_status(&endpoint)
            == Some(ConnectionStatus::Connected)));

        assert!(wait_for(|| state.connection_status(&endpoint)
            == Some(ConnectionStatus::Disconnected)));

        // A new notification revives the node
        notifiers.lock().unwrap()[&settings.shoe_char_uuid]
            .send(vec![2])
            .unwrap();
        assert!(wait_for(|| state.connection_status(&endpoint)
            == Some(ConnectionStatus::Connected)));
        transport.stop();
    }

    #[test]
    fn test_node_without_identity_is_skipped() {
        let settings = BleSettings::default();
        let mut peripheral = node(&settings, "Bodynode_head", "AA:BB:CC:DD:EE:03");
        peripheral.values.remove(&settings.player_char_uuid);
        let disconnected = peripheral.disconnected.clone();

        let mut transport = BleTransport::new(
            settings,
            MockCentral {
                peripherals: vec![peripheral],
            },
        );
        let state = Arc::new(HostState::new(Duration::from_secs(60)));
        transport
            .start(&["Bodynode_head".to_string()], state.clone())
            .unwrap();

        assert!(wait_for(|| disconnected.load(Ordering::SeqCst)));
        assert!(transport.is_running());
        transport.stop();
        assert!(state.store().is_empty());
    }

    #[test]
    fn test_rejects_empty_identifiers() {
        let mut transport = BleTransport::new(
            BleSettings::default(),
            MockCentral {
                peripherals: Vec::new(),
            },
        );
        let state = Arc::new(HostState::new(Duration::from_secs(60)));
        assert!(matches!(
            transport.start(&[], state),
            Err(Error::InvalidIdentifiers(_))
        ));
    }
}
