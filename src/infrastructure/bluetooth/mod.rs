//! Classic Bluetooth (RFCOMM) transport
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 RfcommTransport                   │
//! │   (receive thread, one link per paired node)      │
//! └─────────────────────┬────────────────────────────┘
//!                       │
//!            ┌──────────┴──────────┐
//!            ▼                     ▼
//!     ┌────────────┐        ┌────────────┐
//!     │    Sdp     │        │  Protocol  │
//!     │ - sdptool  │        │ - sync     │
//!     │ - sockets  │        │ - packets  │
//!     └────────────┘        └────────────┘
//! ```
//!
//! - [`sdp`] - channel lookup and link setup
//! - [`protocol`] - binary packet framing and decoding

pub mod protocol;
pub mod sdp;

use crate::domain::frames::FrameExtractor;
use crate::domain::handshake::{HandshakePolicy, Inspection};
use crate::domain::host::HostState;
use crate::domain::models::Endpoint;
use crate::domain::settings::{BluetoothSettings, WireFormat};
use crate::error::{Error, Result};
use crate::infrastructure::transport::Transport;
use protocol::PacketParser;
use sdp::{RfcommConnector, RfcommLink, SdpRfcommConnector};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

type LinkMap = Arc<Mutex<HashMap<Endpoint, Box<dyn RfcommLink>>>>;

/// Per-link stream decoder
enum Decoder {
    Binary(PacketParser),
    Json(FrameExtractor),
}

pub struct RfcommTransport {
    settings: BluetoothSettings,
    connector: Arc<dyn RfcommConnector>,
    links: LinkMap,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl RfcommTransport {
    pub fn new(settings: BluetoothSettings) -> Self {
        let connector = Arc::new(SdpRfcommConnector::new(settings.service_uuid16.clone()));
        Self::with_connector(settings, connector)
    }

    pub fn with_connector(settings: BluetoothSettings, connector: Arc<dyn RfcommConnector>) -> Self {
        Self {
            settings,
            connector,
            links: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Number of open links
    pub fn link_count(&self) -> usize {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Transport for RfcommTransport {
    fn name(&self) -> &'static str {
        "bluetooth"
    }

    fn start(&mut self, identifiers: &[String], state: Arc<HostState>) -> Result<()> {
        if identifiers.is_empty() {
            return Err(Error::InvalidIdentifiers(
                "Bluetooth expects at least one device address".to_string(),
            ));
        }

        self.stop();

        self.running.store(true, Ordering::SeqCst);
        let worker = {
            let addresses = identifiers.to_vec();
            let connector = self.connector.clone();
            let links = self.links.clone();
            let running = self.running.clone();
            let settings = self.settings.clone();
            thread::Builder::new()
                .name("bodynodes-rfcomm".to_string())
                .spawn(move || {
                    connect_all(&addresses, connector.as_ref(), &links);
                    receive_loop(settings, links, state, running);
                })
        };

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
                warn!("RFCOMM receive thread panicked");
            }
            info!("Bluetooth transport stopped");
        }
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn is_running(&self) -> bool {
        self.worker.is_some() && self.running.load(Ordering::SeqCst)
    }

    fn send(&self, endpoint: &Endpoint, bytes: &[u8]) -> Result<()> {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        let link = links
            .get_mut(endpoint)
            .ok_or_else(|| Error::UnknownEndpoint(endpoint.to_string()))?;
        link.write_all(bytes)?;
        link.flush()?;
        Ok(())
    }
}

impl Drop for RfcommTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn connect_all(addresses: &[String], connector: &dyn RfcommConnector, links: &LinkMap) {
    for address in addresses {
        info!("Trying to connect to {}", address);
        match connector.connect(address) {
            Ok(link) => {
                info!("Connected to {}", address);
                links
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(Endpoint::new(address.as_str()), link);
            }
            Err(e) => warn!("Connection failed to {}: {}", address, e),
        }
    }
}

/// Drain every link once without blocking
fn read_links(links: &LinkMap, buffer: &mut [u8]) -> Vec<(Endpoint, Vec<u8>)> {
    let mut received = Vec::new();
    let mut closed = Vec::new();
    let mut links = links.lock().unwrap_or_else(PoisonError::into_inner);

    for (endpoint, link) in links.iter_mut() {
        match link.read(buffer) {
            Ok(0) => closed.push(endpoint.clone()),
            Ok(len) => received.push((endpoint.clone(), buffer[..len].to_vec())),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("Read from {} failed: {}", endpoint, e);
                closed.push(endpoint.clone());
            }
        }
    }

    for endpoint in closed {
        info!("Link to {} closed", endpoint);
        links.remove(&endpoint);
    }
    received
}

fn receive_loop(
    settings: BluetoothSettings,
    links: LinkMap,
    state: Arc<HostState>,
    running: Arc<AtomicBool>,
) {
    let mut buffer = vec![0u8; settings.buffer_size];
    let mut decoders: HashMap<Endpoint, Decoder> = HashMap::new();
    let poll_interval = settings.poll_interval();

    while running.load(Ordering::SeqCst) {
        let received = read_links(&links, &mut buffer);
        let idle = received.is_empty();

        for (endpoint, bytes) in received {
            let decoder = decoders
                .entry(endpoint.clone())
                .or_insert_with(|| match settings.wire_format {
                    WireFormat::Binary => Decoder::Binary(PacketParser::new()),
                    WireFormat::Json => Decoder::Json(FrameExtractor::with_limit(
                        settings.frame_recovery,
                        settings.max_pending_bytes,
                    )),
                });

            match decoder {
                Decoder::Binary(parser) => {
                    state.touch(&endpoint, Instant::now());
                    for packet in parser.feed(&bytes) {
                        match protocol::decode_packet(&packet, &settings.default_player) {
                            Ok(message) => state.handle_sensor_message(&endpoint, message),
                            Err(e) => debug!("Skipping packet from {}: {}", endpoint, e),
                        }
                    }
                }
                Decoder::Json(extractor) => {
                    match state.inspect(
                        &endpoint,
                        &bytes,
                        HandshakePolicy::ParseImmediately,
                        Instant::now(),
                    ) {
                        Inspection::Handshake { reply } => {
                            reply_on_link(&links, &endpoint, reply);
                        }
                        Inspection::Payload => {
                            for message in extractor.push(&bytes) {
                                state.handle_message(&endpoint, &message);
                            }
                        }
                        Inspection::Ignored => {}
                    }
                }
            }
        }

        state.sweep(Instant::now());
        if idle {
            thread::sleep(poll_interval);
        }
    }
}

fn reply_on_link(links: &LinkMap, endpoint: &Endpoint, reply: &[u8]) {
    let mut links = links.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(link) = links.get_mut(endpoint) {
        if let Err(e) = link.write_all(reply) {
            warn!("Cannot answer handshake of {}: {}", endpoint, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ConnectionStatus, SensorKey};
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::time::Duration;

    /// Serial links backed by loopback TCP streams
    struct LoopbackConnector {
        target: SocketAddr,
    }

    impl RfcommConnector for LoopbackConnector {
        fn connect(&self, address: &str) -> Result<Box<dyn RfcommLink>> {
            if address.starts_with("00:00") {
                return Err(Error::PortResolution(address.to_string()));
            }
            let stream = TcpStream::connect(self.target)?;
            stream.set_nonblocking(true)?;
            Ok(Box::new(stream))
        }
    }

    fn setup(wire_format: WireFormat) -> (RfcommTransport, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let connector = Arc::new(LoopbackConnector {
            target: listener.local_addr().unwrap(),
        });
        let settings = BluetoothSettings {
            wire_format,
            ..Default::default()
        };
        (RfcommTransport::with_connector(settings, connector), listener)
    }

    fn accept(listener: &TcpListener) -> TcpStream {
        let (node, _) = listener.accept().unwrap();
        node.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        node
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
    fn test_rejects_empty_identifiers() {
        let (mut transport, _listener) = setup(WireFormat::Binary);
        let state = Arc::new(HostState::new(Duration::from_secs(60)));
        assert!(matches!(
            transport.start(&[], state),
            Err(Error::InvalidIdentifiers(_))
        ));
    }

    #[test]
    fn test_binary_stream_and_failed_device_skipped() {
        let (mut transport, listener) = setup(WireFormat::Binary);
        let state = Arc::new(HostState::new(Duration::from_secs(60)));
        let ids = vec!["00:00:00:00:00:00".to_string(), "24:95:2F:64:68:A6".to_string()];
        transport.start(&ids, state.clone()).unwrap();

        let mut node = accept(&listener);
        assert!(wait_for(|| transport.link_count() == 1));

        let packet = protocol::encode_orientation(0xD0, [1.0, 0.0, 0.0, 0.0]);
        node.write_all(&packet[..9]).unwrap();
        node.write_all(&packet[9..]).unwrap();

        let key = SensorKey::new("mario", "katana", "orientation_abs");
        assert!(wait_for(|| state.store().get(&key).is_some()));
        let endpoint = Endpoint::new("24:95:2F:64:68:A6");
        assert_eq!(state.store().resolve("mario", "katana"), Some(endpoint.clone()));
        assert_eq!(state.connection_status(&endpoint), Some(ConnectionStatus::Connected));

        transport.send(&endpoint, b"{\"type\":\"haptic\"}").unwrap();
        let mut buf = [0u8; 64];
        let n = node.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"{\"type\":\"haptic\"}");

        transport.stop();
        transport.stop();
        assert_eq!(transport.link_count(), 0);
        assert!(!transport.is_running());
    }

    #[test]
    fn test_json_stream_with_keep_alive() {
        let (mut transport, listener) = setup(WireFormat::Json);
        let state = Arc::new(HostState::new(Duration::from_secs(60)));
        transport
            .start(&["24:95:2F:64:68:A7".to_string()], state.clone())
            .unwrap();
        let mut node = accept(&listener);

        node.write_all(b"ACKN").unwrap();
        let mut buf = [0u8; 16];
        let n = node.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ACKH");

        node.write_all(br#"{"player":"luigi","bodypart":"head","#).unwrap();
        node.flush().unwrap();
        thread::sleep(Duration::from_millis(30));
        node.write_all(br#""sensortype":"shoe","value":[1]}"#).unwrap();

        let key = SensorKey::new("luigi", "head", "shoe");
        assert!(wait_for(|| state.store().get(&key).is_some()));
        assert_eq!(state.store().get(&key), Some(serde_json::json!([1])));
    }

    #[test]
    fn test_closed_link_is_dropped() {
        let (mut transport, listener) = setup(WireFormat::Binary);
        let state = Arc::new(HostState::new(Duration::from_secs(60)));
        transport
            .start(&["24:95:2F:64:68:A8".to_string()], state)
            .unwrap();
        let node = accept(&listener);
        assert!(wait_for(|| transport.link_count() == 1));

        drop(node);
        assert!(wait_for(|| transport.link_count() == 0));
        assert!(transport.is_running());
    }
}
