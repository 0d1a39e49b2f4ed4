//! WiFi transport
//!
//! Nodes send UDP datagrams to the host port. A datagram is either a
//! handshake token (`ACK` / `ACKN`) or UTF-8 JSON sensor messages. Nodes are
//! keyed by IP address, the source port is only used to reply.

pub mod multicast;

use crate::domain::frames::FrameExtractor;
use crate::domain::handshake::{HandshakePolicy, Inspection};
use crate::domain::host::HostState;
use crate::domain::models::Endpoint;
use crate::domain::settings::WifiSettings;
use crate::error::{Error, Result};
use crate::infrastructure::transport::Transport;
use multicast::MulticastAnnouncer;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

type PeerMap = Arc<Mutex<HashMap<Endpoint, SocketAddr>>>;

pub struct WifiTransport {
    settings: WifiSettings,
    socket: Option<Arc<UdpSocket>>,
    peers: PeerMap,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    announcer: Option<MulticastAnnouncer>,
}

impl WifiTransport {
    pub fn new(settings: WifiSettings) -> Self {
        Self {
            settings,
            socket: None,
            peers: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            announcer: None,
        }
    }

    pub fn settings(&self) -> &WifiSettings {
        &self.settings
    }
}

/// Where replies to a datagram from `source` go
fn reply_address(source: SocketAddr, node_port: Option<u16>) -> SocketAddr {
    match node_port {
        Some(port) => SocketAddr::new(source.ip(), port),
        None => source,
    }
}

impl Transport for WifiTransport {
    fn name(&self) -> &'static str {
        "wifi"
    }

    fn start(&mut self, identifiers: &[String], state: Arc<HostState>) -> Result<()> {
        let token = match identifiers {
            [token] => token.clone(),
            _ => {
                return Err(Error::InvalidIdentifiers(format!(
                    "WiFi expects exactly one identifier, got {}",
                    identifiers.len()
                )))
            }
        };

        self.stop();

        let address = SocketAddrV4::new(self.settings.bind_address, self.settings.port);
        let socket = UdpSocket::bind(address).map_err(|source| Error::Bind {
            address: address.to_string(),
            source,
        })?;
        socket.set_nonblocking(true)?;
        let socket = Arc::new(socket);
        info!("WiFi transport listening on {}", socket.local_addr()?);

        if self.settings.multicast.enabled {
            self.announcer = Some(MulticastAnnouncer::start(&token, &self.settings.multicast)?);
        }

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let peers = self.peers.clone();
        let settings = self.settings.clone();
        let loop_socket = socket.clone();

        let worker = thread::Builder::new()
            .name("bodynodes-wifi".to_string())
            .spawn(move || receive_loop(loop_socket, settings, peers, state, running));

        match worker {
            Ok(worker) => {
                self.worker = Some(worker);
                self.socket = Some(socket);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                if let Some(mut announcer) = self.announcer.take() {
                    announcer.stop();
                }
                Err(e.into())
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("WiFi receive thread panicked");
            }
            info!("WiFi transport stopped");
        }
        if let Some(mut announcer) = self.announcer.take() {
            announcer.stop();
        }
        self.socket = None;
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn is_running(&self) -> bool {
        self.worker.is_some() && self.running.load(Ordering::SeqCst)
    }

    fn send(&self, endpoint: &Endpoint, bytes: &[u8]) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or(Error::NotSupported("send on a stopped WiFi transport"))?;
        let peer = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .copied()
            .ok_or_else(|| Error::UnknownEndpoint(endpoint.to_string()))?;
        socket.send_to(bytes, peer)?;
        trace!("Sent {} bytes to {}", bytes.len(), peer);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl Drop for WifiTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    socket: Arc<UdpSocket>,
    settings: WifiSettings,
    peers: PeerMap,
    state: Arc<HostState>,
    running: Arc<AtomicBool>,
) {
    let mut buffer = vec![0u8; settings.buffer_size];
    let mut extractors: HashMap<Endpoint, FrameExtractor> = HashMap::new();
    let poll_interval = settings.poll_interval();

    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buffer) {
            Ok((len, source)) => {
                let endpoint = Endpoint::from_ip(source.ip());
                let reply_to = reply_address(source, settings.node_port);
                peers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(endpoint.clone(), reply_to);

                let bytes = &buffer[..len];
                match state.inspect(&endpoint, bytes, HandshakePolicy::RequireAck, Instant::now()) {
                    Inspection::Handshake { reply } => {
                        if let Err(e) = socket.send_to(reply, reply_to) {
                            warn!("Cannot answer handshake of {}: {}", endpoint, e);
                        }
                    }
                    Inspection::Payload => {
                        let extractor = extractors.entry(endpoint.clone()).or_insert_with(|| {
                            FrameExtractor::with_limit(
                                settings.frame_recovery,
                                settings.max_pending_bytes,
                            )
                        });
                        for message in extractor.push(bytes) {
                            state.handle_message(&endpoint, &message);
                        }
                    }
                    Inspection::Ignored => {
                        debug!("Ignoring {} bytes from {}: waiting for ACK", len, endpoint);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(poll_interval);
            }
            Err(e) => {
                // Windows reports ICMP port unreachable on the next receive
                debug!("WiFi receive error: {}", e);
                thread::sleep(poll_interval);
            }
        }

        state.sweep(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ConnectionStatus, SensorKey};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn test_settings() -> WifiSettings {
        let mut settings = WifiSettings {
            bind_address: Ipv4Addr::LOCALHOST,
            port: 0,
            ..Default::default()
        };
        settings.multicast.enabled = false;
        settings
    }

    fn state() -> Arc<HostState> {
        Arc::new(HostState::new(Duration::from_secs(60)))
    }

    fn node(host: SocketAddr) -> UdpSocket {
        let node = UdpSocket::bind("127.0.0.1:0").unwrap();
        node.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        node.connect(host).unwrap();
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
    fn test_reply_address() {
        let source: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        assert_eq!(reply_address(source, None), source);
        assert_eq!(
            reply_address(source, Some(12345)),
            "10.0.0.2:12345".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_rejects_wrong_identifier_count() {
        let mut transport = WifiTransport::new(test_settings());
        assert!(matches!(
            transport.start(&[], state()),
            Err(Error::InvalidIdentifiers(_))
        ));
        let two = vec!["a".to_string(), "b".to_string()];
        assert!(matches!(
            transport.start(&two, state()),
            Err(Error::InvalidIdentifiers(_))
        ));
        assert!(!transport.is_running());
    }

    #[test]
    fn test_handshake_then_payload() {
        let state = state();
        let mut transport = WifiTransport::new(test_settings());
        transport.start(&["BN".to_string()], state.clone()).unwrap();
        let node = node(transport.local_addr().unwrap());
        let endpoint = Endpoint::new("127.0.0.1");
        let key = SensorKey::new("mario", "katana", "orientation_abs");

        // Data before the handshake is ignored
        node.send(br#"{"player":"mario","bodypart":"katana","sensortype":"orientation_abs","value":[0,0,0,1]}"#)
            .unwrap();
        assert!(wait_for(|| state.connection_status(&endpoint).is_some()));
        assert_eq!(state.store().get(&key), None);

        node.send(b"ACKN").unwrap();
        let mut buf = [0u8; 16];
        let n = node.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ACKH");
        assert_eq!(state.connection_status(&endpoint), Some(ConnectionStatus::Connected));

        node.send(br#"{"player":"mario","bodypart":"katana","sensortype":"orientation_abs","value":[1,0,0,0]}"#)
            .unwrap();
        assert!(wait_for(|| state.store().get(&key).is_some()));
        assert_eq!(state.store().resolve("mario", "katana"), Some(endpoint.clone()));

        transport.send(&endpoint, b"hello").unwrap();
        let n = node.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        transport.stop();
        assert!(!transport.is_running());
        assert!(transport.local_addr().is_none());
    }

    #[test]
    fn test_send_to_unknown_endpoint_fails() {
        let mut transport = WifiTransport::new(test_settings());
        transport.start(&["BN".to_string()], state()).unwrap();
        assert!(matches!(
            transport.send(&Endpoint::new("10.9.9.9"), b"x"),
            Err(Error::UnknownEndpoint(_))
        ));
    }

    #[test]
    fn test_stop_is_idempotent_and_port_is_released() {
        let port = {
            let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let mut settings = test_settings();
        settings.port = port;

        let mut transport = WifiTransport::new(settings);
        for _ in 0..3 {
            transport.start(&["BN".to_string()], state()).unwrap();
            assert!(transport.is_running());
            assert_eq!(transport.local_addr().unwrap().port(), port);
            transport.stop();
            transport.stop();
        }
    }
}
