//! Discovery beacon sent to the Bodynodes multicast group

use crate::domain::settings::MulticastSettings;
use crate::error::Result;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Periodically sends the identifier token so nodes can find the host.
///
/// Send-only: nothing is ever read from the socket.
pub struct MulticastAnnouncer {
    target: SocketAddrV4,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl MulticastAnnouncer {
    pub fn start(token: &str, settings: &MulticastSettings) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_multicast_ttl_v4(settings.ttl)?;

        if settings.group.is_multicast() {
            for interface in &join_interfaces(&settings.interfaces) {
                match socket.join_multicast_v4(&settings.group, interface) {
                    Ok(()) => debug!("Joined {} on {}", settings.group, interface),
                    Err(e) => warn!(
                        "Cannot join multicast group {} on {}: {}",
                        settings.group, interface, e
                    ),
                }
            }
        }

        let target = SocketAddrV4::new(settings.group, settings.port);
        let running = Arc::new(AtomicBool::new(true));
        let interval = settings.interval();
        let payload = token.as_bytes().to_vec();

        let flag = running.clone();
        let worker = thread::Builder::new()
            .name("bodynodes-multicast".to_string())
            .spawn(move || {
                info!("Multicast announcer started on {}", target);
                while flag.load(Ordering::SeqCst) {
                    if let Err(e) = socket.send_to(&payload, target) {
                        debug!("Multicast send to {} failed: {}", target, e);
                    }

                    let next = Instant::now() + interval;
                    while flag.load(Ordering::SeqCst) && Instant::now() < next {
                        thread::sleep(STOP_CHECK_INTERVAL);
                    }
                }
                info!("Multicast announcer stopped");
            })?;

        Ok(Self {
            target,
            running,
            worker: Some(worker),
        })
    }

    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Multicast announcer thread panicked");
            }
        }
    }
}

impl Drop for MulticastAnnouncer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Configured interfaces, or every local IPv4 address when none are set
fn join_interfaces(configured: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    if !configured.is_empty() {
        return configured.to_vec();
    }
    let local = interfaces::local_ipv4();
    if local.is_empty() {
        vec![Ipv4Addr::UNSPECIFIED]
    } else {
        local
    }
}

#[cfg(target_os = "linux")]
mod interfaces {
    use std::net::Ipv4Addr;
    use tracing::warn;

    /// Non-loopback IPv4 addresses of the local interfaces
    pub fn local_ipv4() -> Vec<Ipv4Addr> {
        let mut found = Vec::new();
        let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
        unsafe {
            if libc::getifaddrs(&mut head) != 0 {
                warn!(
                    "Cannot list network interfaces: {}",
                    std::io::Error::last_os_error()
                );
                return found;
            }

            let mut cursor = head;
            while !cursor.is_null() {
                let entry = &*cursor;
                if !entry.ifa_addr.is_null()
                    && libc::c_int::from((*entry.ifa_addr).sa_family) == libc::AF_INET
                {
                    let address = &*(entry.ifa_addr as *const libc::sockaddr_in);
                    let ip = Ipv4Addr::from(u32::from_be(address.sin_addr.s_addr));
                    if !ip.is_loopback() && !found.contains(&ip) {
                        found.push(ip);
                    }
                }
                cursor = entry.ifa_next;
            }
            libc::freeifaddrs(head);
        }
        found
    }
}

#[cfg(not(target_os = "linux"))]
mod interfaces {
    use std::net::Ipv4Addr;

    pub fn local_ipv4() -> Vec<Ipv4Addr> {
        Vec::new()
    }
}
