//! RFCOMM channel lookup and socket setup

use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::process::Command;
use tracing::{debug, info};

const RECORD_SEPARATOR: &str = "Attribute Identifier : 0x0 - ServiceRecordHandle";
const CHANNEL_MARKER: &str = "Channel/Port (Integer) : ";

/// Byte stream to one paired node
pub trait RfcommLink: Read + Write + Send {}

impl<T: Read + Write + Send> RfcommLink for T {}

/// Opens non-blocking serial links to paired devices
pub trait RfcommConnector: Send + Sync {
    fn connect(&self, address: &str) -> Result<Box<dyn RfcommLink>>;
}

/// Pick the RFCOMM channel out of `sdptool browse --tree` output.
///
/// Among the service records mentioning `uuid16`, the channel of the last
/// one wins.
pub fn parse_sdp_channel(output: &str, uuid16: &str) -> Option<u8> {
    output
        .split(RECORD_SEPARATOR)
        .filter(|record| record.contains(uuid16))
        .filter_map(|record| {
            let start = record.find(CHANNEL_MARKER)? + CHANNEL_MARKER.len();
            let hex: String = record[start..]
                .trim_start()
                .trim_start_matches("0x")
                .chars()
                .take_while(char::is_ascii_hexdigit)
                .collect();
            u8::from_str_radix(&hex, 16).ok()
        })
        .last()
}

/// Run `sdptool` against a paired device and resolve its serial channel
pub fn find_rfcomm_channel(address: &str, uuid16: &str) -> Result<u8> {
    let output = Command::new("sdptool")
        .args(["browse", "--tree", address])
        .output()?;
    if !output.status.success() {
        return Err(Error::PortResolution(format!(
            "{}: sdptool exited with {}",
            address, output.status
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let channel = parse_sdp_channel(&text, uuid16)
        .ok_or_else(|| Error::PortResolution(address.to_string()))?;
    debug!("{} exposes {} on channel {}", address, uuid16, channel);
    Ok(channel)
}

/// Parse `AA:BB:CC:DD:EE:FF` into the little-endian `bdaddr_t` layout
pub fn parse_bdaddr(address: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = address.split(':').collect();
    if parts.len() != 6 {
        return Err(Error::InvalidIdentifiers(format!(
            "not a Bluetooth address: {}",
            address
        )));
    }
    let mut bdaddr = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        bdaddr[5 - i] = u8::from_str_radix(part, 16).map_err(|_| {
            Error::InvalidIdentifiers(format!("not a Bluetooth address: {}", address))
        })?;
    }
    Ok(bdaddr)
}

/// Connector resolving channels with `sdptool` and opening kernel RFCOMM
/// sockets
#[derive(Debug, Clone)]
pub struct SdpRfcommConnector {
    uuid16: String,
}

impl SdpRfcommConnector {
    pub fn new(uuid16: impl Into<String>) -> Self {
        Self {
            uuid16: uuid16.into(),
        }
    }
}

impl RfcommConnector for SdpRfcommConnector {
    fn connect(&self, address: &str) -> Result<Box<dyn RfcommLink>> {
        let bdaddr = parse_bdaddr(address)?;
        let channel = find_rfcomm_channel(address, &self.uuid16)?;
        info!("Connecting to {} on RFCOMM channel {}", address, channel);
        let stream = socket::connect(bdaddr, channel).map_err(|e| Error::Connect {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(stream))
    }
}

#[cfg(target_os = "linux")]
mod socket {
    use std::fs::File;
    use std::io;
    use std::os::fd::{FromRawFd, OwnedFd};

    const AF_BLUETOOTH: libc::c_int = 31;
    const BTPROTO_RFCOMM: libc::c_int = 3;

    #[repr(C)]
    struct SockaddrRc {
        rc_family: libc::sa_family_t,
        rc_bdaddr: [u8; 6],
        rc_channel: u8,
    }

    /// Blocking connect, then switch the stream to non-blocking mode
    pub fn connect(bdaddr: [u8; 6], channel: u8) -> io::Result<File> {
        unsafe {
            let fd = libc::socket(AF_BLUETOOTH, libc::SOCK_STREAM, BTPROTO_RFCOMM);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let owned = OwnedFd::from_raw_fd(fd);

            let address = SockaddrRc {
                rc_family: AF_BLUETOOTH as libc::sa_family_t,
                rc_bdaddr: bdaddr,
                rc_channel: channel,
            };
            if libc::connect(
                fd,
                &address as *const SockaddrRc as *const libc::sockaddr,
                std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }

            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(File::from(owned))
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod socket {
    use std::fs::File;
    use std::io;

    pub fn connect(_bdaddr: [u8; 6], _channel: u8) -> io::Result<File> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "RFCOMM sockets are only available on Linux",
        ))
    }
}
