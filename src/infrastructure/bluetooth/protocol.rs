//! Bodynodes serial packet protocol
//!
//! Nodes on the RFCOMM link stream fixed-size packets behind a two byte sync
//! marker:
//!
//! ```text
//! FF FF | CC | tag | t0 t1 | w (f32 BE) | x (f32 BE) | y (f32 BE) | z (f32 BE)
//!       |<------------------------ 20 bytes ------------------------------>|
//! ```
//!
//! - `CC`: sensor data packet
//! - `tag`: body part, `C1`..`D2`
//! - `t0 t1`: sensor type, `00 00` is an absolute orientation quaternion

use crate::domain::models::{SensorKey, SensorMessage, SENSORTYPE_ORIENTATION_ABS_TAG};
use crate::error::{Error, Result};
use serde_json::{json, Value};
use tracing::trace;

pub const SYNC_BYTE: u8 = 0xFF;
pub const PACKET_LEN: usize = 20;
pub const PACKET_KIND_SENSOR: u8 = 0xCC;
pub const SENSORTYPE_ORIENTATION_CODE: [u8; 2] = [0x00, 0x00];

pub type Packet = [u8; PACKET_LEN];

/// Body part names indexed by their wire tag
const BODYPART_TAGS: &[(u8, &str)] = &[
    (0xC1, "head"),
    (0xC2, "hand_left"),
    (0xC3, "forearm_left"),
    (0xC4, "upperarm_left"),
    (0xC5, "body"),
    (0xC6, "forearm_right"),
    (0xC7, "upperarm_right"),
    (0xC8, "hand_right"),
    (0xC9, "lowerleg_left"),
    (0xCA, "upperleg_left"),
    (0xCB, "foot_left"),
    (0xCC, "lowerleg_right"),
    (0xCD, "upperleg_right"),
    (0xCE, "foot_right"),
    (0xCF, "untagged"),
    (0xD0, "katana"),
    (0xD1, "upperbody"),
    (0xD2, "lowerbody"),
];

pub fn bodypart_for_tag(tag: u8) -> Option<&'static str> {
    BODYPART_TAGS
        .iter()
        .find(|(t, _)| *t == tag)
        .map(|(_, name)| *name)
}

pub fn tag_for_bodypart(bodypart: &str) -> Option<u8> {
    BODYPART_TAGS
        .iter()
        .find(|(_, name)| *name == bodypart)
        .map(|(t, _)| *t)
}

/// Sync-marker scanner for one serial stream.
///
/// State survives across reads, so a packet may be split over any number of
/// `feed` calls.
#[derive(Debug)]
pub struct PacketParser {
    parsing: bool,
    previous: u8,
    packet: Packet,
    filled: usize,
}

impl Default for PacketParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketParser {
    pub fn new() -> Self {
        Self {
            parsing: false,
            previous: 0,
            packet: [0; PACKET_LEN],
            filled: 0,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Packet> {
        let mut packets = Vec::new();
        for &byte in bytes {
            if self.parsing {
                self.packet[self.filled] = byte;
                self.filled += 1;
                if self.filled == PACKET_LEN {
                    packets.push(self.packet);
                    self.parsing = false;
                    self.filled = 0;
                }
            } else if byte == SYNC_BYTE && self.previous == SYNC_BYTE {
                self.parsing = true;
                self.filled = 0;
            }
            self.previous = byte;
        }
        packets
    }
}

fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Turn one packet into a sensor message for `player`
pub fn decode_packet(packet: &Packet, player: &str) -> Result<SensorMessage> {
    if packet[0] != PACKET_KIND_SENSOR {
        return Err(Error::Malformed(format!(
            "unknown packet kind {:#04X}",
            packet[0]
        )));
    }

    let bodypart = bodypart_for_tag(packet[1])
        .ok_or_else(|| Error::Malformed(format!("unknown body part tag {:#04X}", packet[1])))?;

    if packet[2..4] != SENSORTYPE_ORIENTATION_CODE {
        return Err(Error::Malformed(format!(
            "unsupported sensor type {:02X}{:02X}",
            packet[2], packet[3]
        )));
    }

    let value: Value = json!([
        read_f32(packet, 4),
        read_f32(packet, 8),
        read_f32(packet, 12),
        read_f32(packet, 16),
    ]);
    trace!("Decoded {} {}: {}", player, bodypart, value);

    Ok(SensorMessage::new(
        SensorKey::new(player, bodypart, SENSORTYPE_ORIENTATION_ABS_TAG),
        value,
    ))
}

/// Build a wire packet; used by tests and node simulators
pub fn encode_orientation(tag: u8, quaternion: [f32; 4]) -> Vec<u8> {
    let mut bytes = vec![SYNC_BYTE, SYNC_BYTE, PACKET_KIND_SENSOR, tag];
    bytes.extend_from_slice(&SENSORTYPE_ORIENTATION_CODE);
    for component in quaternion {
        bytes.extend_from_slice(&component.to_be_bytes());
    }
    bytes
}
