use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

pub const MESSAGE_PLAYER_TAG: &str = "player";
pub const MESSAGE_BODYPART_TAG: &str = "bodypart";
pub const MESSAGE_SENSORTYPE_TAG: &str = "sensortype";
pub const MESSAGE_VALUE_TAG: &str = "value";

pub const SENSORTYPE_ORIENTATION_ABS_TAG: &str = "orientation_abs";
pub const SENSORTYPE_ACCELERATION_REL_TAG: &str = "acceleration_rel";
pub const SENSORTYPE_ANGULARVELOCITY_REL_TAG: &str = "angularvelocity_rel";
pub const SENSORTYPE_GLOVE_TAG: &str = "glove";
pub const SENSORTYPE_SHOE_TAG: &str = "shoe";

pub const PLAYER_DEFAULT_TAG: &str = "mario";
pub const BODYPART_KATANA_TAG: &str = "katana";
pub const BODYPART_UPPERARM_LEFT_TAG: &str = "upperarm_left";

/// Transport-specific address of one physical connection.
///
/// Two endpoints are equal iff their address strings are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// WiFi nodes are identified by IP only; the source port may change.
    pub fn from_ip(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A wearable sensor unit, identified by player and body part
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BodynodeId {
    pub player: String,
    pub bodypart: String,
}

impl BodynodeId {
    pub fn new(player: impl Into<String>, bodypart: impl Into<String>) -> Self {
        Self {
            player: player.into(),
            bodypart: bodypart.into(),
        }
    }
}

/// The (player, bodypart, sensortype) key of one data stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SensorKey {
    pub player: String,
    pub bodypart: String,
    pub sensortype: String,
}

impl SensorKey {
    pub fn new(
        player: impl Into<String>,
        bodypart: impl Into<String>,
        sensortype: impl Into<String>,
    ) -> Self {
        Self {
            player: player.into(),
            bodypart: bodypart.into(),
            sensortype: sensortype.into(),
        }
    }

    pub fn node(&self) -> BodynodeId {
        BodynodeId::new(self.player.clone(), self.bodypart.clone())
    }
}

/// Latest value stored for a key
#[derive(Debug, Clone)]
pub struct SensorReading {
    pub value: Value,
    pub source: Endpoint,
    pub received_at: Instant,
}

/// One validated sensor message
#[derive(Debug, Clone, PartialEq)]
pub struct SensorMessage {
    pub key: SensorKey,
    pub value: Value,
}

impl SensorMessage {
    pub fn new(key: SensorKey, value: Value) -> Self {
        Self { key, value }
    }

    /// Validate a JSON object shaped `{"player","bodypart","sensortype","value"}`.
    ///
    /// Returns `None` when any of the four fields is missing or the identity
    /// fields are not strings.
    pub fn from_json(message: &Value) -> Option<Self> {
        let player = message.get(MESSAGE_PLAYER_TAG)?.as_str()?;
        let bodypart = message.get(MESSAGE_BODYPART_TAG)?.as_str()?;
        let sensortype = message.get(MESSAGE_SENSORTYPE_TAG)?.as_str()?;
        let value = message.get(MESSAGE_VALUE_TAG)?;
        Some(Self {
            key: SensorKey::new(player, bodypart, sensortype),
            value: value.clone(),
        })
    }

    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert(MESSAGE_PLAYER_TAG.into(), self.key.player.clone().into());
        object.insert(MESSAGE_BODYPART_TAG.into(), self.key.bodypart.clone().into());
        object.insert(MESSAGE_SENSORTYPE_TAG.into(), self.key.sensortype.clone().into());
        object.insert(MESSAGE_VALUE_TAG.into(), self.value.clone());
        Value::Object(object)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    WaitingAck,
    Connected,
    Disconnected,
}
