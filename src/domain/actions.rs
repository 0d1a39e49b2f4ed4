//! Outbound actions sent from the host to a node

use serde::{Deserialize, Serialize};

/// Command addressed to the node currently bound to (player, bodypart)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub player: String,
    pub bodypart: String,
    #[serde(flatten)]
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Haptic {
        duration_ms: u32,
        strength: u32,
    },
    SetPlayer {
        new_player: String,
    },
    SetBodypart {
        new_bodypart: String,
    },
    EnableSensor {
        sensortype: String,
        enable: bool,
    },
    SetWifi {
        ssid: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_ip: Option<String>,
    },
}

impl Action {
    pub fn new(player: impl Into<String>, bodypart: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            player: player.into(),
            bodypart: bodypart.into(),
            kind,
        }
    }

    pub fn haptic(player: &str, bodypart: &str, duration_ms: u32, strength: u32) -> Self {
        Self::new(
            player,
            bodypart,
            ActionKind::Haptic {
                duration_ms,
                strength,
            },
        )
    }

    pub fn set_player(player: &str, bodypart: &str, new_player: &str) -> Self {
        Self::new(
            player,
            bodypart,
            ActionKind::SetPlayer {
                new_player: new_player.to_string(),
            },
        )
    }

    pub fn set_bodypart(player: &str, bodypart: &str, new_bodypart: &str) -> Self {
        Self::new(
            player,
            bodypart,
            ActionKind::SetBodypart {
                new_bodypart: new_bodypart.to_string(),
            },
        )
    }

    pub fn enable_sensor(player: &str, bodypart: &str, sensortype: &str, enable: bool) -> Self {
        Self::new(
            player,
            bodypart,
            ActionKind::EnableSensor {
                sensortype: sensortype.to_string(),
                enable,
            },
        )
    }

    pub fn set_wifi(
        player: &str,
        bodypart: &str,
        ssid: &str,
        password: &str,
        server_ip: Option<&str>,
    ) -> Self {
        Self::new(
            player,
            bodypart,
            ActionKind::SetWifi {
                ssid: ssid.to_string(),
                password: password.to_string(),
                server_ip: server_ip.map(str::to_string),
            },
        )
    }

    /// Wire form: one JSON object
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn wire(action: &Action) -> Value {
        serde_json::from_slice(&action.to_bytes().unwrap()).unwrap()
    }

    #[test]
    fn test_haptic_wire_format() {
        assert_eq!(
            wire(&Action::haptic("mario", "katana", 250, 200)),
            json!({
                "type": "haptic",
                "player": "mario",
                "bodypart": "katana",
                "duration_ms": 250,
                "strength": 200
            })
        );
    }

    #[test]
    fn test_identity_actions_wire_format() {
        assert_eq!(
            wire(&Action::set_player("mario", "katana", "luigi")),
            json!({"type": "set_player", "player": "mario", "bodypart": "katana", "new_player": "luigi"})
        );
        assert_eq!(
            wire(&Action::set_bodypart("mario", "katana", "upperarm_left")),
            json!({"type": "set_bodypart", "player": "mario", "bodypart": "katana", "new_bodypart": "upperarm_left"})
        );
    }

    #[test]
    fn test_enable_sensor_and_wifi_wire_format() {
        assert_eq!(
            wire(&Action::enable_sensor("mario", "katana", "orientation_abs", false)),
            json!({
                "type": "enable_sensor",
                "player": "mario",
                "bodypart": "katana",
                "sensortype": "orientation_abs",
                "enable": false
            })
        );

        let without_ip = wire(&Action::set_wifi("mario", "katana", "upperbody", "bodynodes1", None));
        assert_eq!(without_ip["type"], "set_wifi");
        assert!(without_ip.get("server_ip").is_none());

        let with_ip = wire(&Action::set_wifi(
            "mario",
            "katana",
            "upperbody",
            "bodynodes1",
            Some("192.168.137.1"),
        ));
        assert_eq!(with_ip["server_ip"], "192.168.137.1");
        assert_eq!(with_ip["ssid"], "upperbody");
    }
}
