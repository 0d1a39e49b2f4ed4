use crate::domain::frames::{FrameRecovery, DEFAULT_MAX_PENDING_BYTES};
use crate::domain::handshake::DEFAULT_KEEP_ALIVE_MS;
use crate::domain::models::PLAYER_DEFAULT_TAG;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_true(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "bodynodes_host".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

fn default_keep_alive_ms() -> u64 {
    DEFAULT_KEEP_ALIVE_MS
}
fn default_max_pending_bytes() -> usize {
    DEFAULT_MAX_PENDING_BYTES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiSettings {
    #[serde(default = "default_wifi_bind_address")]
    pub bind_address: Ipv4Addr,
    #[serde(default = "default_wifi_port")]
    pub port: u16,
    /// Fixed destination port for replies and actions; the datagram's source
    /// port is used when unset.
    #[serde(default)]
    pub node_port: Option<u16>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    #[serde(default)]
    pub frame_recovery: FrameRecovery,
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
    #[serde(default)]
    pub multicast: MulticastSettings,
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            bind_address: default_wifi_bind_address(),
            port: default_wifi_port(),
            node_port: None,
            buffer_size: default_buffer_size(),
            poll_interval_ms: default_poll_interval_ms(),
            keep_alive_ms: default_keep_alive_ms(),
            frame_recovery: FrameRecovery::Drop,
            max_pending_bytes: default_max_pending_bytes(),
            multicast: MulticastSettings::default(),
        }
    }
}

impl WifiSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

fn default_wifi_bind_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_wifi_port() -> u16 {
    12345
}
fn default_buffer_size() -> usize {
    1024
}
fn default_poll_interval_ms() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_multicast_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_multicast_port")]
    pub port: u16,
    #[serde(default = "default_multicast_ttl")]
    pub ttl: u32,
    #[serde(default = "default_multicast_interval_ms")]
    pub interval_ms: u64,
    /// Local interfaces the group is joined on; empty means every local IPv4 address
    #[serde(default = "default_multicast_interfaces")]
    pub interfaces: Vec<Ipv4Addr>,
}

impl Default for MulticastSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            group: default_multicast_group(),
            port: default_multicast_port(),
            ttl: default_multicast_ttl(),
            interval_ms: default_multicast_interval_ms(),
            interfaces: default_multicast_interfaces(),
        }
    }
}

impl MulticastSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 192, 1, 99)
}
fn default_multicast_port() -> u16 {
    12346
}
fn default_multicast_ttl() -> u32 {
    2
}
fn default_multicast_interval_ms() -> u64 {
    5000
}
fn default_multicast_interfaces() -> Vec<Ipv4Addr> {
    Vec::new()
}

/// Payload encoding on the RFCOMM serial link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// `0xFF 0xFF` synchronised 20-byte packets
    #[default]
    Binary,
    /// JSON messages with `ACKN` keep-alives
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothSettings {
    #[serde(default)]
    pub wire_format: WireFormat,
    #[serde(default = "default_player")]
    pub default_player: String,
    #[serde(default = "default_serial_service_uuid16")]
    pub service_uuid16: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_bt_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    #[serde(default = "default_bt_frame_recovery")]
    pub frame_recovery: FrameRecovery,
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
}

impl Default for BluetoothSettings {
    fn default() -> Self {
        Self {
            wire_format: WireFormat::Binary,
            default_player: default_player(),
            service_uuid16: default_serial_service_uuid16(),
            buffer_size: default_buffer_size(),
            poll_interval_ms: default_bt_poll_interval_ms(),
            keep_alive_ms: default_keep_alive_ms(),
            frame_recovery: default_bt_frame_recovery(),
            max_pending_bytes: default_max_pending_bytes(),
        }
    }
}

impl BluetoothSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

fn default_player() -> String {
    PLAYER_DEFAULT_TAG.to_string()
}
fn default_serial_service_uuid16() -> String {
    "0x1101".to_string()
}
fn default_bt_poll_interval_ms() -> u64 {
    5
}
fn default_bt_frame_recovery() -> FrameRecovery {
    FrameRecovery::Retain
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_notification_timeout_ms")]
    pub notification_timeout_ms: u64,
    /// Silence after which a node is reported disconnected
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    #[serde(default = "default_ble_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_player_char_uuid")]
    pub player_char_uuid: String,
    #[serde(default = "default_bodypart_char_uuid")]
    pub bodypart_char_uuid: String,
    #[serde(default = "default_orientation_char_uuid")]
    pub orientation_abs_char_uuid: String,
    #[serde(default = "default_acceleration_char_uuid")]
    pub acceleration_rel_char_uuid: String,
    #[serde(default = "default_angularvelocity_char_uuid")]
    pub angularvelocity_rel_char_uuid: String,
    #[serde(default = "default_glove_char_uuid")]
    pub glove_char_uuid: String,
    #[serde(default = "default_shoe_char_uuid")]
    pub shoe_char_uuid: String,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            scan_timeout_ms: default_scan_timeout_ms(),
            notification_timeout_ms: default_notification_timeout_ms(),
            keep_alive_ms: default_keep_alive_ms(),
            service_uuid: default_ble_service_uuid(),
            player_char_uuid: default_player_char_uuid(),
            bodypart_char_uuid: default_bodypart_char_uuid(),
            orientation_abs_char_uuid: default_orientation_char_uuid(),
            acceleration_rel_char_uuid: default_acceleration_char_uuid(),
            angularvelocity_rel_char_uuid: default_angularvelocity_char_uuid(),
            glove_char_uuid: default_glove_char_uuid(),
            shoe_char_uuid: default_shoe_char_uuid(),
        }
    }
}

impl BleSettings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

fn default_scan_timeout_ms() -> u64 {
    5000
}
fn default_notification_timeout_ms() -> u64 {
    5
}
fn default_ble_service_uuid() -> String {
    "0000cca0-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_player_char_uuid() -> String {
    "0000cca1-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_bodypart_char_uuid() -> String {
    "0000cca2-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_orientation_char_uuid() -> String {
    "0000cca3-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_acceleration_char_uuid() -> String {
    "0000cca4-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_angularvelocity_char_uuid() -> String {
    "0000cca5-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_glove_char_uuid() -> String {
    "0000cca6-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_shoe_char_uuid() -> String {
    "0000cca7-0000-1000-8000-00805f9b34fb".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub wifi: WifiSettings,
    #[serde(default)]
    pub bluetooth: BluetoothSettings,
    #[serde(default)]
    pub ble: BleSettings,
}

pub struct SettingsService {
    settings: HostSettings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file; a missing or invalid file gives defaults
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("Bodynodes");
        fs::create_dir_all(&path)?;
        path.push("host_settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<HostSettings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &HostSettings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut HostSettings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_gives_defaults() {
        let settings: HostSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.wifi.port, 12345);
        assert_eq!(settings.wifi.node_port, None);
        assert_eq!(settings.wifi.frame_recovery, FrameRecovery::Drop);
        assert_eq!(settings.wifi.multicast.group, Ipv4Addr::new(239, 192, 1, 99));
        assert_eq!(settings.wifi.multicast.port, 12346);
        assert_eq!(settings.wifi.multicast.ttl, 2);
        assert!(settings.wifi.multicast.interfaces.is_empty());
        assert_eq!(settings.wifi.keep_alive(), Duration::from_secs(60));
        assert_eq!(settings.bluetooth.wire_format, WireFormat::Binary);
        assert_eq!(settings.bluetooth.default_player, "mario");
        assert_eq!(settings.bluetooth.frame_recovery, FrameRecovery::Retain);
        assert_eq!(settings.ble.notification_timeout(), Duration::from_millis(5));
        assert_eq!(settings.ble.keep_alive(), Duration::from_secs(60));
        assert_eq!(settings.log_settings.file_name_prefix, "bodynodes_host");
    }

    #[test]
    fn test_partial_json_overrides() {
        let settings: HostSettings = serde_json::from_str(
            r#"{"wifi": {"port": 2000, "node_port": 12345, "frame_recovery": "retain"},
                "bluetooth": {"wire_format": "json"}}"#,
        )
        .unwrap();
        assert_eq!(settings.wifi.port, 2000);
        assert_eq!(settings.wifi.node_port, Some(12345));
        assert_eq!(settings.wifi.frame_recovery, FrameRecovery::Retain);
        assert_eq!(settings.wifi.buffer_size, 1024);
        assert_eq!(settings.bluetooth.wire_format, WireFormat::Json);
    }

    #[test]
    fn test_missing_file_gives_defaults_and_save_round_trips() {
        let path = std::env::temp_dir().join(format!(
            "bodynodes_host_settings_{}.json",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);

        let mut service = SettingsService::from_path(path.clone());
        assert_eq!(service.get().wifi.port, 12345);

        service.get_mut().wifi.port = 4242;
        service.save().unwrap();

        let reloaded = SettingsService::from_path(path.clone());
        assert_eq!(reloaded.get().wifi.port, 4242);
        fs::remove_file(&path).unwrap();
    }
}
