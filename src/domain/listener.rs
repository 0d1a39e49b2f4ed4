//! Listener capability implemented by the host application

use serde_json::Value;
use tracing::info;

/// Receives sensor messages from a communicator.
///
/// Communicators hold listeners through `Weak` references; the application
/// owns them.
pub trait BodynodeListener: Send + Sync {
    /// Filter called before every dispatch
    fn is_of_interest(&self, player: &str, bodypart: &str, sensortype: &str) -> bool;

    fn on_message_received(&self, player: &str, bodypart: &str, sensortype: &str, value: &Value);
}

/// Listener that logs every message it receives
#[derive(Debug, Default)]
pub struct LoggingListener;

impl BodynodeListener for LoggingListener {
    fn is_of_interest(&self, _player: &str, _bodypart: &str, _sensortype: &str) -> bool {
        true
    }

    fn on_message_received(&self, player: &str, bodypart: &str, sensortype: &str, value: &Value) {
        info!(
            "on_message_received: player={} bodypart={} sensortype={} value={}",
            player, bodypart, sensortype, value
        );
    }
}
