//! Transport adapter contract

use crate::domain::host::HostState;
use crate::domain::models::Endpoint;
use crate::error::Result;
use std::net::SocketAddr;
use std::sync::Arc;

/// One physical transport (WiFi, classic Bluetooth or BLE).
///
/// `start` returns once the background receive loop is running; received
/// bytes flow into the shared [`HostState`]. `stop` is idempotent and joins
/// every thread it started before returning.
pub trait Transport: Send {
    fn name(&self) -> &'static str;

    fn start(&mut self, identifiers: &[String], state: Arc<HostState>) -> Result<()>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;

    fn send(&self, endpoint: &Endpoint, bytes: &[u8]) -> Result<()>;

    /// Locally bound socket address, when the transport has one
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
