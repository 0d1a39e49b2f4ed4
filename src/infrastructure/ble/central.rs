//! BLE capability consumed by the transport
//!
//! Futures are not `Send`: the transport drives them on a single-threaded
//! runtime inside a `LocalSet`.

#![allow(async_fn_in_trait)]

use crate::error::Result;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Local adapter able to scan for peripherals
pub trait BleCentral {
    type Peripheral: BlePeripheral + 'static;

    /// Scan for `timeout` and return the peripherals advertising one of `names`
    async fn discover(&self, names: &[String], timeout: Duration) -> Result<Vec<Self::Peripheral>>;
}

/// One remote node. UUIDs are lowercase hyphenated strings.
pub trait BlePeripheral {
    /// Advertised local name
    fn name(&self) -> String;

    fn address(&self) -> String;

    async fn connect(&self) -> Result<()>;

    /// UUIDs of the characteristics of `service`
    async fn characteristics(&self, service: &str) -> Result<Vec<String>>;

    async fn read(&self, service: &str, characteristic: &str) -> Result<Vec<u8>>;

    /// Enable notifications; every notification payload is sent to the
    /// returned channel
    async fn subscribe(&self, service: &str, characteristic: &str)
        -> Result<UnboundedReceiver<Vec<u8>>>;

    async fn unsubscribe(&self, service: &str, characteristic: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}
