//! Bodynodes host communicator
//!
//! Receives sensor readings from Bodynodes over WiFi (UDP), classic Bluetooth
//! (RFCOMM) or Bluetooth LE, keeps the latest value per
//! (player, bodypart, sensortype), notifies listeners and sends actions back
//! to the nodes.

pub mod communicator;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use communicator::HostCommunicator;
pub use domain::actions::{Action, ActionKind};
pub use domain::listener::BodynodeListener;
pub use error::{Error, Result};
