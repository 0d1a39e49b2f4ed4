pub mod ble;
pub mod bluetooth;
pub mod logging;
pub mod transport;
pub mod wifi;
