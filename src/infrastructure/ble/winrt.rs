//! WinRT backend for the BLE capability
//!
//! Scanning uses an advertisement watcher; GATT access goes through
//! `BluetoothLEDevice`. Notifications are forwarded from the WinRT event
//! thread into a tokio channel.

use crate::error::{Error, Result};
use crate::infrastructure::ble::central::{BleCentral, BlePeripheral};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::BluetoothLEDevice;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattValueChangedEventArgs,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, IBuffer};

fn gatt(e: windows::core::Error) -> Error {
    Error::Gatt(e.to_string())
}

/// Parse a hyphenated UUID string into a WinRT GUID
pub fn parse_uuid(uuid_str: &str) -> Result<GUID> {
    let uuid_str = uuid_str.replace('-', "");
    let invalid = || Error::Gatt(format!("Invalid UUID format: {}", uuid_str));

    if uuid_str.len() != 32 {
        return Err(invalid());
    }

    let d1 = u32::from_str_radix(&uuid_str[0..8], 16).map_err(|_| invalid())?;
    let d2 = u16::from_str_radix(&uuid_str[8..12], 16).map_err(|_| invalid())?;
    let d3 = u16::from_str_radix(&uuid_str[12..16], 16).map_err(|_| invalid())?;

    let mut d4 = [0u8; 8];
    for (i, byte) in d4.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&uuid_str[16 + i * 2..18 + i * 2], 16).map_err(|_| invalid())?;
    }

    Ok(GUID {
        data1: d1,
        data2: d2,
        data3: d3,
        data4: d4,
    })
}

pub fn format_uuid(guid: &GUID) -> String {
    let d = guid.data4;
    format!(
        "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        guid.data1, guid.data2, guid.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
    )
}

fn format_address(address: u64) -> String {
    let bytes = address.to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

/// The local Bluetooth adapter
#[derive(Debug, Default)]
pub struct WinRtCentral;

impl BleCentral for WinRtCentral {
    type Peripheral = WinRtPeripheral;

    async fn discover(&self, names: &[String], timeout: Duration) -> Result<Vec<WinRtPeripheral>> {
        info!("Starting BLE scan for {:?}", names);
        let found: Arc<Mutex<HashMap<u64, String>>> = Arc::new(Mutex::new(HashMap::new()));

        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(gatt)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(gatt)?;

        let wanted = names.to_vec();
        let sink = found.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    if wanted.contains(&name) {
                        let address = args.BluetoothAddress()?;
                        sink.lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(address, name);
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler).map_err(gatt)?;
        watcher.Start().map_err(gatt)?;
        tokio::time::sleep(timeout).await;
        watcher.Stop().map_err(gatt)?;

        let found = found.lock().unwrap_or_else(PoisonError::into_inner);
        info!("Scan found {} node(s)", found.len());
        Ok(found
            .iter()
            .map(|(address, name)| WinRtPeripheral::new(name.clone(), *address))
            .collect())
    }
}

pub struct WinRtPeripheral {
    name: String,
    address: u64,
    device: RefCell<Option<BluetoothLEDevice>>,
    characteristics: RefCell<HashMap<String, GattCharacteristic>>,
    subscriptions: RefCell<HashMap<String, i64>>,
}

impl WinRtPeripheral {
    fn new(name: String, address: u64) -> Self {
        Self {
            name,
            address,
            device: RefCell::new(None),
            characteristics: RefCell::new(HashMap::new()),
            subscriptions: RefCell::new(HashMap::new()),
        }
    }

    fn characteristic(&self, uuid: &str) -> Result<GattCharacteristic> {
        self.characteristics
            .borrow()
            .get(&uuid.to_lowercase())
            .cloned()
            .ok_or_else(|| Error::Gatt(format!("Characteristic {} not found", uuid)))
    }

    fn device(&self) -> Result<BluetoothLEDevice> {
        self.device
            .borrow()
            .clone()
            .ok_or_else(|| Error::Gatt(format!("{} is not connected", self.name)))
    }
}

impl BlePeripheral for WinRtPeripheral {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn address(&self) -> String {
        format_address(self.address)
    }

    async fn connect(&self) -> Result<()> {
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(self.address)
            .map_err(gatt)?
            .await
            .map_err(gatt)?;
        info!("Device connected: {}", self.name);
        *self.device.borrow_mut() = Some(device);
        Ok(())
    }

    async fn characteristics(&self, service: &str) -> Result<Vec<String>> {
        let device = self.device()?;
        let services_result = device
            .GetGattServicesForUuidAsync(parse_uuid(service)?)
            .map_err(gatt)?
            .await
            .map_err(gatt)?;
        if services_result.Status().map_err(gatt)? != GattCommunicationStatus::Success {
            return Err(Error::Gatt("Failed to get GATT services".to_string()));
        }

        let services = services_result.Services().map_err(gatt)?;
        if services.Size().map_err(gatt)? == 0 {
            return Err(Error::Gatt(format!("Service {} not found", service)));
        }
        let service = services.GetAt(0).map_err(gatt)?;

        let chars_result = service
            .GetCharacteristicsAsync()
            .map_err(gatt)?
            .await
            .map_err(gatt)?;
        if chars_result.Status().map_err(gatt)? != GattCommunicationStatus::Success {
            return Err(Error::Gatt("Failed to get characteristics".to_string()));
        }

        let characteristics = chars_result.Characteristics().map_err(gatt)?;
        let mut cache = self.characteristics.borrow_mut();
        for i in 0..characteristics.Size().map_err(gatt)? {
            let c = characteristics.GetAt(i).map_err(gatt)?;
            let uuid = format_uuid(&c.Uuid().map_err(gatt)?);
            cache.insert(uuid, c);
        }
        debug!("Found {} characteristics on {}", cache.len(), self.name);
        Ok(cache.keys().cloned().collect())
    }

    async fn read(&self, _service: &str, characteristic: &str) -> Result<Vec<u8>> {
        let c = self.characteristic(characteristic)?;
        let result = c
            .ReadValueAsync()
            .map_err(gatt)?
            .await
            .map_err(gatt)?;
        if result.Status().map_err(gatt)? != GattCommunicationStatus::Success {
            return Err(Error::Gatt(format!("Read of {} failed", characteristic)));
        }
        read_buffer(&result.Value().map_err(gatt)?).map_err(gatt)
    }

    async fn subscribe(
        &self,
        _service: &str,
        characteristic: &str,
    ) -> Result<UnboundedReceiver<Vec<u8>>> {
        let c = self.characteristic(characteristic)?;
        let (sender, receiver) = unbounded_channel();

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let bytes = read_buffer(&args.CharacteristicValue()?)?;
                    let _ = sender.send(bytes);
                }
                Ok(())
            },
        );
        let token = c.ValueChanged(&handler).map_err(gatt)?;

        let status = c
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )
            .map_err(gatt)?
            .await
            .map_err(gatt)?;
        if status != GattCommunicationStatus::Success {
            let _ = c.RemoveValueChanged(token);
            return Err(Error::Gatt(format!(
                "Notification subscription returned status: {:?}",
                status
            )));
        }

        self.subscriptions
            .borrow_mut()
            .insert(characteristic.to_lowercase(), token);
        Ok(receiver)
    }

    async fn unsubscribe(&self, _service: &str, characteristic: &str) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        let token = self
            .subscriptions
            .borrow_mut()
            .remove(&characteristic.to_lowercase());
        if let Some(token) = token {
            c.RemoveValueChanged(token).map_err(gatt)?;
        }
        let status = c
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::None,
            )
            .map_err(gatt)?
            .await
            .map_err(gatt)?;
        if status != GattCommunicationStatus::Success {
            warn!("Disabling notifications of {} returned {:?}", characteristic, status);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.characteristics.borrow_mut().clear();
        if let Some(device) = self.device.borrow_mut().take() {
            device.Close().map_err(gatt)?;
            info!("Disconnected from {}", self.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_round_trip() {
        let uuid = "0000cca0-0000-1000-8000-00805f9b34fb";
        let guid = parse_uuid(uuid).unwrap();
        assert_eq!(guid.data1, 0x0000cca0);
        assert_eq!(format_uuid(&guid), uuid);
        assert!(parse_uuid("1234").is_err());
    }

    #[test]
    fn test_format_address() {
        assert_eq!(format_address(0x24952F6468A6), "24:95:2F:64:68:A6");
    }
}
