//! btleplug-backed GATT sessions

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::gatt::{
    is_bootboots_name, COMMAND_CHAR_UUID, LOGS_CHAR_UUID, SERVICE_UUIDS, STATUS_CHAR_UUID,
};
use crate::ble::link::{GattConnector, GattEvent, GattLink, GattSession, WriteMode};
use crate::errors::LinkError;
use crate::models::Device;

/// Adapter-level options
#[derive(Debug, Clone)]
pub struct BtleplugOptions {
    /// How long to scan for a peripheral that is not yet known
    pub scan_timeout: Duration,

    /// Interval between peripheral list polls while scanning
    pub scan_poll_interval: Duration,

    /// Bound on connect plus service discovery
    pub connect_timeout: Duration,

    /// Interval of the connection watchdog
    pub watchdog_interval: Duration,

    /// Buffered events per session
    pub event_buffer: usize,
}

impl Default for BtleplugOptions {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(10),
            scan_poll_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(15),
            watchdog_interval: Duration::from_secs(2),
            event_buffer: 64,
        }
    }
}

/// Connector using the first Bluetooth adapter of the host
pub struct BtleplugConnector {
    options: BtleplugOptions,
    adapter: tokio::sync::Mutex<Option<(Manager, Adapter)>>,
}

impl BtleplugConnector {
    pub fn new(options: BtleplugOptions) -> Self {
        Self {
            options,
            adapter: tokio::sync::Mutex::new(None),
        }
    }

    /// Initialise the manager and adapter on first use
    async fn adapter(&self) -> Result<Adapter, LinkError> {
        let mut slot = self.adapter.lock().await;
        if let Some((_, adapter)) = slot.as_ref() {
            return Ok(adapter.clone());
        }

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::BluetoothError("No Bluetooth adapter found".to_string()))?;
        debug!("Bluetooth adapter ready");

        *slot = Some((manager, adapter.clone()));
        Ok(adapter)
    }

    /// Find the peripheral for `device`, scanning if it is not known yet
    async fn find_peripheral(&self, adapter: &Adapter, device: &Device) -> Result<Peripheral, LinkError> {
        if let Some(peripheral) = match_peripheral(adapter, device).await? {
            return Ok(peripheral);
        }

        info!("Scanning for {} ({:?})", device.name, self.options.scan_timeout);
        adapter.start_scan(ScanFilter::default()).await?;

        let deadline = tokio::time::Instant::now() + self.options.scan_timeout;
        let found = loop {
            tokio::time::sleep(self.options.scan_poll_interval).await;
            if let Some(peripheral) = match_peripheral(adapter, device).await? {
                break Some(peripheral);
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
        };

        if let Err(e) = adapter.stop_scan().await {
            debug!("Failed to stop scan: {}", e);
        }
        found.ok_or_else(|| LinkError::NotFound(format!("Bluetooth device {}", device.name)))
    }

    async fn establish(&self, peripheral: &Peripheral) -> Result<HashMap<Uuid, Characteristic>, LinkError> {
        peripheral
            .connect()
            .await
            .map_err(|e| LinkError::ConnectionError(format!("GATT connect failed: {}", e)))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| LinkError::ConnectionError(format!("Service discovery failed: {}", e)))?;

        let services = peripheral.services();
        let service = SERVICE_UUIDS
            .iter()
            .find_map(|uuid| services.iter().find(|s| s.uuid == *uuid))
            .ok_or_else(|| LinkError::ConnectionError("Device does not expose the BootBoots service".to_string()))?;
        debug!("Resolved primary service {}", service.uuid);

        let characteristics: HashMap<Uuid, Characteristic> = service
            .characteristics
            .iter()
            .filter(|c| [STATUS_CHAR_UUID, LOGS_CHAR_UUID, COMMAND_CHAR_UUID].contains(&c.uuid))
            .map(|c| (c.uuid, c.clone()))
            .collect();

        let command = characteristics
            .get(&COMMAND_CHAR_UUID)
            .ok_or_else(|| LinkError::ConnectionError("Command characteristic not found".to_string()))?;
        if !characteristics.contains_key(&LOGS_CHAR_UUID) {
            debug!("Logs characteristic not present");
        }

        let notify = CharPropFlags::NOTIFY | CharPropFlags::INDICATE;
        match characteristics.get(&STATUS_CHAR_UUID) {
            Some(status) if status.properties.intersects(notify) => peripheral.subscribe(status).await?,
            Some(_) => debug!("Status characteristic does not notify"),
            None => warn!("Status characteristic not found"),
        }
        if !command.properties.intersects(notify) {
            return Err(LinkError::ConnectionError(
                "Command characteristic does not support notifications".to_string(),
            ));
        }
        peripheral.subscribe(command).await?;

        Ok(characteristics)
    }
}

impl Default for BtleplugConnector {
    fn default() -> Self {
        Self::new(BtleplugOptions::default())
    }
}

/// Peripheral whose id or advertised name matches `device`
async fn match_peripheral(adapter: &Adapter, device: &Device) -> Result<Option<Peripheral>, LinkError> {
    for peripheral in adapter.peripherals().await? {
        if peripheral.id().to_string() == device.id {
            return Ok(Some(peripheral));
        }
        let name = match peripheral.properties().await.ok().flatten().and_then(|p| p.local_name) {
            Some(name) => name,
            None => continue,
        };
        if is_bootboots_name(&name) && (name == device.name || name == device.id) {
            return Ok(Some(peripheral));
        }
    }
    Ok(None)
}

#[async_trait]
impl GattConnector for BtleplugConnector {
    async fn open(&self, device: &Device) -> Result<GattSession, LinkError> {
        let adapter = self.adapter().await?;
        let peripheral = self.find_peripheral(&adapter, device).await?;
        info!("Connecting to {} ({})", device.name, peripheral.id());

        let characteristics = match tokio::time::timeout(self.options.connect_timeout, self.establish(&peripheral)).await {
            Ok(Ok(characteristics)) => characteristics,
            Ok(Err(e)) => {
                let _ = peripheral.disconnect().await;
                return Err(e);
            }
            Err(_) => {
                let _ = peripheral.disconnect().await;
                return Err(LinkError::ConnectionError(format!(
                    "Timed out connecting to {}",
                    device.name
                )));
            }
        };

        let mut notifications = peripheral.notifications().await?;
        let (tx, rx) = mpsc::channel(self.options.event_buffer);

        // Notifications from every subscribed characteristic share one stream
        let forward_tx = tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let event = GattEvent::Notification {
                    characteristic: notification.uuid,
                    value: notification.value,
                };
                if forward_tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = forward_tx.send(GattEvent::Disconnected).await;
        });

        let watched = peripheral.clone();
        let interval = self.options.watchdog_interval;
        let watchdog = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if tx.is_closed() {
                    return;
                }
                if !watched.is_connected().await.unwrap_or(false) {
                    warn!("Peripheral {} disconnected unexpectedly", watched.id());
                    let _ = tx.send(GattEvent::Disconnected).await;
                    return;
                }
            }
        });

        let link = BtleplugLink {
            peripheral,
            characteristics,
            tasks: Mutex::new(vec![forwarder, watchdog]),
        };
        Ok(GattSession {
            link: Arc::new(link),
            events: rx,
        })
    }
}

/// Connected btleplug peripheral
pub struct BtleplugLink {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugLink {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, LinkError> {
        self.characteristics
            .get(&uuid)
            .ok_or_else(|| LinkError::NotFound(format!("Characteristic {}", uuid)))
    }

    fn stop_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    async fn write(&self, characteristic: Uuid, data: &[u8], mode: WriteMode) -> Result<(), LinkError> {
        let characteristic = self.characteristic(characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        self.peripheral.write(characteristic, data, write_type).await?;
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, LinkError> {
        let characteristic = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(characteristic).await?)
    }

    fn supports_write_without_response(&self, characteristic: Uuid) -> bool {
        self.characteristics
            .get(&characteristic)
            .map(|c| c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE))
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.stop_tasks();
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}
