use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
        Peripheral as _, PeripheralProperties, ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{BridgeError, Result},
    platform::{
        BlePlatform, CharacteristicInfo, CharacteristicProperties, DiscoveredServices,
        PlatformEvent, EVENT_CHANNEL_CAPACITY,
    },
    types::{AdapterState, AdvertisingData, PeripheralHandle, PermissionStatus},
};

type PeripheralMap = Arc<RwLock<HashMap<String, Peripheral>>>;

/// [`BlePlatform`] on top of `btleplug`, using the first adapter found
pub struct BtleplugPlatform {
    manager: Manager,
    adapter: RwLock<Option<Adapter>>,
    peripherals: PeripheralMap,
    events: broadcast::Sender<PlatformEvent>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
    scan_timer: Mutex<Option<JoinHandle<()>>>,
    notification_pumps: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BtleplugPlatform {
    /// Create the platform manager
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Ble`] if the Bluetooth manager cannot be created.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            manager,
            adapter: RwLock::new(None),
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            events,
            event_pump: Mutex::new(None),
            scan_timer: Mutex::new(None),
            notification_pumps: Mutex::new(HashMap::new()),
        })
    }

    async fn adapter(&self) -> Result<Adapter> {
        self.adapter
            .read()
            .await
            .clone()
            .ok_or(BridgeError::AdapterUnavailable)
    }

    async fn peripheral(&self, id: &str) -> Result<Peripheral> {
        let key = id.to_ascii_uppercase();
        if let Some(peripheral) = self.peripherals.read().await.get(&key) {
            return Ok(peripheral.clone());
        }

        let adapter = self.adapter().await?;
        for peripheral in adapter.peripherals().await? {
            if peripheral.address().to_string().eq_ignore_ascii_case(id) {
                self.peripherals
                    .write()
                    .await
                    .insert(key, peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(BridgeError::DeviceNotFound(id.to_string()))
    }

    async fn characteristic(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(id).await?;
        let found = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| {
                BridgeError::Platform(format!(
                    "Characteristic {characteristic} of service {service} not found on {id}"
                ))
            })?;
        Ok((peripheral, found))
    }

    async fn spawn_notification_pump(&self, id: &str, peripheral: Peripheral) -> Result<()> {
        let mut stream = peripheral.notifications().await?;
        let sender = self.events.clone();
        let peripheral_id = id.to_string();

        let handle = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let service = peripheral
                    .characteristics()
                    .iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| c.service_uuid)
                    .unwrap_or_default();

                // No receivers simply means nobody is listening right now
                let _ = sender.send(PlatformEvent::Notification {
                    peripheral: peripheral_id.clone(),
                    service,
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
            debug!("Notification stream for {} ended", peripheral_id);
        });

        if let Some(previous) = self
            .notification_pumps
            .lock()
            .await
            .insert(id.to_ascii_uppercase(), handle)
        {
            previous.abort();
        }
        Ok(())
    }
}

/// Build a handle from the properties btleplug reports
fn handle_from_properties(properties: &PeripheralProperties) -> PeripheralHandle {
    PeripheralHandle {
        id: properties.address.to_string(),
        name: properties.local_name.clone(),
        rssi: properties.rssi.unwrap_or(0),
        advertising: AdvertisingData {
            local_name: properties.local_name.clone(),
            service_uuids: properties.services.clone(),
            manufacturer_data: properties.manufacturer_data.clone(),
            tx_power_level: properties.tx_power_level,
        },
    }
}

fn characteristic_info(characteristic: &Characteristic) -> CharacteristicInfo {
    let flags = characteristic.properties;
    CharacteristicInfo {
        service: characteristic.service_uuid,
        uuid: characteristic.uuid,
        properties: CharacteristicProperties {
            read: flags.contains(CharPropFlags::READ),
            write: flags.contains(CharPropFlags::WRITE),
            write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            notify: flags.contains(CharPropFlags::NOTIFY),
            indicate: flags.contains(CharPropFlags::INDICATE),
        },
    }
}

fn map_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::On,
        CentralState::PoweredOff => AdapterState::Off,
        _ => AdapterState::Unknown,
    }
}

async fn pump_central_events(
    adapter: Adapter,
    peripherals: PeripheralMap,
    sender: broadcast::Sender<PlatformEvent>,
) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Failed to subscribe to adapter events: {}", e);
            return;
        }
    };

    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };

                let handle = handle_from_properties(&properties);
                peripherals
                    .write()
                    .await
                    .insert(handle.id.to_ascii_uppercase(), peripheral);
                let _ = sender.send(PlatformEvent::Discovered(handle));
            }
            CentralEvent::DeviceDisconnected(id) => {
                if let Ok(peripheral) = adapter.peripheral(&id).await {
                    let address = peripheral.address().to_string();
                    debug!("Peripheral {} disconnected", address);
                    let _ = sender.send(PlatformEvent::Disconnected(address));
                }
            }
            CentralEvent::StateUpdate(state) => {
                let _ = sender.send(PlatformEvent::StateChanged(map_state(state)));
            }
            _ => {}
        }
    }

    debug!("Adapter event stream ended");
}

#[async_trait]
impl BlePlatform for BtleplugPlatform {
    async fn start(&self) -> Result<()> {
        let mut slot = self.adapter.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let adapter = self
            .manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BridgeError::AdapterUnavailable)?;

        info!("Using Bluetooth adapter: {}", adapter.adapter_info().await?);

        let pump = tokio::spawn(pump_central_events(
            adapter.clone(),
            Arc::clone(&self.peripherals),
            self.events.clone(),
        ));
        if let Some(previous) = self.event_pump.lock().await.replace(pump) {
            previous.abort();
        }

        *slot = Some(adapter);
        Ok(())
    }

    async fn adapter_state(&self) -> Result<AdapterState> {
        let adapter = self.adapter().await?;
        Ok(map_state(adapter.adapter_state().await?))
    }

    async fn request_permissions(&self) -> Result<PermissionStatus> {
        // Desktop stacks prompt on first use rather than up front
        Ok(PermissionStatus::Granted)
    }

    async fn enable_radio(&self) -> Result<bool> {
        // btleplug cannot power the radio; report whether it already is
        Ok(self.adapter_state().await? == AdapterState::On)
    }

    fn events(&self) -> broadcast::Receiver<PlatformEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self, duration: Duration) -> Result<()> {
        let adapter = self.adapter().await?;
        adapter.start_scan(ScanFilter::default()).await?;

        let sender = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Err(e) = adapter.stop_scan().await {
                debug!("Stopping scan after timeout failed: {}", e);
            }
            let _ = sender.send(PlatformEvent::ScanStopped);
        });

        if let Some(previous) = self.scan_timer.lock().await.replace(timer) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(timer) = self.scan_timer.lock().await.take() {
            timer.abort();
        }
        let adapter = self.adapter().await?;
        adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        peripheral.connect().await?;
        self.spawn_notification_pump(id, peripheral).await
    }

    async fn disconnect(&self, id: &str) -> Result<()> {
        if let Some(pump) = self
            .notification_pumps
            .lock()
            .await
            .remove(&id.to_ascii_uppercase())
        {
            pump.abort();
        }
        let peripheral = self.peripheral(id).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover_services(&self, id: &str) -> Result<DiscoveredServices> {
        let peripheral = self.peripheral(id).await?;
        peripheral.discover_services().await?;

        let services = peripheral.services().iter().map(|s| s.uuid).collect();
        let characteristics: Vec<CharacteristicInfo> = peripheral
            .characteristics()
            .iter()
            .map(characteristic_info)
            .collect();
        debug!(
            "{} exposes {} characteristic(s)",
            id,
            characteristics.len()
        );
        let handle = match peripheral.properties().await? {
            Some(properties) => handle_from_properties(&properties),
            None => PeripheralHandle::new(id, None, 0),
        };

        Ok(DiscoveredServices {
            peripheral: handle,
            services,
            characteristics,
        })
    }

    async fn connected_peripherals(&self, services: &[Uuid]) -> Result<Vec<PeripheralHandle>> {
        let known: Vec<Peripheral> = self.peripherals.read().await.values().cloned().collect();
        let mut connected = Vec::new();

        for peripheral in known {
            if !peripheral.is_connected().await.unwrap_or(false) {
                continue;
            }
            if !services.is_empty()
                && !peripheral
                    .services()
                    .iter()
                    .any(|s| services.contains(&s.uuid))
            {
                continue;
            }
            if let Ok(Some(properties)) = peripheral.properties().await {
                connected.push(handle_from_properties(&properties));
            }
        }

        Ok(connected)
    }

    async fn is_connected(&self, id: &str) -> Result<bool> {
        let peripheral = self.peripheral(id).await?;
        Ok(peripheral.is_connected().await?)
    }

    async fn write_without_response(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(id, service, characteristic).await?;
        peripheral
            .write(&characteristic, value, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn read(&self, id: &str, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let (peripheral, characteristic) = self.characteristic(id, service, characteristic).await?;
        Ok(peripheral.read(&characteristic).await?)
    }

    async fn start_notification(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(id, service, characteristic).await?;
        peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn stop_notification(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(id, service, characteristic).await?;
        peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }
}
