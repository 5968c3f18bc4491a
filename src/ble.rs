use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex, Notify, RwLock},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    chunker::{write_chunked, ChunkPolicy, ChunkSink},
    error::{BridgeError, Result},
    platform::{BlePlatform, CharacteristicInfo, DiscoveredServices, PlatformEvent},
    protocol::{FrameBuffer, Packet},
    types::{AdapterState, ConnectionState, ListenerKey, PeripheralHandle, PermissionStatus, Readiness},
};

/// Callback receiving validated packets from one characteristic
pub type PacketHandler = Arc<dyn Fn(Packet) + Send + Sync>;

struct Listener {
    handler: PacketHandler,
    buffer: FrameBuffer,
}

type ListenerMap = Arc<StdMutex<HashMap<ListenerKey, Listener>>>;

fn lock_listeners(listeners: &ListenerMap) -> MutexGuard<'_, HashMap<ListenerKey, Listener>> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the scan callback wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    /// Keep scanning
    Continue,
    /// Stop the scan; it settles successfully
    Stop,
}

/// How a scan ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEnd {
    /// The callback, [`BleTransport::stop_scan`] or a newer scan cancelled it
    Cancelled,
    /// The scan window elapsed
    TimedOut,
    /// The platform stopped the scan on its own
    PlatformStopped,
}

/// Summary of a settled scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    /// Named peripherals reported to the callback
    pub named_found: usize,
    /// Every distinct peripheral seen, named or not
    pub total_seen: usize,
    /// Why the scan ended
    pub end: ScanEnd,
}

/// Cooperative cancellation shared by a scan and whoever may stop it
#[derive(Debug, Default)]
struct ScanCancel {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ScanCancel {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// BLE transport: scan, connect and characteristic I/O on top of a platform
pub struct BleTransport {
    platform: Arc<dyn BlePlatform>,
    started: AtomicBool,
    init_lock: Mutex<()>,
    state: RwLock<ConnectionState>,
    known: RwLock<HashMap<String, PeripheralHandle>>,
    current: RwLock<Option<PeripheralHandle>>,
    listeners: ListenerMap,
    active_scan: StdMutex<Option<Arc<ScanCancel>>>,
    notification_pump: StdMutex<Option<JoinHandle<()>>>,
}

impl BleTransport {
    /// Create a transport over `platform`
    #[must_use]
    pub fn new(platform: Arc<dyn BlePlatform>) -> Self {
        Self {
            platform,
            started: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            state: RwLock::new(ConnectionState::Disconnected),
            known: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
            listeners: Arc::new(StdMutex::new(HashMap::new())),
            active_scan: StdMutex::new(None),
            notification_pump: StdMutex::new(None),
        }
    }

    /// Start the platform manager, request permissions and check the radio
    ///
    /// Safe to call repeatedly; the platform manager is started once until
    /// [`BleTransport::reset`] is called. Refusals are returned as
    /// [`Readiness`] values rather than errors.
    pub async fn initialize(&self) -> Readiness {
        let _guard = self.init_lock.lock().await;

        if !self.started.load(Ordering::SeqCst) {
            if let Err(e) = self.platform.start().await {
                warn!("Failed to start BLE manager: {}", e);
                return Readiness::Unavailable;
            }
            self.started.store(true, Ordering::SeqCst);
            info!("BLE manager started");
        }
        self.ensure_notification_pump();

        match self.platform.request_permissions().await {
            Ok(PermissionStatus::Granted) => {}
            Ok(PermissionStatus::Denied) => {
                warn!("Bluetooth permissions denied");
                return Readiness::PermissionDenied;
            }
            Err(e) => {
                warn!("Permission request failed: {}", e);
                return Readiness::PermissionDenied;
            }
        }

        match self.platform.adapter_state().await {
            Ok(AdapterState::On) => Readiness::Ready,
            Ok(state) => {
                debug!("Adapter state {:?}, trying to enable radio", state);
                match self.platform.enable_radio().await {
                    Ok(true) => Readiness::Ready,
                    Ok(false) => Readiness::AdapterOff,
                    Err(e) => {
                        warn!("Failed to enable Bluetooth radio: {}", e);
                        Readiness::AdapterOff
                    }
                }
            }
            Err(e) => {
                warn!("Failed to read adapter state: {}", e);
                Readiness::Unavailable
            }
        }
    }

    fn ensure_notification_pump(&self) {
        let mut slot = self
            .notification_pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|pump| !pump.is_finished()) {
            return;
        }

        let events = self.platform.events();
        let listeners = Arc::clone(&self.listeners);
        *slot = Some(tokio::spawn(pump_notifications(events, listeners)));
    }

    /// Scan for peripherals
    ///
    /// `on_found` is called once per newly seen named peripheral. Every
    /// peripheral, named or not, is recorded in the known-device cache.
    /// Starting a scan cancels any scan still running.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ScanTimeout`] if the scan ended without being
    /// cancelled and without finding a named peripheral, or the platform's
    /// error if the scan could not be started.
    pub async fn scan<F>(&self, scan_timeout: Duration, mut on_found: F) -> Result<ScanSummary>
    where
        F: FnMut(&PeripheralHandle) -> ScanControl + Send,
    {
        let cancel = Arc::new(ScanCancel::default());
        if let Some(previous) = self
            .active_scan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&cancel))
        {
            debug!("Tearing down previous scan");
            previous.cancel();
        }

        let mut events = self.platform.events();
        let previous_state = self.set_state(ConnectionState::Scanning).await;
        info!("Starting BLE scan for {:?}", scan_timeout);

        if let Err(e) = self.platform.start_scan(scan_timeout).await {
            warn!("Failed to start scan: {}", e);
            self.finish_scan(&cancel, previous_state, false).await;
            return Err(e);
        }

        let deadline = tokio::time::sleep(scan_timeout);
        tokio::pin!(deadline);

        let mut seen = HashSet::new();
        let mut named = HashSet::new();

        let end = loop {
            tokio::select! {
                biased;
                () = cancel.wait() => break ScanEnd::Cancelled,
                () = &mut deadline => break ScanEnd::TimedOut,
                event = events.recv() => match event {
                    Ok(PlatformEvent::Discovered(handle)) => {
                        let key = handle.id.to_ascii_uppercase();
                        seen.insert(key.clone());
                        self.known.write().await.insert(key.clone(), handle.clone());

                        if handle.name.is_none() || !named.insert(key) {
                            continue;
                        }
                        debug!("Found peripheral {} ({:?}, {} dBm)", handle.id, handle.name, handle.rssi);

                        if on_found(&handle) == ScanControl::Stop {
                            cancel.cancel();
                            break ScanEnd::Cancelled;
                        }
                    }
                    Ok(PlatformEvent::ScanStopped) => break ScanEnd::PlatformStopped,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Scan fell behind, {} platform events skipped", skipped);
                    }
                    Err(RecvError::Closed) => break ScanEnd::PlatformStopped,
                },
            }
        };

        self.finish_scan(&cancel, previous_state, end != ScanEnd::PlatformStopped)
            .await;

        let summary = ScanSummary {
            named_found: named.len(),
            total_seen: seen.len(),
            end,
        };
        info!(
            "Scan ended ({:?}): {} named of {} peripheral(s)",
            end, summary.named_found, summary.total_seen
        );

        if end == ScanEnd::Cancelled || summary.named_found > 0 {
            Ok(summary)
        } else {
            Err(BridgeError::ScanTimeout {
                timeout_ms: u64::try_from(scan_timeout.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }

    /// Release scan state if `cancel` still owns it
    async fn finish_scan(
        &self,
        cancel: &Arc<ScanCancel>,
        previous_state: ConnectionState,
        stop_platform: bool,
    ) {
        let owner = {
            let mut slot = self
                .active_scan
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let owner = slot.as_ref().is_some_and(|active| Arc::ptr_eq(active, cancel));
            if owner {
                *slot = None;
            }
            owner
        };

        // A superseded scan must not stop the platform scan its successor started
        if !owner {
            return;
        }

        if stop_platform {
            if let Err(e) = self.platform.stop_scan().await {
                debug!("Stopping platform scan failed: {}", e);
            }
        }

        let mut state = self.state.write().await;
        if *state == ConnectionState::Scanning {
            *state = previous_state;
        }
    }

    /// Cancel the running scan, if any
    pub async fn stop_scan(&self) {
        let active = self
            .active_scan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(cancel) = active {
            cancel.cancel();
        }
        if let Err(e) = self.platform.stop_scan().await {
            debug!("Stopping platform scan failed: {}", e);
        }
    }

    /// Connect to a peripheral and discover its services
    ///
    /// The peripheral becomes the current device only once discovery
    /// succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ConnectTimeout`] if the platform did not connect
    /// in time, [`BridgeError::ConnectFailed`] if it refused, or
    /// [`BridgeError::ServiceDiscoveryFailed`] if discovery failed. Each
    /// failure issues a best-effort disconnect.
    pub async fn connect(&self, id: &str, connect_timeout: Duration) -> Result<DiscoveredServices> {
        info!("Connecting to device: {}", id);
        self.set_state(ConnectionState::Connecting).await;

        match timeout(connect_timeout, self.platform.connect(id)).await {
            Err(_) => {
                warn!("Connecting to {} timed out", id);
                self.abandon_connection(id).await;
                return Err(BridgeError::ConnectTimeout {
                    timeout_ms: u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            Ok(Err(e)) => {
                warn!("Connecting to {} failed: {}", id, e);
                self.abandon_connection(id).await;
                return Err(BridgeError::ConnectFailed(e.to_string()));
            }
            Ok(Ok(())) => {}
        }

        self.set_state(ConnectionState::Discovering).await;
        let discovered = match self.platform.discover_services(id).await {
            Ok(discovered) => discovered,
            Err(e) => {
                warn!("Service discovery on {} failed: {}", id, e);
                self.abandon_connection(id).await;
                return Err(BridgeError::ServiceDiscoveryFailed(e.to_string()));
            }
        };

        let mut peripheral = discovered.peripheral.clone();
        if peripheral.name.is_none() {
            if let Some(known) = self.known_peripheral(id).await {
                peripheral.name = known.name;
            }
        }

        self.known
            .write()
            .await
            .insert(id.to_ascii_uppercase(), peripheral.clone());
        *self.current.write().await = Some(peripheral);
        self.set_state(ConnectionState::Ready).await;

        info!(
            "Successfully connected to {} ({} service(s))",
            id,
            discovered.services.len()
        );
        Ok(discovered)
    }

    async fn abandon_connection(&self, id: &str) {
        if let Err(e) = self.platform.disconnect(id).await {
            debug!("Cleanup disconnect of {} failed: {}", id, e);
        }
        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Drop every listener of `id`, then disconnect it
    ///
    /// # Errors
    ///
    /// Returns the platform error if the disconnect itself failed.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        self.unsubscribe_all(id).await;

        let result = self.platform.disconnect(id).await;

        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|c| c.matches_address(id)) {
            *current = None;
            drop(current);
            self.set_state(ConnectionState::Disconnected).await;
        }

        match result {
            Ok(()) => {
                info!("Disconnected from {}", id);
                Ok(())
            }
            Err(e) => {
                warn!("Disconnecting from {} failed: {}", id, e);
                Err(e)
            }
        }
    }

    /// Disconnect every connected peripheral
    ///
    /// # Errors
    ///
    /// Returns the first disconnect error; every peripheral is still tried.
    pub async fn disconnect_all(&self) -> Result<()> {
        let mut ids: Vec<String> = match self.platform.connected_peripherals(&[]).await {
            Ok(peripherals) => peripherals.into_iter().map(|p| p.id).collect(),
            Err(e) => {
                debug!("Listing connected peripherals failed: {}", e);
                Vec::new()
            }
        };
        if let Some(current) = self.current_device().await {
            if !ids.iter().any(|id| current.matches_address(id)) {
                ids.push(current.id);
            }
        }

        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.disconnect(&id).await {
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn require_current(&self) -> Result<PeripheralHandle> {
        self.current_device().await.ok_or(BridgeError::NotConnected)
    }

    /// Unacknowledged write to the current device
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotConnected`] without a current device, or the
    /// platform's write error.
    pub async fn write(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<()> {
        let device = self.require_current().await?;
        trace!("Writing {:02X?} to {}", value, characteristic);
        self.platform
            .write_without_response(&device.id, service, characteristic, value)
            .await
    }

    /// Write `value` to the current device in chunks
    ///
    /// # Errors
    ///
    /// Same as [`BleTransport::write`], plus
    /// [`BridgeError::InvalidParameters`] for a zero chunk size.
    pub async fn write_chunked(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        policy: &ChunkPolicy,
    ) -> Result<usize> {
        let writer = CharacteristicWriter {
            transport: self,
            service,
            characteristic,
        };
        write_chunked(&writer, value, policy).await
    }

    /// Single read from the current device
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotConnected`] without a current device, or the
    /// platform's read error.
    pub async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let device = self.require_current().await?;
        self.platform.read(&device.id, service, characteristic).await
    }

    /// Listen for validated packets on a characteristic of the current device
    ///
    /// Subscribing again on the same characteristic replaces the previous
    /// listener. Each listener reassembles frames in its own buffer.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotConnected`] without a current device, or the
    /// platform error if notifications could not be enabled; no listener is
    /// left registered in that case.
    pub async fn subscribe<F>(
        &self,
        service: Uuid,
        characteristic: Uuid,
        on_packet: F,
    ) -> Result<ListenerKey>
    where
        F: Fn(Packet) + Send + Sync + 'static,
    {
        let device = self.require_current().await?;
        self.ensure_notification_pump();

        let key = ListenerKey::new(&device.id, service, characteristic);
        {
            let mut listeners = lock_listeners(&self.listeners);
            if listeners.remove(&key).is_some() {
                debug!("Replacing listener on {}", characteristic);
            }
            listeners.insert(
                key.clone(),
                Listener {
                    handler: Arc::new(on_packet),
                    buffer: FrameBuffer::new(),
                },
            );
        }

        if let Err(e) = self
            .platform
            .start_notification(&device.id, service, characteristic)
            .await
        {
            warn!("Enabling notifications on {} failed: {}", characteristic, e);
            lock_listeners(&self.listeners).remove(&key);
            return Err(e);
        }

        debug!("Subscribed to {} on {}", characteristic, device.id);
        Ok(key)
    }

    /// Remove the listener on a characteristic of the current device
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotConnected`] without a current device.
    pub async fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let device = self.require_current().await?;
        let key = ListenerKey::new(&device.id, service, characteristic);

        let removed = lock_listeners(&self.listeners).remove(&key).is_some();
        if removed {
            if let Err(e) = self
                .platform
                .stop_notification(&device.id, service, characteristic)
                .await
            {
                debug!("Disabling notifications on {} failed: {}", characteristic, e);
            }
        }
        Ok(())
    }

    /// Remove every listener registered for `id`
    pub async fn unsubscribe_all(&self, id: &str) {
        let keys: Vec<ListenerKey> = {
            let mut listeners = lock_listeners(&self.listeners);
            let keys: Vec<ListenerKey> = listeners
                .keys()
                .filter(|key| key.belongs_to(id))
                .cloned()
                .collect();
            for key in &keys {
                listeners.remove(key);
            }
            keys
        };

        for key in keys {
            if let Err(e) = self
                .platform
                .stop_notification(id, key.service, key.characteristic)
                .await
            {
                debug!("Disabling notifications on {} failed: {}", key.characteristic, e);
            }
        }
    }

    /// Toggle platform notifications on a characteristic of the current device
    ///
    /// Disabling also removes the matching listener.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotConnected`] if the current device is gone,
    /// or the platform error.
    pub async fn set_notifications(
        &self,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()> {
        let device = self.require_current().await?;
        if !self.platform.is_connected(&device.id).await.unwrap_or(false) {
            return Err(BridgeError::NotConnected);
        }

        if enabled {
            self.platform
                .start_notification(&device.id, service, characteristic)
                .await
        } else {
            lock_listeners(&self.listeners)
                .remove(&ListenerKey::new(&device.id, service, characteristic));
            self.platform
                .stop_notification(&device.id, service, characteristic)
                .await
        }
    }

    /// Whether the current device is still connected
    pub async fn is_device_connected(&self) -> bool {
        match self.current_device().await {
            Some(device) => self.platform.is_connected(&device.id).await.unwrap_or(false),
            None => false,
        }
    }

    /// Peripherals the platform reports as connected
    ///
    /// # Errors
    ///
    /// Returns the platform error.
    pub async fn connected_peripherals(&self, services: &[Uuid]) -> Result<Vec<PeripheralHandle>> {
        self.platform.connected_peripherals(services).await
    }

    /// Every characteristic of a connected peripheral, rediscovered
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotConnected`] if `id` is not connected, or the
    /// platform's discovery error.
    pub async fn characteristics(&self, id: &str) -> Result<Vec<CharacteristicInfo>> {
        if !self.platform.is_connected(id).await? {
            return Err(BridgeError::NotConnected);
        }
        let discovered = self.platform.discover_services(id).await?;
        debug!(
            "{} has {} characteristic(s) across {} service(s)",
            id,
            discovered.characteristics.len(),
            discovered.services.len()
        );
        Ok(discovered.characteristics)
    }

    /// Characteristics of `id` that accept writes
    ///
    /// # Errors
    ///
    /// Same as [`BleTransport::characteristics`].
    pub async fn writable_characteristics(&self, id: &str) -> Result<Vec<CharacteristicInfo>> {
        let mut characteristics = self.characteristics(id).await?;
        characteristics.retain(|c| c.properties.write_kind().is_some());
        Ok(characteristics)
    }

    /// Characteristics of `id` that can be read, notified or indicated
    ///
    /// # Errors
    ///
    /// Same as [`BleTransport::characteristics`].
    pub async fn readable_characteristics(&self, id: &str) -> Result<Vec<CharacteristicInfo>> {
        let mut characteristics = self.characteristics(id).await?;
        characteristics.retain(|c| c.properties.is_readable());
        Ok(characteristics)
    }

    /// Peripheral seen during a scan or connect, by id
    pub async fn known_peripheral(&self, id: &str) -> Option<PeripheralHandle> {
        self.known.read().await.get(&id.to_ascii_uppercase()).cloned()
    }

    /// Current connection state
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Device most recently connected successfully
    pub async fn current_device(&self) -> Option<PeripheralHandle> {
        self.current.read().await.clone()
    }

    /// Number of registered listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        lock_listeners(&self.listeners).len()
    }

    /// Drop listeners, the known-device cache and the current device, and
    /// require the platform manager to be started again
    pub async fn reset(&self) {
        lock_listeners(&self.listeners).clear();
        self.known.write().await.clear();
        *self.current.write().await = None;
        self.set_state(ConnectionState::Disconnected).await;
        self.started.store(false, Ordering::SeqCst);
        debug!("Transport caches cleared");
    }

    /// Drop every listener without touching the platform
    pub fn clear_listeners(&self) {
        lock_listeners(&self.listeners).clear();
    }

    async fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let mut state = self.state.write().await;
        let previous = *state;
        if previous != next {
            debug!("Connection state {} -> {}", previous, next);
        }
        *state = next;
        previous
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Some(pump) = self
            .notification_pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
    }
}

/// Route notifications into the listener they belong to
async fn pump_notifications(mut events: broadcast::Receiver<PlatformEvent>, listeners: ListenerMap) {
    loop {
        match events.recv().await {
            Ok(PlatformEvent::Notification {
                peripheral,
                service,
                characteristic,
                value,
            }) => {
                let key = ListenerKey::new(&peripheral, service, characteristic);
                let delivery = {
                    let mut map = lock_listeners(&listeners);
                    map.get_mut(&key)
                        .map(|listener| (Arc::clone(&listener.handler), listener.buffer.push(&value)))
                };

                // Handlers run after the lock is released
                match delivery {
                    Some((handler, packets)) => {
                        for packet in packets {
                            trace!("Packet from {}: {}", peripheral, packet);
                            handler(packet);
                        }
                    }
                    None => trace!("No listener for {} on {}", characteristic, peripheral),
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Notification pump fell behind, {} events skipped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

struct CharacteristicWriter<'a> {
    transport: &'a BleTransport,
    service: Uuid,
    characteristic: Uuid,
}

#[async_trait]
impl ChunkSink for CharacteristicWriter<'_> {
    async fn write_chunk(&self, chunk: &[u8]) -> Result<()> {
        self.transport
            .write(self.service, self.characteristic, chunk)
            .await
    }
}
