//! Seam between the transport and the host's BLE stack.
//!
//! [`BleTransport`](crate::ble::BleTransport) only talks to the radio through
//! [`BlePlatform`]. The production implementation is
//! [`BtleplugPlatform`](crate::backend::BtleplugPlatform); tests drive the
//! transport with an in-memory double.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    error::Result,
    types::{AdapterState, PeripheralHandle, PermissionStatus},
};

/// Capacity of the platform event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something the platform reported asynchronously
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// A peripheral was seen or its advertisement changed
    Discovered(PeripheralHandle),
    /// The platform scan ended on its own
    ScanStopped,
    /// A subscribed characteristic changed value
    Notification {
        /// Peripheral id
        peripheral: String,
        /// Service owning the characteristic
        service: Uuid,
        /// Characteristic that notified
        characteristic: Uuid,
        /// Raw bytes received
        value: Vec<u8>,
    },
    /// The radio changed power state
    StateChanged(AdapterState),
    /// A peripheral dropped its connection
    Disconnected(String),
}

/// GATT properties of one characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[allow(clippy::struct_excessive_bools)]
pub struct CharacteristicProperties {
    /// Value can be read
    pub read: bool,
    /// Acknowledged writes accepted
    pub write: bool,
    /// Unacknowledged writes accepted
    pub write_without_response: bool,
    /// Value changes are notified
    pub notify: bool,
    /// Value changes are indicated
    pub indicate: bool,
}

/// How a characteristic accepts writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    /// Acknowledged writes only
    WithResponse,
    /// Unacknowledged writes only
    WithoutResponse,
    /// Either kind
    Both,
}

impl CharacteristicProperties {
    /// Write support, or `None` for a characteristic that cannot be written
    #[must_use]
    pub const fn write_kind(&self) -> Option<WriteKind> {
        match (self.write, self.write_without_response) {
            (true, true) => Some(WriteKind::Both),
            (true, false) => Some(WriteKind::WithResponse),
            (false, true) => Some(WriteKind::WithoutResponse),
            (false, false) => None,
        }
    }

    /// Whether values can be read, notified or indicated
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.read || self.notify || self.indicate
    }

    /// Whether changes are pushed to subscribers
    #[must_use]
    pub const fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A characteristic found during service discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicInfo {
    /// Owning service
    pub service: Uuid,
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Supported operations
    pub properties: CharacteristicProperties,
}

/// Result of service discovery on a connected peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServices {
    /// Peripheral as known after connecting
    pub peripheral: PeripheralHandle,
    /// Every service UUID the peripheral exposes
    pub services: Vec<Uuid>,
    /// Every characteristic of those services
    pub characteristics: Vec<CharacteristicInfo>,
}

impl DiscoveredServices {
    /// Characteristics that accept writes of either kind
    pub fn writable(&self) -> impl Iterator<Item = &CharacteristicInfo> {
        self.characteristics
            .iter()
            .filter(|c| c.properties.write_kind().is_some())
    }

    /// Characteristics that can be read, notified or indicated
    pub fn readable(&self) -> impl Iterator<Item = &CharacteristicInfo> {
        self.characteristics
            .iter()
            .filter(|c| c.properties.is_readable())
    }

    /// Look up one characteristic
    #[must_use]
    pub fn characteristic(&self, service: Uuid, uuid: Uuid) -> Option<&CharacteristicInfo> {
        self.characteristics
            .iter()
            .find(|c| c.service == service && c.uuid == uuid)
    }
}

/// Platform BLE primitives
#[async_trait]
pub trait BlePlatform: Send + Sync {
    /// Start the platform manager
    async fn start(&self) -> Result<()>;

    /// Current power state of the radio
    async fn adapter_state(&self) -> Result<AdapterState>;

    /// Ask for the runtime permissions scanning and connecting need
    async fn request_permissions(&self) -> Result<PermissionStatus>;

    /// Try to switch the radio on; returns whether it is on afterwards
    async fn enable_radio(&self) -> Result<bool>;

    /// Subscribe to platform events
    fn events(&self) -> broadcast::Receiver<PlatformEvent>;

    /// Begin discovery; the platform emits [`PlatformEvent::ScanStopped`]
    /// once `duration` has passed
    async fn start_scan(&self, duration: Duration) -> Result<()>;

    /// End discovery
    async fn stop_scan(&self) -> Result<()>;

    /// Open a connection
    async fn connect(&self, id: &str) -> Result<()>;

    /// Close a connection
    async fn disconnect(&self, id: &str) -> Result<()>;

    /// Discover services and characteristics of a connected peripheral
    async fn discover_services(&self, id: &str) -> Result<DiscoveredServices>;

    /// Peripherals currently connected, optionally filtered by service
    async fn connected_peripherals(&self, services: &[Uuid]) -> Result<Vec<PeripheralHandle>>;

    /// Whether `id` is connected right now
    async fn is_connected(&self, id: &str) -> Result<bool>;

    /// Unacknowledged write
    async fn write_without_response(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<()>;

    /// Single read
    async fn read(&self, id: &str, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Enable notifications on a characteristic
    async fn start_notification(&self, id: &str, service: Uuid, characteristic: Uuid)
        -> Result<()>;

    /// Disable notifications on a characteristic
    async fn stop_notification(&self, id: &str, service: Uuid, characteristic: Uuid)
        -> Result<()>;
}
