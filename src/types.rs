use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, time::SystemTime};
use uuid::Uuid;

use crate::error::{BridgeError, Result};

/// Advertising payload captured during discovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisingData {
    /// Local name advertised by the peripheral
    pub local_name: Option<String>,
    /// Service UUIDs in the advertisement
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer specific data keyed by company id
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Advertised transmit power
    pub tx_power_level: Option<i16>,
}

/// A discovered or connected peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    /// Platform address string (`AA:BB:CC:DD:EE:FF` on most platforms)
    pub id: String,
    /// Device name, if advertised
    pub name: Option<String>,
    /// Last seen signal strength
    pub rssi: i16,
    /// Raw advertising data
    pub advertising: AdvertisingData,
}

impl PeripheralHandle {
    /// Create a handle with no advertising data
    #[must_use]
    pub fn new(id: impl Into<String>, name: Option<String>, rssi: i16) -> Self {
        Self {
            id: id.into(),
            name,
            rssi,
            advertising: AdvertisingData::default(),
        }
    }

    /// Check whether this peripheral lives at `address`, ignoring case
    #[must_use]
    pub fn matches_address(&self, address: &str) -> bool {
        self.id.eq_ignore_ascii_case(address)
    }
}

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing connected
    #[default]
    Disconnected,
    /// Discovery in progress
    Scanning,
    /// Platform connect in flight
    Connecting,
    /// Link established, services not yet known
    Connected,
    /// Service discovery in flight
    Discovering,
    /// Services discovered, ready for I/O
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Power state of the host Bluetooth radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterState {
    /// State not reported yet
    #[default]
    Unknown,
    /// Radio on
    On,
    /// Radio off
    Off,
}

/// Result of a runtime permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// Every required permission was granted
    Granted,
    /// At least one required permission was refused
    Denied,
}

/// Outcome of adapter initialization
///
/// Refusals are reported as values so callers can prompt the user instead of
/// unwinding through an error path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Adapter started, permissions granted and radio on
    Ready,
    /// The user refused a required permission
    PermissionDenied,
    /// The radio is off and could not be switched on
    AdapterOff,
    /// The platform manager could not be started
    Unavailable,
}

impl Readiness {
    /// Whether the adapter can be used
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Convert into a `Result` for callers that propagate with `?`
    ///
    /// # Errors
    ///
    /// Returns the matching [`BridgeError`] for every non-ready value.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Ready => Ok(()),
            Self::PermissionDenied => Err(BridgeError::PermissionDenied),
            Self::AdapterOff => Err(BridgeError::AdapterOff),
            Self::Unavailable => Err(BridgeError::AdapterUnavailable),
        }
    }
}

/// Composite key for one notification listener
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    /// Peripheral id
    pub peripheral: String,
    /// Service UUID
    pub service: Uuid,
    /// Characteristic UUID
    pub characteristic: Uuid,
}

impl ListenerKey {
    /// Build a key; the peripheral id is normalized to uppercase
    #[must_use]
    pub fn new(peripheral: &str, service: Uuid, characteristic: Uuid) -> Self {
        Self {
            peripheral: peripheral.to_ascii_uppercase(),
            service,
            characteristic,
        }
    }

    /// Whether this key belongs to `peripheral`
    #[must_use]
    pub fn belongs_to(&self, peripheral: &str) -> bool {
        self.peripheral.eq_ignore_ascii_case(peripheral)
    }
}

/// Which control path a session went through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlPath {
    /// REST over the device's cellular modem
    Cellular,
    /// Direct BLE handshake
    Ble,
}

/// What a BLE handshake is asking the module to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakePurpose {
    /// Begin a consumption
    Start,
    /// End a consumption
    Stop,
}

impl fmt::Display for HandshakePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// Consumption session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConsumptionState {
    /// No session
    #[default]
    Idle,
    /// Polling the device over cellular
    Polling4G,
    /// Running the BLE handshake
    BleHandshake,
    /// Device in use
    Active,
    /// Stop in progress
    Stopping,
}

impl ConsumptionState {
    /// Whether moving from `self` to `next` keeps the session moving forward
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Polling4G | Self::Stopping)
                | (Self::Polling4G, Self::Active | Self::BleHandshake)
                | (Self::BleHandshake, Self::Active)
                | (Self::Active, Self::Stopping)
                | (_, Self::Idle)
        )
    }
}

impl fmt::Display for ConsumptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Polling4G => write!(f, "Polling4G"),
            Self::BleHandshake => write!(f, "BleHandshake"),
            Self::Active => write!(f, "Active"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

/// One device-use session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionSession {
    /// Device number
    pub device_no: String,
    /// Order created by the backend, if any
    pub order_id: Option<String>,
    /// Current state
    pub state: ConsumptionState,
    /// Status polls made in the current attempt
    pub attempt_count: u32,
    /// Whether the device reported it is running
    pub running: bool,
    /// Path that started the consumption
    pub path: Option<ControlPath>,
    /// When the session was created
    pub created_at: SystemTime,
}

impl ConsumptionSession {
    /// Create an idle session
    #[must_use]
    pub fn new(device_no: impl Into<String>) -> Self {
        Self {
            device_no: device_no.into(),
            order_id: None,
            state: ConsumptionState::Idle,
            attempt_count: 0,
            running: false,
            path: None,
            created_at: SystemTime::now(),
        }
    }

    /// Move to `next`
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidTransition`] if `next` would move the
    /// session backwards.
    pub fn transition(&mut self, next: ConsumptionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(BridgeError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Cellular reachability reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64")]
pub enum DeviceReachability {
    /// Modem offline
    Unreachable,
    /// Modem online
    Reachable,
    /// Device locked for maintenance
    Maintenance,
}

impl From<i64> for DeviceReachability {
    fn from(code: i64) -> Self {
        match code {
            1 => Self::Reachable,
            2 => Self::Maintenance,
            _ => Self::Unreachable,
        }
    }
}

/// Device status returned by the backend
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusReport {
    /// Cellular reachability
    pub state: DeviceReachability,
    /// Raw MAC of the device's BLE module
    #[serde(default)]
    pub mac: Option<String>,
}

/// Order state reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64")]
pub enum OrderState {
    /// Accepted but not running yet
    Pending,
    /// Device is running
    Running,
    /// Finished normally
    Completed,
    /// Device or backend failure
    Failed,
    /// Cancelled before running
    Cancelled,
}

impl OrderState {
    /// Whether no further change is expected
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl From<i64> for OrderState {
    fn from(code: i64) -> Self {
        match code {
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Failed,
            4 => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Order created by a start or stop request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTicket {
    /// Order identifier
    pub order_id: String,
}

/// Convert a raw MAC (`A1B2C3D4E5F6`, any case, optional separators) into
/// colon-delimited uppercase form
///
/// # Errors
///
/// Returns [`BridgeError::InvalidAddress`] unless the input holds exactly
/// twelve hex digits.
pub fn mac_to_address(raw: &str) -> Result<String> {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | ' '))
        .collect();

    if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BridgeError::InvalidAddress(raw.to_string()));
    }

    let upper = digits.to_ascii_uppercase();
    let parts: Vec<&str> = (0..6).map(|i| &upper[i * 2..i * 2 + 2]).collect();
    Ok(parts.join(":"))
}
