use thiserror::Error;

use crate::types::ConsumptionState;

/// Errors that can occur while driving a device over cellular or BLE
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Runtime permissions for scanning or connecting were refused
    #[error("Bluetooth permissions denied - enable location and Bluetooth access in settings")]
    PermissionDenied,

    /// The Bluetooth radio is switched off
    #[error("Bluetooth is turned off - switch it on and retry")]
    AdapterOff,

    /// No Bluetooth adapter is available on this host
    #[error("No Bluetooth adapter available")]
    AdapterUnavailable,

    /// Scan finished without seeing a single named peripheral
    #[error("Scan timed out after {timeout_ms}ms without finding a device")]
    ScanTimeout {
        /// Scan window in milliseconds
        timeout_ms: u64,
    },

    /// Connection attempt exceeded its timer
    #[error("Connecting to device timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Connect timeout in milliseconds
        timeout_ms: u64,
    },

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectFailed(String),

    /// Service or characteristic discovery failed after connecting
    #[error("Service discovery failed: {0}")]
    ServiceDiscoveryFailed(String),

    /// An operation needed a connected peripheral and there is none
    #[error("No connected device")]
    NotConnected,

    /// The peripheral with the given address never showed up
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A MAC address could not be parsed
    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    /// No frame arrived from the module in time
    #[error("No response from module within {timeout_ms}ms")]
    AckTimeout {
        /// Wait window in milliseconds
        timeout_ms: u64,
    },

    /// The module kept reporting pending notices past the configured bound
    #[error("Module still has pending notices after {limit} writes")]
    NoticeLimitExceeded {
        /// Number of notices written before giving up
        limit: u32,
    },

    /// The backend rejected a request with a business error
    #[error("Request rejected ({code}): {message}")]
    Business {
        /// Backend status code
        code: i64,
        /// User-facing message from the backend
        message: String,
    },

    /// The device is in maintenance and cannot be used
    #[error("Device {device_no} is under maintenance")]
    UnderMaintenance {
        /// Device number as printed on the machine
        device_no: String,
    },

    /// A consumption session for this device is already in flight
    #[error("Device {device_no} already has a session in state {state}")]
    SessionBusy {
        /// Device number
        device_no: String,
        /// State of the existing session
        state: ConsumptionState,
    },

    /// A session was asked to move backwards through its states
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: ConsumptionState,
        /// Requested state
        to: ConsumptionState,
    },

    /// The backend reported the order as failed or cancelled
    #[error("Order {order_id} ended in state {state}")]
    OrderFailed {
        /// Order identifier
        order_id: String,
        /// Terminal state reported
        state: String,
    },

    /// The order never reached a running or terminal state
    #[error("Order {order_id} not settled after {attempts} status checks")]
    OrderNotSettled {
        /// Order identifier
        order_id: String,
        /// Status checks performed
        attempts: u32,
    },

    /// Stop was requested but the session carries no order id
    #[error("No order recorded for device {0}")]
    MissingOrder(String),

    /// Invalid parameters passed by the caller
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Platform binding error that is not a btleplug error
    #[error("Platform error: {0}")]
    Platform(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parse error
    #[error("Invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Backend codes that invalidate the whole login session
const AUTH_CODES: [i64; 3] = [401, 403, 10_401];

impl BridgeError {
    /// Check if this error indicates a BLE connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectFailed(_)
                | Self::ConnectTimeout { .. }
                | Self::ServiceDiscoveryFailed(_)
                | Self::NotConnected
                | Self::DeviceNotFound(_)
        )
    }

    /// Check if this error is recoverable by retrying
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ScanTimeout { .. }
                | Self::ConnectTimeout { .. }
                | Self::ConnectFailed(_)
                | Self::ServiceDiscoveryFailed(_)
                | Self::AckTimeout { .. }
                | Self::DeviceNotFound(_)
        )
    }

    /// Check if the user has to act (grant permissions, switch on the radio)
    #[must_use]
    pub const fn requires_user_action(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::AdapterOff)
    }

    /// Check if the user has to be sent to the system settings page
    #[must_use]
    pub const fn requires_settings_redirect(&self) -> bool {
        matches!(self, Self::PermissionDenied)
    }

    /// Check if this is a backend authentication failure
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        match self {
            Self::Business { code, .. } => AUTH_CODES.contains(code),
            _ => false,
        }
    }

    /// Check if a cellular-path failure should send the caller to the BLE path
    #[must_use]
    pub const fn escalates_to_ble(&self) -> bool {
        match self {
            #[cfg(feature = "http")]
            Self::Http(_) => true,
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Message suitable for showing to the user
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Business { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
