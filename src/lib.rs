#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Washbridge
//!
//! Cellular-first control of self-service laundry and shower devices, with a
//! Bluetooth Low Energy fallback for machines whose modem is offline.
//!
//! Starting or stopping a device goes through the backend first. The device
//! status is polled a few times; if the modem stays unreachable the library
//! finds the device's BLE module, connects, drains any notices the backend
//! queued for it and performs a challenge handshake over a framed,
//! CRC16/MODBUS-checked byte protocol.
//!
//! ## Layers
//!
//! - [`protocol`]: frame checksums and stream reassembly
//! - [`ble`]: scanning, connections, chunked writes and notification routing
//!   on top of a [`platform::BlePlatform`] binding ([`backend`] for btleplug)
//! - [`lifecycle`]: startup, forced reset and background teardown
//! - [`consumption`]: the start/stop state machine driving both paths
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use washbridge::{
//!     BleTransport, BridgeConfig, BtleplugPlatform, ConsumptionOrchestrator, HttpDeviceApi,
//!     LifecycleManager,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::load("washbridge.toml")?;
//!
//!     let platform = Arc::new(BtleplugPlatform::new().await?);
//!     let transport = Arc::new(BleTransport::new(platform));
//!     let lifecycle = Arc::new(LifecycleManager::new(transport, config.lifecycle.clone()));
//!     let api = Arc::new(HttpDeviceApi::new(&config.api)?);
//!
//!     let orchestrator = ConsumptionOrchestrator::new(lifecycle, api, config);
//!     let outcome = orchestrator.start_consumption("D-1001").await?;
//!     println!("Started: {outcome:?}");
//!
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Backend contract and HTTP client
pub mod api;
/// btleplug platform binding
pub mod backend;
/// Bluetooth Low Energy transport
pub mod ble;
/// Chunked characteristic writes
pub mod chunker;
/// Configuration loading
pub mod config;
/// Start/stop orchestration across cellular and BLE
pub mod consumption;
/// Error types and handling
pub mod error;
/// Transport lifecycle management
pub mod lifecycle;
/// Platform abstraction for BLE bindings
pub mod platform;
/// Module variants and their UUID triads
pub mod profile;
/// Frame checksums and reassembly
pub mod protocol;
/// Bounded polling
pub mod retry;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the main types for convenient usage
#[cfg(feature = "http")]
pub use api::HttpDeviceApi;
pub use api::{ApiEnvelope, DeviceApi};
pub use backend::BtleplugPlatform;
pub use ble::{BleTransport, ScanControl, ScanEnd, ScanSummary};
pub use chunker::ChunkPolicy;
pub use config::BridgeConfig;
pub use consumption::{ConnectedModule, ConsumptionOrchestrator, ConsumptionOutcome};
pub use error::{BridgeError, Result};
pub use lifecycle::LifecycleManager;
pub use profile::{ModuleVariant, ServiceProfile};
pub use protocol::{FrameBuffer, Packet, PayloadEncoding};
pub use types::{
    ConsumptionSession, ConsumptionState, ControlPath, DeviceReachability, DeviceStatusReport,
    HandshakePurpose, OrderState, PeripheralHandle, Readiness,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Variant A primary service (`FEE9`)
pub const VARIANT_A_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_FEE9_0000_1000_8000_0080_5F9B_34FB);

/// Variant A notify characteristic
pub const VARIANT_A_NOTIFY_CHAR_UUID: Uuid =
    Uuid::from_u128(0xD44B_C439_ABFD_45A2_B575_9254_1612_9600);

/// Variant A write characteristic
pub const VARIANT_A_WRITE_CHAR_UUID: Uuid =
    Uuid::from_u128(0xD44B_C439_ABFD_45A2_B575_9254_1612_9601);

/// Variant B primary service (`FFF0`)
///
/// Its presence after service discovery selects variant B.
pub const VARIANT_B_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_FFF0_0000_1000_8000_0080_5F9B_34FB);

/// Variant B notify characteristic (`FFF1`)
pub const VARIANT_B_NOTIFY_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_FFF1_0000_1000_8000_0080_5F9B_34FB);

/// Variant B write characteristic (`FFF2`)
pub const VARIANT_B_WRITE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_FFF2_0000_1000_8000_0080_5F9B_34FB);
