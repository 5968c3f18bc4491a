//! Runtime configuration.
//!
//! Every timing constant the bridge uses lives here so deployments can tune
//! them from a TOML file. Missing keys fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

use crate::{
    chunker::ChunkPolicy,
    error::{BridgeError, Result},
    retry::RetryPolicy,
};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// BLE transport timing
    pub transport: TransportConfig,
    /// Consumption polling and handshake bounds
    pub consumption: ConsumptionConfig,
    /// Reset and teardown timing
    pub lifecycle: LifecycleConfig,
    /// REST client settings
    pub api: ApiConfig,
}

/// BLE transport timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// How long a scan runs before giving up
    pub scan_timeout_ms: u64,
    /// How long a connect may take
    pub connect_timeout_ms: u64,
    /// Largest single write
    pub max_chunk_size: usize,
    /// Pause between chunks of one write
    pub chunk_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            max_chunk_size: 20,
            chunk_delay_ms: 10,
        }
    }
}

impl TransportConfig {
    /// Scan window as a `Duration`
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Connect timeout as a `Duration`
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Chunking policy for writes
    #[must_use]
    pub const fn chunk_policy(&self) -> ChunkPolicy {
        ChunkPolicy::new(self.max_chunk_size, Duration::from_millis(self.chunk_delay_ms))
    }
}

/// Consumption polling and handshake bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumptionConfig {
    /// Pause between status polls
    pub poll_interval_ms: u64,
    /// Device status polls before falling back to BLE
    pub reachability_attempts: u32,
    /// Order status polls before giving up
    pub order_attempts: u32,
    /// How long to wait for each frame from the module
    pub ack_timeout_ms: u64,
    /// Most pending notices written in one handshake
    pub max_pending_notices: u32,
}

impl Default for ConsumptionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            reachability_attempts: 3,
            order_attempts: 7,
            ack_timeout_ms: 5_000,
            max_pending_notices: 16,
        }
    }
}

impl ConsumptionConfig {
    /// Retry policy for device reachability polls
    #[must_use]
    pub const fn reachability_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.reachability_attempts,
            Duration::from_millis(self.poll_interval_ms),
        )
    }

    /// Retry policy for order status polls
    #[must_use]
    pub const fn order_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.order_attempts,
            Duration::from_millis(self.poll_interval_ms),
        )
    }

    /// Per-frame wait as a `Duration`
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Reset and teardown timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Pause between teardown and reinitialization in a forced reset
    pub reset_settle_ms: u64,
    /// How long the app may stay backgrounded before BLE is torn down
    pub background_teardown_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reset_settle_ms: 500,
            background_teardown_ms: 30_000,
        }
    }
}

impl LifecycleConfig {
    /// Reset settle delay as a `Duration`
    #[must_use]
    pub const fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    /// Background window as a `Duration`
    #[must_use]
    pub const fn background_teardown(&self) -> Duration {
        Duration::from_millis(self.background_teardown_ms)
    }
}

/// REST client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL all endpoints hang off
    pub base_url: String,
    /// Per-request timeout
    pub request_timeout_ms: u64,
    /// Bearer token sent with every request
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            request_timeout_ms: 10_000,
            token: None,
        }
    }
}

impl BridgeConfig {
    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Toml`] if the text is not valid TOML for this
    /// structure, or [`BridgeError::Config`] if a value is out of range.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, or defaults if it does not exist
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Reject values the bridge cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.transport.max_chunk_size == 0 {
            return Err(BridgeError::Config(
                "transport.max_chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.consumption.reachability_attempts == 0 || self.consumption.order_attempts == 0 {
            return Err(BridgeError::Config(
                "consumption attempt counts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
