use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{ble::BleTransport, config::LifecycleConfig, types::Readiness};

/// Owns startup, forced reset and teardown of the BLE transport
pub struct LifecycleManager {
    transport: Arc<BleTransport>,
    config: LifecycleConfig,
    background_teardown: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleManager {
    /// Create a manager for `transport`
    #[must_use]
    pub fn new(transport: Arc<BleTransport>, config: LifecycleConfig) -> Self {
        Self {
            transport,
            config,
            background_teardown: Mutex::new(None),
        }
    }

    /// The managed transport
    #[must_use]
    pub fn transport(&self) -> &Arc<BleTransport> {
        &self.transport
    }

    /// Bring the transport up; safe to call repeatedly
    pub async fn initialize(&self) -> Readiness {
        self.transport.initialize().await
    }

    /// Tear everything down, wait for the stack to settle and start over
    ///
    /// Returns whether the transport is ready afterwards.
    pub async fn force_reset(&self) -> bool {
        info!("Forcing BLE reset");

        if let Err(e) = self.transport.disconnect_all().await {
            warn!("Disconnect during reset failed: {}", e);
        }
        self.transport.stop_scan().await;
        self.transport.reset().await;

        tokio::time::sleep(self.config.reset_settle()).await;

        let readiness = self.transport.initialize().await;
        info!("BLE reset finished: {:?}", readiness);
        readiness.is_ready()
    }

    /// Best-effort teardown that never fails
    ///
    /// Disconnects the current device, or every connected peripheral when no
    /// device is tracked. Any scan in flight is cancelled either way;
    /// `cancelled` marks a teardown requested by the user.
    pub async fn destroy(&self, cancelled: bool) {
        if cancelled {
            debug!("Teardown requested by the user");
        }
        teardown(&self.transport).await;
    }

    /// Schedule a teardown after the background window if a BLE session is
    /// open; returns whether one was scheduled
    pub async fn on_background(&self) -> bool {
        self.cancel_background_teardown();

        if self.transport.current_device().await.is_none() {
            debug!("Backgrounded without an open BLE session");
            return false;
        }

        let transport = Arc::clone(&self.transport);
        let window = self.config.background_teardown();
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            info!("Background window of {:?} elapsed, tearing down BLE", window);
            teardown(&transport).await;
        });

        *self
            .background_teardown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        debug!("BLE teardown scheduled in {:?}", window);
        true
    }

    /// Cancel a scheduled background teardown; returns whether one was pending
    pub fn on_foreground(&self) -> bool {
        let cancelled = self.cancel_background_teardown();
        if cancelled {
            debug!("Background teardown cancelled");
        }
        cancelled
    }

    fn cancel_background_teardown(&self) -> bool {
        let pending = self
            .background_teardown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match pending {
            Some(task) if !task.is_finished() => {
                task.abort();
                true
            }
            _ => false,
        }
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        self.cancel_background_teardown();
    }
}

async fn teardown(transport: &BleTransport) {
    transport.stop_scan().await;

    match transport.current_device().await {
        Some(device) => {
            if let Err(e) = transport.disconnect(&device.id).await {
                debug!("Teardown disconnect of {} failed: {}", device.id, e);
            }
        }
        None => {
            if let Err(e) = transport.disconnect_all().await {
                debug!("Teardown disconnect failed: {}", e);
            }
        }
    }

    transport.clear_listeners();
    info!("BLE torn down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        platform::BlePlatform,
        testing::{MockPlatform, DEVICE_ADDRESS},
        VARIANT_A_SERVICE_UUID,
    };
    use std::time::Duration;

    async fn connected() -> (Arc<MockPlatform>, LifecycleManager) {
        let platform = Arc::new(MockPlatform::with_module(VARIANT_A_SERVICE_UUID));
        let transport = Arc::new(BleTransport::new(platform.clone()));
        let lifecycle = LifecycleManager::new(transport, LifecycleConfig::default());
        assert!(lifecycle.initialize().await.is_ready());
        lifecycle
            .transport()
            .connect(DEVICE_ADDRESS, Duration::from_secs(10))
            .await
            .unwrap();
        (platform, lifecycle)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_teardown_fires_after_window() {
        let (platform, lifecycle) = connected().await;

        assert!(lifecycle.on_background().await);
        tokio::time::sleep(Duration::from_secs(29)).await;
        settle().await;
        assert!(platform.is_linked(DEVICE_ADDRESS));

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert!(!platform.is_linked(DEVICE_ADDRESS));
        assert!(lifecycle.transport().current_device().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_cancels_teardown() {
        let (platform, lifecycle) = connected().await;

        assert!(lifecycle.on_background().await);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(lifecycle.on_foreground());

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert!(platform.is_linked(DEVICE_ADDRESS));
        assert!(platform.disconnects().is_empty());
        assert!(!lifecycle.on_foreground());
    }

    #[tokio::test]
    async fn test_background_without_session_schedules_nothing() {
        let platform = Arc::new(MockPlatform::new());
        let transport = Arc::new(BleTransport::new(platform));
        let lifecycle = LifecycleManager::new(transport, LifecycleConfig::default());

        assert!(!lifecycle.on_background().await);
        assert!(!lifecycle.on_foreground());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reset_clears_and_reinitializes() {
        let (platform, lifecycle) = connected().await;
        lifecycle
            .transport()
            .subscribe(
                crate::VARIANT_A_SERVICE_UUID,
                crate::VARIANT_A_NOTIFY_CHAR_UUID,
                |_| {},
            )
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        assert!(lifecycle.force_reset().await);

        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(platform.start_calls(), 2);
        assert!(!platform.is_linked(DEVICE_ADDRESS));
        assert_eq!(lifecycle.transport().listener_count(), 0);
        assert!(lifecycle
            .transport()
            .known_peripheral(DEVICE_ADDRESS)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_destroy_never_fails() {
        let platform = Arc::new(MockPlatform::new());
        let transport = Arc::new(BleTransport::new(platform.clone()));
        let lifecycle = LifecycleManager::new(transport, LifecycleConfig::default());

        lifecycle.destroy(true).await;
        lifecycle.destroy(false).await;
        assert_eq!(platform.scan_stops(), 2);

        let (platform, lifecycle) = connected().await;
        lifecycle.destroy(true).await;
        assert_eq!(platform.disconnects(), vec![DEVICE_ADDRESS.to_string()]);
    }

    #[tokio::test]
    async fn test_destroy_disconnects_untracked_links() {
        let platform = Arc::new(MockPlatform::with_module(VARIANT_A_SERVICE_UUID));
        let transport = Arc::new(BleTransport::new(platform.clone()));
        let lifecycle = LifecycleManager::new(transport, LifecycleConfig::default());

        // Linked at the platform level only, so no current device is tracked
        platform.connect(DEVICE_ADDRESS).await.unwrap();
        assert!(lifecycle.transport().current_device().await.is_none());

        lifecycle.destroy(true).await;

        assert!(!platform.is_linked(DEVICE_ADDRESS));
        assert_eq!(platform.disconnects(), vec![DEVICE_ADDRESS.to_string()]);
    }
}
