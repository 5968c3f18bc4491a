use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    api::DeviceApi,
    ble::{BleTransport, ScanControl},
    config::BridgeConfig,
    error::{BridgeError, Result},
    lifecycle::LifecycleManager,
    profile::ServiceProfile,
    protocol::{encode_payload, Packet},
    retry::{poll_until, Clock, PollDecision, PollOutcome, TokioClock},
    types::{
        mac_to_address, ConsumptionSession, ConsumptionState, ControlPath, DeviceReachability,
        DeviceStatusReport, HandshakePurpose, ListenerKey, OrderState, PeripheralHandle,
    },
};

/// How a start or stop request was carried out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumptionOutcome {
    /// The backend drove the device over cellular
    Cellular {
        /// Order created for the request
        order_id: String,
        /// State the order settled in
        state: OrderState,
    },
    /// The device was driven directly over BLE
    Ble {
        /// The module's answer to the challenge
        response: Packet,
    },
}

/// A module connected through [`ConsumptionOrchestrator::scan_and_connect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedModule {
    /// Connected peripheral
    pub peripheral: PeripheralHandle,
    /// UUID triad for this module
    pub profile: ServiceProfile,
    /// Listener registered on the notify characteristic
    pub listener: ListenerKey,
}

enum Reachability {
    Online,
    Offline { mac: String },
}

type SessionMap = Arc<Mutex<HashMap<String, ConsumptionSession>>>;

fn lock_sessions(sessions: &SessionMap) -> MutexGuard<'_, HashMap<String, ConsumptionSession>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive hold on one device's session for the duration of a request
///
/// Dropping the lease without keeping or finishing it returns the session to
/// `Idle`, so errors and cancelled futures never leave a device stuck.
struct SessionLease {
    sessions: SessionMap,
    device_no: String,
    released: bool,
}

impl SessionLease {
    fn update<R>(&self, f: impl FnOnce(&mut ConsumptionSession) -> R) -> R {
        let mut sessions = lock_sessions(&self.sessions);
        let session = sessions
            .entry(self.device_no.clone())
            .or_insert_with(|| ConsumptionSession::new(self.device_no.clone()));
        f(session)
    }

    fn transition(&self, next: ConsumptionState) -> Result<()> {
        self.update(|session| session.transition(next))
    }

    /// Leave the session in its current state
    fn keep(mut self) {
        self.released = true;
    }

    /// The session is over; forget it
    fn finish(mut self) {
        lock_sessions(&self.sessions).remove(&self.device_no);
        self.released = true;
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.update(|session| {
            session.state = ConsumptionState::Idle;
            session.attempt_count = 0;
        });
        debug!("Session for {} returned to Idle", self.device_no);
    }
}

fn start_decision(state: &OrderState) -> PollDecision {
    match state {
        OrderState::Running | OrderState::Completed => PollDecision::Success,
        OrderState::Failed | OrderState::Cancelled => PollDecision::Abort,
        OrderState::Pending => PollDecision::Continue,
    }
}

fn stop_decision(state: &OrderState) -> PollDecision {
    match state {
        OrderState::Completed | OrderState::Cancelled => PollDecision::Success,
        OrderState::Failed => PollDecision::Abort,
        OrderState::Running | OrderState::Pending => PollDecision::Continue,
    }
}

/// Drives device-use sessions: cellular first, BLE handshake as fallback
pub struct ConsumptionOrchestrator {
    transport: Arc<BleTransport>,
    lifecycle: Arc<LifecycleManager>,
    api: Arc<dyn DeviceApi>,
    clock: Arc<dyn Clock>,
    config: BridgeConfig,
    sessions: SessionMap,
}

impl ConsumptionOrchestrator {
    /// Create an orchestrator using the lifecycle manager's transport
    #[must_use]
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        api: Arc<dyn DeviceApi>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            transport: Arc::clone(lifecycle.transport()),
            lifecycle,
            api,
            clock: Arc::new(TokioClock),
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Use `clock` for poll intervals
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The BLE transport in use
    #[must_use]
    pub fn transport(&self) -> &Arc<BleTransport> {
        &self.transport
    }

    /// Snapshot of a device's session
    #[must_use]
    pub fn session(&self, device_no: &str) -> Option<ConsumptionSession> {
        lock_sessions(&self.sessions).get(device_no).cloned()
    }

    fn begin_start(&self, device_no: &str) -> Result<SessionLease> {
        let mut sessions = lock_sessions(&self.sessions);
        let session = sessions
            .entry(device_no.to_string())
            .or_insert_with(|| ConsumptionSession::new(device_no));

        if session.state != ConsumptionState::Idle {
            return Err(BridgeError::SessionBusy {
                device_no: device_no.to_string(),
                state: session.state,
            });
        }

        session.transition(ConsumptionState::Polling4G)?;
        session.order_id = None;
        session.attempt_count = 0;
        session.running = false;
        session.path = None;
        session.created_at = SystemTime::now();

        Ok(SessionLease {
            sessions: Arc::clone(&self.sessions),
            device_no: device_no.to_string(),
            released: false,
        })
    }

    fn begin_stop(&self, device_no: &str) -> Result<(SessionLease, Option<String>)> {
        let mut sessions = lock_sessions(&self.sessions);
        let session = sessions
            .get_mut(device_no)
            .ok_or_else(|| BridgeError::MissingOrder(device_no.to_string()))?;

        match session.state {
            ConsumptionState::Active => {}
            ConsumptionState::Idle if session.running || session.order_id.is_some() => {}
            ConsumptionState::Idle => return Err(BridgeError::MissingOrder(device_no.to_string())),
            state => {
                return Err(BridgeError::SessionBusy {
                    device_no: device_no.to_string(),
                    state,
                })
            }
        }

        session.transition(ConsumptionState::Stopping)?;
        session.attempt_count = 0;

        Ok((
            SessionLease {
                sessions: Arc::clone(&self.sessions),
                device_no: device_no.to_string(),
                released: false,
            },
            session.order_id.clone(),
        ))
    }

    /// Start using a device
    ///
    /// Polls cellular reachability first. A reachable device is started
    /// through the backend; an unreachable one through the BLE handshake.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SessionBusy`] if the device already has a
    /// session in flight, [`BridgeError::UnderMaintenance`] for devices in
    /// maintenance, order errors from the cellular path, or transport errors
    /// from the BLE path. The session is back in `Idle` after any error.
    pub async fn start_consumption(&self, device_no: &str) -> Result<ConsumptionOutcome> {
        let lease = self.begin_start(device_no)?;
        info!("Starting consumption on device {}", device_no);

        match self.poll_reachability(&lease).await? {
            Reachability::Online => {
                let ticket = self.api.start_consumption(device_no).await?;
                lease.update(|s| s.order_id = Some(ticket.order_id.clone()));

                let state = self.settle_order(&ticket.order_id, start_decision).await?;
                lease.transition(ConsumptionState::Active)?;
                lease.update(|s| {
                    s.path = Some(ControlPath::Cellular);
                    s.running = state == OrderState::Running;
                });
                info!("Order {} for {} is {}", ticket.order_id, device_no, state);

                if state == OrderState::Running {
                    lease.keep();
                } else {
                    lease.finish();
                }
                Ok(ConsumptionOutcome::Cellular {
                    order_id: ticket.order_id,
                    state,
                })
            }
            Reachability::Offline { mac } => {
                lease.transition(ConsumptionState::BleHandshake)?;
                warn!("Device {} unreachable over cellular, falling back to BLE", device_no);

                let response = self
                    .ble_handshake(device_no, &mac, HandshakePurpose::Start)
                    .await?;
                lease.transition(ConsumptionState::Active)?;
                lease.update(|s| {
                    s.path = Some(ControlPath::Ble);
                    s.running = true;
                });
                lease.keep();
                Ok(ConsumptionOutcome::Ble { response })
            }
        }
    }

    /// Stop using a device, with the same cellular-first shape as start
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::MissingOrder`] if nothing was started on this
    /// device, [`BridgeError::SessionBusy`] while another request is in
    /// flight, and the same path errors as
    /// [`ConsumptionOrchestrator::start_consumption`].
    pub async fn stop_consumption(&self, device_no: &str) -> Result<ConsumptionOutcome> {
        let (lease, order_id) = self.begin_stop(device_no)?;
        info!("Stopping consumption on device {}", device_no);

        match self.poll_reachability(&lease).await? {
            Reachability::Online => {
                let ticket = self
                    .api
                    .stop_consumption(device_no, order_id.as_deref())
                    .await?;
                let polled = order_id.as_deref().unwrap_or(&ticket.order_id);
                let state = self.settle_order(polled, stop_decision).await?;
                info!("Stop order {} for {} is {}", ticket.order_id, device_no, state);

                lease.finish();
                Ok(ConsumptionOutcome::Cellular {
                    order_id: ticket.order_id,
                    state,
                })
            }
            Reachability::Offline { mac } => {
                warn!("Device {} unreachable over cellular, stopping over BLE", device_no);
                let response = self
                    .ble_handshake(device_no, &mac, HandshakePurpose::Stop)
                    .await?;
                lease.finish();
                Ok(ConsumptionOutcome::Ble { response })
            }
        }
    }

    async fn poll_reachability(&self, lease: &SessionLease) -> Result<Reachability> {
        let policy = self.config.consumption.reachability_policy();
        let device_no = lease.device_no.clone();
        let mut last_mac: Option<String> = None;

        let outcome = poll_until(
            &policy,
            self.clock.as_ref(),
            |attempt| {
                lease.update(|s| s.attempt_count = attempt);
                let api = Arc::clone(&self.api);
                let device_no = device_no.clone();
                async move {
                    match api.device_status(&device_no).await {
                        Ok(report) => Ok(Some(report)),
                        Err(e) if e.escalates_to_ble() => {
                            warn!("Status query for {} failed: {}", device_no, e);
                            Ok(None)
                        }
                        Err(e) => Err(e),
                    }
                }
            },
            |report: &Option<DeviceStatusReport>| {
                let Some(report) = report else {
                    return PollDecision::Continue;
                };
                if report.mac.is_some() {
                    last_mac.clone_from(&report.mac);
                }
                match report.state {
                    DeviceReachability::Reachable => PollDecision::Success,
                    DeviceReachability::Maintenance => PollDecision::Abort,
                    DeviceReachability::Unreachable => PollDecision::Continue,
                }
            },
        )
        .await?;

        match outcome {
            PollOutcome::Success { attempts, .. } => {
                debug!("Device {} reachable after {} poll(s)", device_no, attempts);
                Ok(Reachability::Online)
            }
            PollOutcome::Abort { .. } => {
                warn!("Device {} is under maintenance", device_no);
                Err(BridgeError::UnderMaintenance { device_no })
            }
            PollOutcome::Exhausted { attempts, .. } => {
                info!("Device {} unreachable after {} poll(s)", device_no, attempts);
                let mac = last_mac.ok_or_else(|| {
                    BridgeError::InvalidAddress(format!("no BLE address reported for {device_no}"))
                })?;
                Ok(Reachability::Offline { mac })
            }
        }
    }

    async fn settle_order<C>(&self, order_id: &str, decide: C) -> Result<OrderState>
    where
        C: FnMut(&OrderState) -> PollDecision + Send,
    {
        let policy = self.config.consumption.order_policy();
        let outcome = poll_until(
            &policy,
            self.clock.as_ref(),
            |_| {
                let api = Arc::clone(&self.api);
                let order_id = order_id.to_string();
                async move { api.order_status(&order_id).await }
            },
            decide,
        )
        .await?;

        match outcome {
            PollOutcome::Success { value, .. } => Ok(value),
            PollOutcome::Abort { value, .. } => Err(BridgeError::OrderFailed {
                order_id: order_id.to_string(),
                state: value.to_string(),
            }),
            PollOutcome::Exhausted { attempts, .. } => Err(BridgeError::OrderNotSettled {
                order_id: order_id.to_string(),
                attempts,
            }),
        }
    }

    /// Scan until the module at `address` shows up
    async fn locate(&self, address: &str) -> Result<PeripheralHandle> {
        let mut found = None;
        let scan = self
            .transport
            .scan(self.config.transport.scan_timeout(), |handle| {
                if handle.matches_address(address) {
                    found = Some(handle.clone());
                    ScanControl::Stop
                } else {
                    ScanControl::Continue
                }
            })
            .await;

        match scan {
            Ok(_) | Err(BridgeError::ScanTimeout { .. }) => {}
            Err(e) => return Err(e),
        }

        // Unnamed modules never reach the scan callback but are still cached
        match found {
            Some(peripheral) => Ok(peripheral),
            None => self
                .transport
                .known_peripheral(address)
                .await
                .ok_or_else(|| BridgeError::DeviceNotFound(address.to_string())),
        }
    }

    async fn connect_module(&self, raw_mac: &str) -> Result<(PeripheralHandle, ServiceProfile)> {
        self.lifecycle.initialize().await.into_result()?;

        let address = mac_to_address(raw_mac)?;
        let peripheral = self.locate(&address).await?;
        let discovered = self
            .transport
            .connect(&peripheral.id, self.config.transport.connect_timeout())
            .await?;

        let profile = ServiceProfile::resolve(&discovered.services);
        if !profile.supported_by(&discovered) {
            warn!(
                "Module {} lacks a usable variant {} write/notify pair",
                peripheral.id, profile.variant
            );
            if let Err(e) = self.transport.disconnect(&peripheral.id).await {
                debug!("Disconnect of unsupported module failed: {}", e);
            }
            return Err(BridgeError::ServiceDiscoveryFailed(format!(
                "variant {} characteristics missing or lacking write/notify support",
                profile.variant
            )));
        }

        info!(
            "Module {} resolved as variant {}",
            peripheral.id, profile.variant
        );
        Ok((discovered.peripheral, profile))
    }

    async fn ble_handshake(
        &self,
        device_no: &str,
        raw_mac: &str,
        purpose: HandshakePurpose,
    ) -> Result<Packet> {
        let (peripheral, profile) = self.connect_module(raw_mac).await?;
        let result = self
            .exchange(device_no, &peripheral.id, &profile, purpose)
            .await;

        if let Err(e) = self.transport.disconnect(&peripheral.id).await {
            debug!("Disconnect after handshake failed: {}", e);
        }
        result
    }

    async fn exchange(
        &self,
        device_no: &str,
        peripheral_id: &str,
        profile: &ServiceProfile,
        purpose: HandshakePurpose,
    ) -> Result<Packet> {
        let limit = self.config.consumption.max_pending_notices;
        let mut frames = self.listen(profile).await?;
        let mut ack: Option<String> = None;
        let mut delivered = 0;

        while let Some(notice) = self.api.pending_notice(device_no, ack.as_deref()).await? {
            if delivered >= limit {
                return Err(BridgeError::NoticeLimitExceeded { limit });
            }
            self.write_payload(profile, &notice).await?;
            let reply = self.await_frame(&mut frames).await?;
            debug!("Notice {} acknowledged with {}", delivered + 1, reply);
            ack = Some(reply.to_hex());
            delivered += 1;
        }
        if delivered > 0 {
            info!("Delivered {} pending notice(s) to {}", delivered, peripheral_id);
        }

        self.transport.unsubscribe_all(peripheral_id).await;
        let mut frames = self.listen(profile).await?;

        let challenge = self.api.random_challenge(device_no, purpose).await?;
        self.write_payload(profile, &challenge).await?;
        let response = self.await_frame(&mut frames).await?;

        self.transport.unsubscribe_all(peripheral_id).await;
        info!("{} handshake with {} completed", purpose, peripheral_id);
        Ok(response)
    }

    async fn listen(&self, profile: &ServiceProfile) -> Result<mpsc::UnboundedReceiver<Packet>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.transport
            .subscribe(profile.service, profile.notify, move |packet| {
                let _ = tx.send(packet);
            })
            .await?;
        Ok(rx)
    }

    async fn await_frame(&self, frames: &mut mpsc::UnboundedReceiver<Packet>) -> Result<Packet> {
        let wait = self.config.consumption.ack_timeout();
        match timeout(wait, frames.recv()).await {
            Ok(Some(packet)) => Ok(packet),
            Ok(None) => Err(BridgeError::NotConnected),
            Err(_) => Err(BridgeError::AckTimeout {
                timeout_ms: self.config.consumption.ack_timeout_ms,
            }),
        }
    }

    /// Encode `payload` (hex, base64 or text) and write it to the module
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotConnected`] without a connected module, or
    /// the transport's write error.
    pub async fn write_payload(&self, profile: &ServiceProfile, payload: &str) -> Result<usize> {
        let bytes = encode_payload(payload);
        self.transport
            .write_chunked(
                profile.service,
                profile.write,
                &bytes,
                &self.config.transport.chunk_policy(),
            )
            .await
    }

    /// Find the module with MAC `mac_hex`, connect and forward its packets
    /// to `on_packet`
    ///
    /// # Errors
    ///
    /// Returns readiness errors ([`BridgeError::PermissionDenied`],
    /// [`BridgeError::AdapterOff`]), [`BridgeError::InvalidAddress`],
    /// [`BridgeError::DeviceNotFound`] or connection errors. A module whose
    /// triad cannot be written without response or subscribed to fails with
    /// [`BridgeError::ServiceDiscoveryFailed`]. Both that and a failed
    /// subscription disconnect the module again.
    pub async fn scan_and_connect<F>(&self, mac_hex: &str, on_packet: F) -> Result<ConnectedModule>
    where
        F: Fn(Packet) + Send + Sync + 'static,
    {
        let (peripheral, profile) = self.connect_module(mac_hex).await?;

        match self
            .transport
            .subscribe(profile.service, profile.notify, on_packet)
            .await
        {
            Ok(listener) => Ok(ConnectedModule {
                peripheral,
                profile,
                listener,
            }),
            Err(e) => {
                if let Err(disconnect_error) = self.transport.disconnect(&peripheral.id).await {
                    debug!("Disconnect after failed subscribe failed: {}", disconnect_error);
                }
                Err(e)
            }
        }
    }

    /// Tear down all BLE state; never fails
    pub async fn destroy(&self) {
        self.lifecycle.destroy(true).await;
    }

    /// App moved to the background
    pub async fn on_background(&self) -> bool {
        self.lifecycle.on_background().await
    }

    /// App returned to the foreground
    pub fn on_foreground(&self) -> bool {
        self.lifecycle.on_foreground()
    }
}
