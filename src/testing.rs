//! In-memory doubles for the platform, the backend and the clock.

use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    api::DeviceApi,
    error::{BridgeError, Result},
    platform::{
        BlePlatform, CharacteristicInfo, CharacteristicProperties, DiscoveredServices,
        PlatformEvent, EVENT_CHANNEL_CAPACITY,
    },
    profile::ServiceProfile,
    protocol::FrameBuffer,
    retry::Clock,
    types::{
        AdapterState, DeviceReachability, DeviceStatusReport, HandshakePurpose, OrderState,
        OrderTicket, PeripheralHandle, PermissionStatus,
    },
};

/// Address of the module registered by [`MockPlatform::with_module`]
pub const DEVICE_ADDRESS: &str = "A1:B2:C3:D4:E5:F6";

/// Raw MAC of the same module, as the backend reports it
pub const DEVICE_MAC: &str = "a1b2c3d4e5f6";

/// One recorded write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub peripheral: String,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

struct MockState {
    adapter_state: AdapterState,
    permission: PermissionStatus,
    start_calls: u32,
    scan_starts: u32,
    scan_stops: u32,
    advertised: Vec<PeripheralHandle>,
    modules: HashMap<String, Vec<Uuid>>,
    connect_delay: Option<Duration>,
    connect_error: Option<String>,
    discovery_error: Option<String>,
    characteristics: Option<Vec<CharacteristicInfo>>,
    connected: HashSet<String>,
    connects: Vec<String>,
    disconnects: Vec<String>,
    writes: Vec<WriteRecord>,
    written_frames: FrameBuffer,
    replies: VecDeque<Vec<u8>>,
    notifications_started: u32,
    notifications_stopped: u32,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            adapter_state: AdapterState::On,
            permission: PermissionStatus::Granted,
            start_calls: 0,
            scan_starts: 0,
            scan_stops: 0,
            advertised: Vec::new(),
            modules: HashMap::new(),
            connect_delay: None,
            connect_error: None,
            discovery_error: None,
            characteristics: None,
            connected: HashSet::new(),
            connects: Vec::new(),
            disconnects: Vec::new(),
            writes: Vec::new(),
            written_frames: FrameBuffer::new(),
            replies: VecDeque::new(),
            notifications_started: 0,
            notifications_stopped: 0,
        }
    }
}

/// Scriptable [`BlePlatform`]
pub struct MockPlatform {
    events: broadcast::Sender<PlatformEvent>,
    state: Mutex<MockState>,
}

impl MockPlatform {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events,
            state: Mutex::new(MockState::default()),
        }
    }

    /// A platform with one advertising module exposing `service`
    pub fn with_module(service: Uuid) -> Self {
        let platform = Self::new();
        {
            let mut state = platform.state();
            state
                .modules
                .insert(DEVICE_ADDRESS.to_string(), vec![service]);
            state.advertised.push(PeripheralHandle::new(
                DEVICE_ADDRESS,
                Some("WASHER-0042".to_string()),
                -58,
            ));
        }
        platform
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_permission(&self, permission: PermissionStatus) {
        self.state().permission = permission;
    }

    pub fn set_adapter_state(&self, adapter_state: AdapterState) {
        self.state().adapter_state = adapter_state;
    }

    /// Peripherals announced every time a scan starts
    pub fn advertise(&self, peripherals: Vec<PeripheralHandle>) {
        self.state().advertised = peripherals;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = Some(delay);
    }

    pub fn fail_connect(&self, reason: &str) {
        self.state().connect_error = Some(reason.to_string());
    }

    pub fn fail_discovery(&self, reason: &str) {
        self.state().discovery_error = Some(reason.to_string());
    }

    /// Replace the characteristics reported by discovery
    pub fn set_characteristics(&self, characteristics: Vec<CharacteristicInfo>) {
        self.state().characteristics = Some(characteristics);
    }

    /// Frames notified back, one per complete frame written
    pub fn script_replies(&self, replies: Vec<Vec<u8>>) {
        self.state().replies = replies.into();
    }

    /// Simulate the link dropping without a disconnect call
    pub fn drop_link(&self, id: &str) {
        self.state().connected.remove(&id.to_ascii_uppercase());
    }

    pub fn emit(&self, event: PlatformEvent) {
        let _ = self.events.send(event);
    }

    pub fn notify(&self, id: &str, service: Uuid, characteristic: Uuid, value: &[u8]) {
        self.emit(PlatformEvent::Notification {
            peripheral: id.to_string(),
            service,
            characteristic,
            value: value.to_vec(),
        });
    }

    pub fn start_calls(&self) -> u32 {
        self.state().start_calls
    }

    pub fn scan_starts(&self) -> u32 {
        self.state().scan_starts
    }

    pub fn scan_stops(&self) -> u32 {
        self.state().scan_stops
    }

    pub fn connects(&self) -> Vec<String> {
        self.state().connects.clone()
    }

    pub fn disconnects(&self) -> Vec<String> {
        self.state().disconnects.clone()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().writes.clone()
    }

    pub fn notifications_started(&self) -> u32 {
        self.state().notifications_started
    }

    pub fn notifications_stopped(&self) -> u32 {
        self.state().notifications_stopped
    }

    pub fn is_linked(&self, id: &str) -> bool {
        self.state().connected.contains(&id.to_ascii_uppercase())
    }
}

#[async_trait]
impl BlePlatform for MockPlatform {
    async fn start(&self) -> Result<()> {
        self.state().start_calls += 1;
        Ok(())
    }

    async fn adapter_state(&self) -> Result<AdapterState> {
        Ok(self.state().adapter_state)
    }

    async fn request_permissions(&self) -> Result<PermissionStatus> {
        Ok(self.state().permission)
    }

    async fn enable_radio(&self) -> Result<bool> {
        Ok(self.state().adapter_state == AdapterState::On)
    }

    fn events(&self) -> broadcast::Receiver<PlatformEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self, _duration: Duration) -> Result<()> {
        let advertised = {
            let mut state = self.state();
            state.scan_starts += 1;
            state.advertised.clone()
        };
        for peripheral in advertised {
            self.emit(PlatformEvent::Discovered(peripheral));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.state().scan_stops += 1;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<()> {
        let (delay, error) = {
            let mut state = self.state();
            state.connects.push(id.to_string());
            (state.connect_delay, state.connect_error.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = error {
            return Err(BridgeError::Platform(error));
        }
        self.state().connected.insert(id.to_ascii_uppercase());
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.disconnects.push(id.to_string());
        state.connected.remove(&id.to_ascii_uppercase());
        Ok(())
    }

    async fn discover_services(&self, id: &str) -> Result<DiscoveredServices> {
        let state = self.state();
        if let Some(error) = &state.discovery_error {
            return Err(BridgeError::Platform(error.clone()));
        }
        let services = state
            .modules
            .get(&id.to_ascii_uppercase())
            .cloned()
            .ok_or_else(|| BridgeError::DeviceNotFound(id.to_string()))?;

        let characteristics = state
            .characteristics
            .clone()
            .unwrap_or_else(|| module_characteristics(&services));

        Ok(DiscoveredServices {
            peripheral: PeripheralHandle::new(id, None, -58),
            services,
            characteristics,
        })
    }

    async fn connected_peripherals(&self, _services: &[Uuid]) -> Result<Vec<PeripheralHandle>> {
        Ok(self
            .state()
            .connected
            .iter()
            .map(|id| PeripheralHandle::new(id.clone(), None, 0))
            .collect())
    }

    async fn is_connected(&self, id: &str) -> Result<bool> {
        Ok(self.is_linked(id))
    }

    async fn write_without_response(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let (replies, profile) = {
            let mut state = self.state();
            if !state.connected.contains(&id.to_ascii_uppercase()) {
                return Err(BridgeError::NotConnected);
            }
            state.writes.push(WriteRecord {
                peripheral: id.to_string(),
                service,
                characteristic,
                value: value.to_vec(),
            });

            let completed = state.written_frames.push(value).len();
            let mut replies = Vec::new();
            for _ in 0..completed {
                if let Some(reply) = state.replies.pop_front() {
                    replies.push(reply);
                }
            }
            let services = state
                .modules
                .get(&id.to_ascii_uppercase())
                .cloned()
                .unwrap_or_default();
            (replies, ServiceProfile::resolve(&services))
        };

        for reply in replies {
            self.notify(id, profile.service, profile.notify, &reply);
        }
        Ok(())
    }

    async fn read(&self, id: &str, _service: Uuid, _characteristic: Uuid) -> Result<Vec<u8>> {
        if !self.is_linked(id) {
            return Err(BridgeError::NotConnected);
        }
        Ok(vec![0x01])
    }

    async fn start_notification(
        &self,
        id: &str,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<()> {
        let mut state = self.state();
        if !state.connected.contains(&id.to_ascii_uppercase()) {
            return Err(BridgeError::NotConnected);
        }
        state.notifications_started += 1;
        Ok(())
    }

    async fn stop_notification(
        &self,
        _id: &str,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<()> {
        self.state().notifications_stopped += 1;
        Ok(())
    }
}

/// Device name (readable) plus the resolved triad's write and notify
/// characteristics
pub fn module_characteristics(services: &[Uuid]) -> Vec<CharacteristicInfo> {
    let profile = ServiceProfile::resolve(services);
    vec![
        CharacteristicInfo {
            service: Uuid::from_u128(0x0000_1800_0000_1000_8000_0080_5F9B_34FB),
            uuid: Uuid::from_u128(0x0000_2A00_0000_1000_8000_0080_5F9B_34FB),
            properties: CharacteristicProperties {
                read: true,
                ..CharacteristicProperties::default()
            },
        },
        CharacteristicInfo {
            service: profile.service,
            uuid: profile.notify,
            properties: CharacteristicProperties {
                notify: true,
                ..CharacteristicProperties::default()
            },
        },
        CharacteristicInfo {
            service: profile.service,
            uuid: profile.write,
            properties: CharacteristicProperties {
                write: true,
                write_without_response: true,
                ..CharacteristicProperties::default()
            },
        },
    ]
}

/// Status report for the mock module
pub fn status(state: DeviceReachability) -> DeviceStatusReport {
    DeviceStatusReport {
        state,
        mac: Some(DEVICE_MAC.to_string()),
    }
}

#[derive(Default)]
struct MockApiState {
    statuses: VecDeque<DeviceStatusReport>,
    order_states: VecDeque<OrderState>,
    order_queries: Vec<String>,
    notices: VecDeque<String>,
    acks: Vec<Option<String>>,
    challenge: String,
    status_error: bool,
    calls: Vec<String>,
}

/// Scriptable [`DeviceApi`]
///
/// The last scripted status and order state repeat once the queues run dry.
#[derive(Default)]
pub struct MockApi {
    state: Mutex<MockApiState>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockApiState> {
        self.state.lock().unwrap()
    }

    pub fn with_statuses(self, statuses: Vec<DeviceStatusReport>) -> Self {
        self.state().statuses = statuses.into();
        self
    }

    pub fn with_order_states(self, states: Vec<OrderState>) -> Self {
        self.state().order_states = states.into();
        self
    }

    pub fn with_notices(self, notices: Vec<&str>) -> Self {
        self.state().notices = notices.into_iter().map(str::to_string).collect();
        self
    }

    pub fn with_challenge(self, challenge: &str) -> Self {
        self.state().challenge = challenge.to_string();
        self
    }

    /// Fail every status query with an I/O error
    pub fn with_status_errors(self) -> Self {
        self.state().status_error = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state().calls.iter().filter(|c| c.as_str() == call).count()
    }

    /// Order ids passed to `order_status`, in call order
    pub fn order_queries(&self) -> Vec<String> {
        self.state().order_queries.clone()
    }

    pub fn acks(&self) -> Vec<Option<String>> {
        self.state().acks.clone()
    }

    fn record(&self, call: &str) -> MutexGuard<'_, MockApiState> {
        let mut state = self.state();
        state.calls.push(call.to_string());
        state
    }
}

fn next_repeating<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

#[async_trait]
impl DeviceApi for MockApi {
    async fn device_status(&self, _device_no: &str) -> Result<DeviceStatusReport> {
        let mut state = self.record("device_status");
        if state.status_error {
            return Err(BridgeError::Io(std::io::Error::other("modem gateway unreachable")));
        }
        next_repeating(&mut state.statuses).ok_or_else(|| BridgeError::Business {
            code: 500,
            message: "no status scripted".to_string(),
        })
    }

    async fn start_consumption(&self, device_no: &str) -> Result<OrderTicket> {
        self.record("start_consumption");
        Ok(OrderTicket {
            order_id: format!("ORD-{device_no}"),
        })
    }

    async fn stop_consumption(
        &self,
        device_no: &str,
        _order_id: Option<&str>,
    ) -> Result<OrderTicket> {
        self.record("stop_consumption");
        Ok(OrderTicket {
            order_id: format!("STOP-{device_no}"),
        })
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderState> {
        let mut state = self.record("order_status");
        state.order_queries.push(order_id.to_string());
        Ok(next_repeating(&mut state.order_states).unwrap_or(OrderState::Pending))
    }

    async fn pending_notice(&self, _device_no: &str, ack: Option<&str>) -> Result<Option<String>> {
        let mut state = self.record("pending_notice");
        state.acks.push(ack.map(str::to_string));
        Ok(state.notices.pop_front())
    }

    async fn random_challenge(
        &self,
        _device_no: &str,
        purpose: HandshakePurpose,
    ) -> Result<String> {
        let state = self.record(&format!("random_challenge:{purpose}"));
        Ok(state.challenge.clone())
    }
}

/// [`Clock`] that records requested sleeps and returns at once
#[derive(Default)]
pub struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}
