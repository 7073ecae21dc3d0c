//! BLE central client
//!
//! A single state machine drives the whole GATT notify handshake:
//!
//! ```text
//! Idle ──scan──▶ Scanning ──first result──▶ Connecting ──connected──▶ ServiceDiscovery
//!                                                                        │
//!        Disconnected ◀──disconnected (any state)──  Subscribed ◀──services found
//! ```
//!
//! Events are consumed one at a time from a single queue, so no handler ever
//! overlaps another.

use log::{debug, error, info, warn};

use receptor_proto::ble::{
    CLIENT_CONFIG_DESCRIPTOR_UUID, SERVICE_UUID, VALUE_CHARACTERISTIC_UUID, client_config,
};
use receptor_proto::decode_value;

use crate::backend::{Backend, ScanRequest};
use crate::config::ClientConfig;
use crate::display::DisplayHandle;
use crate::event::{Event, EventReceiver, GattService, GattStatus, LinkState, find_service};
use crate::permission::{
    Capability, PermissionGate, denied, missing_capabilities, required_capabilities,
};
use crate::ClientError;

/// Status line texts
pub mod status {
    pub fn searching(label: &str) -> String {
        format!("Searching for '{label}'...")
    }

    pub fn error(err: &crate::ClientError) -> String {
        format!("Error: {err}")
    }

    pub const CONNECTING: &str = "Connecting to device...";
    pub const DISCOVERING: &str = "Connected! Discovering services...";
    pub const READY: &str = "Connected and ready to receive data!";
    pub const DISCONNECTED: &str = "Disconnected.";
    pub const SCAN_ERROR: &str = "Error while scanning for devices.";
}

/// Transient notice texts
pub mod notice {
    pub const PERMISSIONS_REQUIRED: &str = "Bluetooth permissions are required to use the app.";
    pub const BLUETOOTH_OFF: &str = "Bluetooth is not enabled.";
    pub const ENABLE_BLUETOOTH: &str = "Please enable Bluetooth.";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    ServiceDiscovery,
    Subscribed,
    Disconnected,
}

pub struct Client<B: Backend, P: PermissionGate> {
    backend: B,
    permissions: P,
    display: DisplayHandle,
    config: ClientConfig,
    state: ConnectionState,
    /// The only connection handle; `Some` from connect request until release
    handle: Option<B::Handle>,
    /// Capabilities asked for and not answered yet
    pending_capabilities: Option<Vec<Capability>>,
}

impl<B: Backend, P: PermissionGate> Client<B, P> {
    pub fn new(backend: B, permissions: P, display: DisplayHandle, config: ClientConfig) -> Self {
        Self {
            backend,
            permissions,
            display,
            config,
            state: ConnectionState::Idle,
            handle: None,
            pending_capabilities: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a connection handle is currently held
    pub fn has_connection(&self) -> bool {
        self.handle.is_some()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn permissions(&self) -> &P {
        &self.permissions
    }

    /// Give the backend back, e.g. to shut it down after `run`
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Consume events until `Stopped` is handled or every sender is dropped
    pub async fn run(mut self, mut events: EventReceiver<B::Device>) -> Self {
        while let Some(event) = events.recv().await {
            let stopped = matches!(event, Event::Stopped);
            self.handle(event);
            if stopped {
                break;
            }
        }
        self
    }

    /// Handle one event to completion
    pub fn handle(&mut self, event: Event<B::Device>) {
        match event {
            Event::ScanRequested => self.request_scan(),
            Event::PermissionsResolved(results) => self.on_permissions(&results),
            Event::Resumed => self.on_resumed(),
            Event::Stopped => self.teardown(),
            Event::ScanResult(device) => self.on_scan_result(device),
            Event::ScanFailed { code } => self.on_scan_failed(code),
            Event::ConnectionStateChanged { status: result, state } => {
                self.on_connection_state(result, state)
            }
            Event::ServicesDiscovered { status: result, services } => {
                self.on_services_discovered(result, &services)
            }
            Event::DescriptorWritten { descriptor, status: result } => {
                if result.is_success() {
                    debug!("descriptor {descriptor} written");
                } else {
                    warn!("descriptor {descriptor} write failed: {result:?}");
                }
            }
            Event::CharacteristicChanged { characteristic, value } => {
                self.on_value(characteristic, &value)
            }
        }
    }

    fn session_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Scanning
                | ConnectionState::Connecting
                | ConnectionState::ServiceDiscovery
                | ConnectionState::Subscribed
        )
    }

    /// Scan control: make sure capabilities are held, then scan
    fn request_scan(&mut self) {
        if self.session_active() {
            debug!("scan requested while {:?}, ignoring", self.state);
            return;
        }
        if self.pending_capabilities.is_some() {
            debug!("scan requested while waiting for permissions, ignoring");
            return;
        }

        let required = required_capabilities(self.config.api_level);
        let missing = missing_capabilities(&self.permissions, required);
        if missing.is_empty() {
            self.start_scan();
        } else {
            info!("requesting capabilities {missing:?}");
            self.pending_capabilities = Some(missing.clone());
            self.permissions.request(missing);
        }
    }

    fn on_permissions(&mut self, results: &[(Capability, bool)]) {
        let Some(requested) = self.pending_capabilities.take() else {
            debug!("unsolicited permission answer, ignoring");
            return;
        };

        let mut refused = denied(results);
        for capability in requested {
            let answered = results.iter().any(|(c, _)| *c == capability);
            if !answered && !refused.contains(&capability) {
                refused.push(capability);
            }
        }

        if refused.is_empty() {
            self.start_scan();
        } else {
            warn!("{}", ClientError::PermissionDenied(refused));
            self.display.notify(notice::PERMISSIONS_REQUIRED);
        }
    }

    fn start_scan(&mut self) {
        if !self.backend.is_enabled() {
            warn!("{}", ClientError::BluetoothDisabled);
            self.display.notify(notice::BLUETOOTH_OFF);
            return;
        }

        let request = ScanRequest {
            service: SERVICE_UUID,
            mode: self.config.scan_mode,
        };
        info!("scanning for service {}", request.service);
        self.display.set_status(status::searching(&self.config.peripheral_label));
        self.state = ConnectionState::Scanning;
        self.backend.start_scan(&request);
    }

    /// Cancel discovery; does nothing unless a scan is running
    pub fn stop_scan(&mut self) {
        if self.state == ConnectionState::Scanning {
            self.backend.stop_scan();
            self.state = ConnectionState::Idle;
        }
    }

    fn on_scan_result(&mut self, device: B::Device) {
        if self.state != ConnectionState::Scanning {
            debug!("ignoring scan result {device:?} while {:?}", self.state);
            return;
        }

        debug!("device found: {device:?}");
        // only the first match is ever connected
        self.stop_scan();
        self.connect(device);
    }

    fn on_scan_failed(&mut self, code: i32) {
        if self.state != ConnectionState::Scanning {
            debug!("scan failure {code} while {:?}, ignoring", self.state);
            return;
        }

        error!("{}", ClientError::ScanFailure { code });
        self.state = ConnectionState::Idle;
        self.display.set_status(status::SCAN_ERROR);
    }

    fn connect(&mut self, device: B::Device) {
        self.release_connection();

        info!("connecting to {device:?}");
        self.display.set_status(status::CONNECTING);
        self.handle = Some(self.backend.connect(&device));
        self.state = ConnectionState::Connecting;
    }

    fn on_connection_state(&mut self, result: GattStatus, link: LinkState) {
        match link {
            LinkState::Connected => {
                if self.state != ConnectionState::Connecting {
                    debug!("connected event while {:?}, ignoring", self.state);
                    return;
                }
                let Some(handle) = self.handle.as_mut() else {
                    return;
                };

                info!("connected, discovering services");
                self.state = ConnectionState::ServiceDiscovery;
                self.display.set_status(status::DISCOVERING);
                self.backend.discover_services(handle);
            }
            LinkState::Disconnected => {
                if !result.is_success() {
                    warn!("link closed with status {result:?}");
                }
                self.on_disconnected();
            }
            LinkState::Connecting | LinkState::Disconnecting => {
                debug!("link {link:?}");
            }
        }
    }

    fn on_disconnected(&mut self) {
        let connected_state = matches!(
            self.state,
            ConnectionState::Connecting
                | ConnectionState::ServiceDiscovery
                | ConnectionState::Subscribed
        );
        if !connected_state && self.handle.is_none() {
            debug!("disconnected event while {:?}, nothing to release", self.state);
            return;
        }

        info!("{}", ClientError::Disconnected);
        self.release_connection();
        self.state = ConnectionState::Disconnected;
        self.display.set_status(status::DISCONNECTED);
    }

    fn on_services_discovered(&mut self, result: GattStatus, services: &[GattService]) {
        if self.state != ConnectionState::ServiceDiscovery {
            debug!("discovery result while {:?}, ignoring", self.state);
            return;
        }

        match self.subscribe(result, services) {
            Ok(()) => {
                info!("subscribed to {VALUE_CHARACTERISTIC_UUID}");
                self.state = ConnectionState::Subscribed;
                self.display.set_status(status::READY);
            }
            Err(err) => {
                error!("subscription failed: {err}");
                self.release_connection();
                self.state = ConnectionState::Disconnected;
                self.display.set_status(status::error(&err));
            }
        }
    }

    /// Enable notifications on the value characteristic
    fn subscribe(
        &mut self,
        result: GattStatus,
        services: &[GattService],
    ) -> Result<(), ClientError> {
        if let GattStatus::Failure(code) = result {
            return Err(ClientError::DiscoveryFailed(code));
        }

        let service =
            find_service(services, SERVICE_UUID).ok_or(ClientError::ServiceMissing(SERVICE_UUID))?;
        let characteristic = service
            .characteristic(VALUE_CHARACTERISTIC_UUID)
            .ok_or(ClientError::CharacteristicMissing(VALUE_CHARACTERISTIC_UUID))?;
        if !characteristic.has_descriptor(CLIENT_CONFIG_DESCRIPTOR_UUID) {
            return Err(ClientError::DescriptorMissing(CLIENT_CONFIG_DESCRIPTOR_UUID));
        }

        let handle = self.handle.as_mut().ok_or(ClientError::Disconnected)?;
        if !self.backend.set_notify(handle, characteristic) {
            warn!("local notification delivery not enabled");
        }
        if !self.backend.write_descriptor(
            handle,
            characteristic,
            CLIENT_CONFIG_DESCRIPTOR_UUID,
            &client_config::ENABLE_NOTIFICATION,
        ) {
            warn!("notification descriptor write not issued");
        }
        Ok(())
    }

    fn on_value(&mut self, characteristic: uuid::Uuid, value: &[u8]) {
        if characteristic != VALUE_CHARACTERISTIC_UUID {
            debug!("value from unknown characteristic {characteristic}");
            return;
        }
        if self.handle.is_none() {
            debug!("value after release, ignoring");
            return;
        }

        let text = decode_value(value);
        debug!("value received: {text}");
        self.display.set_value(text);
    }

    fn on_resumed(&mut self) {
        if !self.backend.is_enabled() {
            self.display.notify(notice::ENABLE_BLUETOOTH);
        }
    }

    /// Stop scanning and drop the connection, without touching the status
    fn teardown(&mut self) {
        info!("stopping client");
        self.stop_scan();
        self.release_connection();
        self.pending_capabilities = None;
        self.state = ConnectionState::Idle;
    }

    fn release_connection(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            debug!("releasing {handle:?}");
            self.backend.disconnect(&mut handle);
            self.backend.close(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::display::DisplayCommand;
    use crate::event::GattCharacteristic;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        StartScan(ScanRequest),
        StopScan,
        Connect(u32),
        Discover(u32),
        SetNotify(Uuid),
        WriteDescriptor(Uuid, Vec<u8>),
        Disconnect(u32),
        Close(u32),
    }

    #[derive(Debug)]
    struct FakeHandle(u32);

    struct FakeBackend {
        enabled: bool,
        calls: Vec<Call>,
    }

    impl FakeBackend {
        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| pred(c)).count()
        }
    }

    impl Backend for FakeBackend {
        type Device = u32;
        type Handle = FakeHandle;

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn start_scan(&mut self, request: &ScanRequest) {
            self.calls.push(Call::StartScan(request.clone()));
        }

        fn stop_scan(&mut self) {
            self.calls.push(Call::StopScan);
        }

        fn connect(&mut self, device: &u32) -> FakeHandle {
            self.calls.push(Call::Connect(*device));
            FakeHandle(*device)
        }

        fn discover_services(&mut self, handle: &mut FakeHandle) {
            self.calls.push(Call::Discover(handle.0));
        }

        fn set_notify(
            &mut self,
            _handle: &mut FakeHandle,
            characteristic: &GattCharacteristic,
        ) -> bool {
            self.calls.push(Call::SetNotify(characteristic.uuid));
            true
        }

        fn write_descriptor(
            &mut self,
            _handle: &mut FakeHandle,
            _characteristic: &GattCharacteristic,
            descriptor: Uuid,
            value: &[u8],
        ) -> bool {
            self.calls.push(Call::WriteDescriptor(descriptor, value.to_vec()));
            true
        }

        fn disconnect(&mut self, handle: &mut FakeHandle) {
            self.calls.push(Call::Disconnect(handle.0));
        }

        fn close(&mut self, handle: FakeHandle) {
            self.calls.push(Call::Close(handle.0));
        }
    }

    struct FakePermissions {
        held: Vec<Capability>,
        requests: Vec<Vec<Capability>>,
    }

    impl PermissionGate for FakePermissions {
        fn is_granted(&self, capability: Capability) -> bool {
            self.held.contains(&capability)
        }

        fn request(&mut self, capabilities: Vec<Capability>) {
            self.requests.push(capabilities);
        }
    }

    type TestClient = Client<FakeBackend, FakePermissions>;

    fn client_with(
        enabled: bool,
        held: Vec<Capability>,
        api_level: u32,
    ) -> (TestClient, mpsc::UnboundedReceiver<DisplayCommand>) {
        let (display, rx) = DisplayHandle::channel();
        let config = ClientConfig {
            api_level,
            ..ClientConfig::default()
        };
        let client = Client::new(
            FakeBackend { enabled, calls: vec![] },
            FakePermissions { held, requests: vec![] },
            display,
            config,
        );
        (client, rx)
    }

    fn client() -> (TestClient, mpsc::UnboundedReceiver<DisplayCommand>) {
        client_with(
            true,
            vec![Capability::BluetoothScan, Capability::BluetoothConnect],
            31,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DisplayCommand>) -> Vec<DisplayCommand> {
        let mut out = vec![];
        while let Ok(command) = rx.try_recv() {
            out.push(command);
        }
        out
    }

    fn value_characteristic(descriptors: Vec<Uuid>) -> GattCharacteristic {
        GattCharacteristic {
            uuid: VALUE_CHARACTERISTIC_UUID,
            service_uuid: SERVICE_UUID,
            descriptors,
        }
    }

    fn receptor_services() -> Vec<GattService> {
        vec![
            GattService {
                uuid: Uuid::from_u128(0x1800),
                characteristics: vec![],
            },
            GattService {
                uuid: SERVICE_UUID,
                characteristics: vec![value_characteristic(vec![CLIENT_CONFIG_DESCRIPTOR_UUID])],
            },
        ]
    }

    fn connected() -> Event<u32> {
        Event::ConnectionStateChanged {
            status: GattStatus::Success,
            state: LinkState::Connected,
        }
    }

    fn disconnected() -> Event<u32> {
        Event::ConnectionStateChanged {
            status: GattStatus::Success,
            state: LinkState::Disconnected,
        }
    }

    fn discovered(services: Vec<GattService>) -> Event<u32> {
        Event::ServicesDiscovered {
            status: GattStatus::Success,
            services,
        }
    }

    fn value(text: &str) -> Event<u32> {
        Event::CharacteristicChanged {
            characteristic: VALUE_CHARACTERISTIC_UUID,
            value: text.as_bytes().to_vec(),
        }
    }

    fn subscribed_client() -> (TestClient, mpsc::UnboundedReceiver<DisplayCommand>) {
        let (mut client, rx) = client();
        client.handle(Event::ScanRequested);
        client.handle(Event::ScanResult(7));
        client.handle(connected());
        client.handle(discovered(receptor_services()));
        assert_eq!(client.state(), ConnectionState::Subscribed);
        (client, rx)
    }

    #[test]
    fn scan_starts_with_service_filter_and_low_latency() {
        let (mut client, mut rx) = client();
        client.handle(Event::ScanRequested);

        assert_eq!(client.state(), ConnectionState::Scanning);
        assert_eq!(
            client.backend().calls,
            vec![Call::StartScan(ScanRequest {
                service: SERVICE_UUID,
                mode: crate::config::ScanMode::LowLatency,
            })]
        );
        assert_eq!(
            drain(&mut rx),
            vec![DisplayCommand::Status("Searching for 'ESP32'...".to_string())]
        );
    }

    #[test]
    fn scan_starts_only_when_every_capability_is_granted() {
        for scan in [true, false] {
            for connect in [true, false] {
                let (mut client, _rx) = client_with(true, vec![], 31);
                client.handle(Event::ScanRequested);
                assert_eq!(
                    client.permissions().requests,
                    vec![vec![Capability::BluetoothScan, Capability::BluetoothConnect]]
                );
                assert!(client.backend().calls.is_empty());

                client.handle(Event::PermissionsResolved(vec![
                    (Capability::BluetoothScan, scan),
                    (Capability::BluetoothConnect, connect),
                ]));

                let started = client
                    .backend()
                    .count(|c| matches!(c, Call::StartScan(_)));
                assert_eq!(started == 1, scan && connect, "scan={scan} connect={connect}");
            }
        }
    }

    #[test]
    fn denied_permission_shows_notice() {
        let (mut client, mut rx) = client_with(true, vec![Capability::BluetoothScan], 31);
        client.handle(Event::ScanRequested);
        assert_eq!(
            client.permissions().requests,
            vec![vec![Capability::BluetoothConnect]]
        );

        client.handle(Event::PermissionsResolved(vec![(Capability::BluetoothConnect, false)]));
        assert_eq!(client.state(), ConnectionState::Idle);
        assert_eq!(
            drain(&mut rx),
            vec![DisplayCommand::Notice(notice::PERMISSIONS_REQUIRED.to_string())]
        );
    }

    #[test]
    fn unanswered_capability_counts_as_denied() {
        let (mut client, _rx) = client_with(true, vec![], 31);
        client.handle(Event::ScanRequested);
        client.handle(Event::PermissionsResolved(vec![(Capability::BluetoothScan, true)]));
        assert!(client.backend().calls.is_empty());
    }

    #[test]
    fn legacy_level_asks_for_location() {
        let (mut client, _rx) = client_with(true, vec![], 30);
        client.handle(Event::ScanRequested);
        assert_eq!(
            client.permissions().requests,
            vec![vec![Capability::FineLocation]]
        );

        client.handle(Event::PermissionsResolved(vec![(Capability::FineLocation, true)]));
        assert_eq!(client.state(), ConnectionState::Scanning);
    }

    #[test]
    fn unsolicited_permission_answer_does_not_scan() {
        let (mut client, _rx) = client();
        client.handle(Event::PermissionsResolved(vec![(Capability::BluetoothScan, true)]));
        assert!(client.backend().calls.is_empty());
    }

    #[test]
    fn disabled_adapter_refuses_scan() {
        let (mut client, mut rx) = client_with(
            false,
            vec![Capability::BluetoothScan, Capability::BluetoothConnect],
            31,
        );
        client.handle(Event::ScanRequested);

        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(client.backend().calls.is_empty());
        assert_eq!(
            drain(&mut rx),
            vec![DisplayCommand::Notice(notice::BLUETOOTH_OFF.to_string())]
        );
    }

    #[test]
    fn resumed_with_disabled_adapter_asks_to_enable() {
        let (mut client, mut rx) = client_with(false, vec![], 31);
        client.handle(Event::Resumed);
        assert_eq!(
            drain(&mut rx),
            vec![DisplayCommand::Notice(notice::ENABLE_BLUETOOTH.to_string())]
        );

        let (mut client, mut rx) = self::client();
        client.handle(Event::Resumed);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn connects_at_most_once_per_scan_session() {
        let (mut client, _rx) = client();
        client.handle(Event::ScanRequested);
        client.handle(Event::ScanResult(1));
        client.handle(Event::ScanResult(2));
        client.handle(Event::ScanResult(1));

        assert_eq!(client.state(), ConnectionState::Connecting);
        assert_eq!(client.backend().count(|c| matches!(c, Call::Connect(_))), 1);
        assert_eq!(client.backend().count(|c| *c == Call::StopScan), 1);
        assert!(client.backend().calls.contains(&Call::Connect(1)));
    }

    #[test]
    fn scan_failure_updates_status_without_retry() {
        let (mut client, mut rx) = client();
        client.handle(Event::ScanRequested);
        drain(&mut rx);

        client.handle(Event::ScanFailed { code: crate::backend::scan_error::INTERNAL_ERROR });
        assert_eq!(client.state(), ConnectionState::Idle);
        assert_eq!(
            drain(&mut rx),
            vec![DisplayCommand::Status(status::SCAN_ERROR.to_string())]
        );
        assert_eq!(client.backend().count(|c| matches!(c, Call::StartScan(_))), 1);
    }

    #[test]
    fn handshake_writes_notification_descriptor_exactly_once() {
        let (client, mut rx) = subscribed_client();

        let calls = &client.backend().calls;
        let writes: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, Call::WriteDescriptor(..)))
            .collect();
        assert_eq!(
            writes,
            vec![&Call::WriteDescriptor(
                CLIENT_CONFIG_DESCRIPTOR_UUID,
                vec![0x01, 0x00]
            )]
        );

        let notify = calls
            .iter()
            .position(|c| *c == Call::SetNotify(VALUE_CHARACTERISTIC_UUID))
            .unwrap();
        let write = calls
            .iter()
            .position(|c| matches!(c, Call::WriteDescriptor(..)))
            .unwrap();
        assert!(notify < write);
        assert!(calls.contains(&Call::Discover(7)));

        let statuses: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|c| match c {
                DisplayCommand::Status(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                "Searching for 'ESP32'...",
                status::CONNECTING,
                status::DISCOVERING,
                status::READY,
            ]
        );
    }

    #[test]
    fn repeated_discovery_result_does_not_write_twice() {
        let (mut client, _rx) = subscribed_client();
        client.handle(discovered(receptor_services()));
        assert_eq!(
            client.backend().count(|c| matches!(c, Call::WriteDescriptor(..))),
            1
        );
    }

    #[test]
    fn missing_characteristic_is_reported_not_stalled() {
        let (mut client, mut rx) = client();
        client.handle(Event::ScanRequested);
        client.handle(Event::ScanResult(3));
        client.handle(connected());
        drain(&mut rx);

        client.handle(discovered(vec![GattService {
            uuid: SERVICE_UUID,
            characteristics: vec![],
        }]));

        assert_eq!(client.backend().count(|c| matches!(c, Call::WriteDescriptor(..))), 0);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.has_connection());
        assert_eq!(
            drain(&mut rx),
            vec![DisplayCommand::Status(status::error(
                &ClientError::CharacteristicMissing(VALUE_CHARACTERISTIC_UUID)
            ))]
        );
    }

    #[test]
    fn missing_service_or_descriptor_or_failed_discovery_never_writes() {
        let cases = vec![
            discovered(vec![]),
            discovered(vec![GattService {
                uuid: SERVICE_UUID,
                characteristics: vec![value_characteristic(vec![])],
            }]),
            Event::ServicesDiscovered {
                status: GattStatus::Failure(129),
                services: receptor_services(),
            },
        ];

        for event in cases {
            let (mut client, _rx) = client();
            client.handle(Event::ScanRequested);
            client.handle(Event::ScanResult(3));
            client.handle(connected());
            client.handle(event);

            assert_eq!(client.backend().count(|c| matches!(c, Call::WriteDescriptor(..))), 0);
            assert_eq!(client.backend().count(|c| matches!(c, Call::SetNotify(_))), 0);
            assert_eq!(client.state(), ConnectionState::Disconnected);
            assert!(!client.has_connection());
        }
    }

    #[test]
    fn displayed_value_is_latest_payload_only() {
        let (mut client, mut rx) = subscribed_client();
        drain(&mut rx);

        for payload in ["1", "2", "3"] {
            client.handle(value(payload));
            assert_eq!(
                drain(&mut rx),
                vec![DisplayCommand::Value(payload.to_string())]
            );
        }
    }

    #[test]
    fn values_from_other_characteristics_are_ignored() {
        let (mut client, mut rx) = subscribed_client();
        drain(&mut rx);

        client.handle(Event::CharacteristicChanged {
            characteristic: Uuid::from_u128(0x2a19),
            value: vec![0x64],
        });
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn malformed_payload_is_shown_with_replacement_chars() {
        let (mut client, mut rx) = subscribed_client();
        drain(&mut rx);

        client.handle(Event::CharacteristicChanged {
            characteristic: VALUE_CHARACTERISTIC_UUID,
            value: vec![b'4', 0xc3],
        });
        assert_eq!(
            drain(&mut rx),
            vec![DisplayCommand::Value("4\u{fffd}".to_string())]
        );
    }

    #[test]
    fn disconnect_in_any_connected_state_releases_handle_and_allows_rescan() {
        let setups: Vec<Vec<Event<u32>>> = vec![
            vec![Event::ScanRequested, Event::ScanResult(5)],
            vec![Event::ScanRequested, Event::ScanResult(5), connected()],
            vec![
                Event::ScanRequested,
                Event::ScanResult(5),
                connected(),
                discovered(receptor_services()),
            ],
        ];

        for setup in setups {
            let (mut client, mut rx) = client();
            for event in setup {
                client.handle(event);
            }
            drain(&mut rx);

            client.handle(disconnected());
            assert_eq!(client.state(), ConnectionState::Disconnected);
            assert!(!client.has_connection());
            assert_eq!(client.backend().count(|c| *c == Call::Disconnect(5)), 1);
            assert_eq!(client.backend().count(|c| *c == Call::Close(5)), 1);
            assert_eq!(
                drain(&mut rx),
                vec![DisplayCommand::Status(status::DISCONNECTED.to_string())]
            );

            // no automatic reconnect
            assert_eq!(client.backend().count(|c| matches!(c, Call::Connect(_))), 1);

            client.handle(Event::ScanRequested);
            client.handle(Event::ScanResult(6));
            assert_eq!(client.state(), ConnectionState::Connecting);
            assert_eq!(client.backend().count(|c| matches!(c, Call::StartScan(_))), 2);
            assert!(client.has_connection());
        }
    }

    #[test]
    fn late_disconnect_after_release_is_harmless() {
        let (mut client, mut rx) = client();
        client.handle(disconnected());
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(drain(&mut rx).is_empty());

        client.handle(Event::ScanRequested);
        client.handle(disconnected());
        assert_eq!(client.state(), ConnectionState::Scanning);
    }

    #[test]
    fn scan_request_during_session_is_ignored() {
        let (mut client, _rx) = subscribed_client();
        client.handle(Event::ScanRequested);
        assert_eq!(client.backend().count(|c| matches!(c, Call::StartScan(_))), 1);
        assert_eq!(client.state(), ConnectionState::Subscribed);
    }

    #[test]
    fn stop_releases_everything_quietly() {
        let (mut client, mut rx) = subscribed_client();
        drain(&mut rx);

        client.handle(Event::Stopped);
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(!client.has_connection());
        assert!(client.backend().calls.ends_with(&[Call::Disconnect(7), Call::Close(7)]));
        assert!(drain(&mut rx).is_empty());

        client.handle(value("9"));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn stop_scan_is_idempotent() {
        let (mut client, _rx) = client();
        client.stop_scan();
        client.handle(Event::ScanRequested);
        client.stop_scan();
        client.stop_scan();
        assert_eq!(client.backend().count(|c| *c == Call::StopScan), 1);
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn run_consumes_queue_until_stopped() {
        let (client, mut rx) = client();
        let (tx, events) = crate::event::channel();

        for event in [
            Event::ScanRequested,
            Event::ScanResult(7),
            connected(),
            discovered(receptor_services()),
            value("1"),
            value("2"),
            Event::Stopped,
            value("3"),
        ] {
            tx.send(event).unwrap();
        }

        let client = client.run(events).await;
        assert_eq!(client.state(), ConnectionState::Idle);

        let values: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|c| match c {
                DisplayCommand::Value(v) => Some(v),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec!["1", "2"]);
    }
}
