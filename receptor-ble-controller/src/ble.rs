//! btleplug backend
//!
//! Bridges btleplug's async API to the fire-and-forget [`Backend`] requests.
//! One pump task follows the adapter's event stream (scan results, power
//! state, disconnections); each request spawns a task that posts its outcome
//! to the client's event queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, Service,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{Stream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use receptor_proto::ble::SERVICE_UUID;

use crate::backend::{Backend, ScanRequest, scan_error};
use crate::config::ScanMode;
use crate::event::{Event, EventSender, GattCharacteristic, GattService, GattStatus, LinkState};
use crate::ClientError;

/// Generic GATT failure status, as the platform stacks report it
pub const GATT_FAILURE: i32 = 0x101;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A device advertising the receptor service
#[derive(Debug, Clone)]
pub struct ReceptorDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
}

/// Get the Bluetooth adapter at `index`
pub async fn get_adapter(index: usize) -> Result<Adapter, ClientError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .nth(index)
        .ok_or(ClientError::AdapterUnavailable)
}

/// Scan for a while and list every device advertising the receptor service
pub async fn scan(
    adapter: &Adapter,
    duration: Duration,
) -> Result<Vec<ReceptorDevice>, ClientError> {
    adapter
        .start_scan(ScanFilter {
            services: vec![SERVICE_UUID],
        })
        .await?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter.peripherals().await?;
    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            // some hosts ignore the scan filter
            if !props.services.contains(&SERVICE_UUID) {
                continue;
            }
            let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
            let address = peripheral.address().to_string();
            devices.push(ReceptorDevice { name, address, rssi: props.rssi });
        }
    }

    adapter.stop_scan().await?;
    Ok(devices)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn post(events: &EventSender<Peripheral>, event: Event<Peripheral>) {
    if events.send(event).is_err() {
        debug!("event queue closed, dropping event");
    }
}

/// Scan error code for a failed scan start
pub fn scan_error_code(err: &btleplug::Error) -> i32 {
    match err {
        btleplug::Error::NotSupported(_) => scan_error::FEATURE_UNSUPPORTED,
        btleplug::Error::PermissionDenied => scan_error::APPLICATION_REGISTRATION_FAILED,
        _ => scan_error::INTERNAL_ERROR,
    }
}

fn is_powered(state: &CentralState) -> bool {
    // Unknown is reported while some stacks are still starting up
    !matches!(state, CentralState::PoweredOff)
}

/// The backend's view of the live connection
#[derive(Debug, Clone, PartialEq, Eq)]
struct Link<I> {
    id: I,
    /// Distinguishes successive connections to the same device
    generation: u64,
    /// Set once the connect request succeeded
    up: bool,
}

/// State shared between the backend and its pump task
struct Shared<I = PeripheralId> {
    enabled: AtomicBool,
    /// Service filter while a scan is running
    scan: Mutex<Option<Uuid>>,
    connected: Mutex<Option<Link<I>>>,
    generations: AtomicU64,
}

impl<I: PartialEq> Shared<I> {
    fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            scan: Mutex::new(None),
            connected: Mutex::new(None),
            generations: AtomicU64::new(0),
        }
    }

    fn scan_filter(&self) -> Option<Uuid> {
        *lock(&self.scan)
    }

    /// Record a scan for `service`; false if one is already running
    fn begin_scan(&self, service: Uuid) -> bool {
        let mut scan = lock(&self.scan);
        if scan.is_some() {
            return false;
        }
        *scan = Some(service);
        true
    }

    /// Forget the running scan; false if there was none
    fn end_scan(&self) -> bool {
        lock(&self.scan).take().is_some()
    }

    /// Make `id` the live connection, replacing any previous one
    fn open_link(&self, id: I) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.connected) = Some(Link {
            id,
            generation,
            up: false,
        });
        generation
    }

    /// Mark the link established; false if `generation` was replaced meanwhile
    fn link_up(&self, generation: u64) -> bool {
        match lock(&self.connected).as_mut() {
            Some(link) if link.generation == generation => {
                link.up = true;
                true
            }
            _ => false,
        }
    }

    /// Forget the link if it is still `generation`; true if it was
    fn release_link(&self, generation: u64) -> bool {
        let mut connected = lock(&self.connected);
        if connected.as_ref().is_some_and(|link| link.generation == generation) {
            *connected = None;
            true
        } else {
            false
        }
    }

    /// Handle the adapter reporting `id` disconnected
    ///
    /// Only an established link counts: a disconnect arriving while a new
    /// connection to the same device is still being set up belongs to the
    /// link released before it.
    fn link_lost(&self, id: &I) -> bool {
        let mut connected = lock(&self.connected);
        if connected.as_ref().is_some_and(|link| link.up && link.id == *id) {
            *connected = None;
            true
        } else {
            false
        }
    }
}

/// A live btleplug connection and the tasks working on it
#[derive(Debug)]
pub struct BtleConnection {
    peripheral: Peripheral,
    generation: u64,
    /// Resolves once notifications are enabled on the host
    subscribed: Option<oneshot::Receiver<()>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct BtleBackend {
    adapter: Adapter,
    events: EventSender<Peripheral>,
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
    /// Scan stops and disconnects still in flight
    closing: Vec<JoinHandle<()>>,
    /// Disconnects in flight; the sender is dropped when one completes
    releasing: Vec<(PeripheralId, watch::Receiver<()>)>,
}

impl BtleBackend {
    /// Take over `adapter`; must be called inside a tokio runtime
    pub async fn new(
        adapter: Adapter,
        events: EventSender<Peripheral>,
    ) -> Result<Self, ClientError> {
        let state = adapter.adapter_state().await?;
        info!("adapter state: {state:?}");

        let shared: Arc<Shared> = Arc::new(Shared::new(is_powered(&state)));

        let stream = adapter.events().await?;
        let pump = tokio::spawn(pump(adapter.clone(), stream, shared.clone(), events.clone()));

        Ok(Self {
            adapter,
            events,
            shared,
            pump,
            closing: Vec::new(),
            releasing: Vec::new(),
        })
    }

    /// Wait (bounded) for pending scan stops and disconnects
    ///
    /// Some stacks keep a link open after the process exits.
    pub async fn shutdown(mut self) {
        for task in std::mem::take(&mut self.closing) {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("gave up waiting for the adapter during shutdown");
            }
        }
    }
}

impl Drop for BtleBackend {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump<S>(
    adapter: Adapter,
    mut stream: S,
    shared: Arc<Shared>,
    events: EventSender<Peripheral>,
) where
    S: Stream<Item = CentralEvent> + Unpin,
{
    while let Some(event) = stream.next().await {
        match event {
            CentralEvent::StateUpdate(state) => {
                debug!("adapter state: {state:?}");
                shared.enabled.store(is_powered(&state), Ordering::SeqCst);
            }
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                let Some(service) = shared.scan_filter() else {
                    continue;
                };
                match advertising_peripheral(&adapter, &id, service).await {
                    Ok(Some(peripheral)) => post(&events, Event::ScanResult(peripheral)),
                    Ok(None) => {}
                    Err(e) => debug!("skipping {id:?}: {e}"),
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                if shared.link_lost(&id) {
                    post(
                        &events,
                        Event::ConnectionStateChanged {
                            status: GattStatus::Success,
                            state: LinkState::Disconnected,
                        },
                    );
                }
            }
            _ => {}
        }
    }
    debug!("adapter event stream ended");
}

/// The peripheral behind `id`, if it advertises `service`
async fn advertising_peripheral(
    adapter: &Adapter,
    id: &PeripheralId,
    service: Uuid,
) -> Result<Option<Peripheral>, btleplug::Error> {
    let peripheral = adapter.peripheral(id).await?;
    let advertises = peripheral
        .properties()
        .await?
        .is_some_and(|props| props.services.contains(&service));
    Ok(advertises.then_some(peripheral))
}

fn to_gatt_service(service: &Service) -> GattService {
    GattService {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                service_uuid: c.service_uuid,
                descriptors: c.descriptors.iter().map(|d| d.uuid).collect(),
            })
            .collect(),
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    wanted: &GattCharacteristic,
) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == wanted.uuid && c.service_uuid == wanted.service_uuid)
}

async fn forward_notifications(
    peripheral: Peripheral,
    characteristic: Characteristic,
    subscribed: oneshot::Sender<()>,
    events: EventSender<Peripheral>,
) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("notification stream unavailable: {e}");
            return;
        }
    };
    if let Err(e) = peripheral.subscribe(&characteristic).await {
        warn!("subscribe to {} failed: {e}", characteristic.uuid);
        return;
    }
    // the descriptor write waits for this; no receiver once the link is closed
    let _ = subscribed.send(());

    while let Some(notification) = notifications.next().await {
        if notification.uuid != characteristic.uuid {
            continue;
        }
        post(
            &events,
            Event::CharacteristicChanged {
                characteristic: notification.uuid,
                value: notification.value,
            },
        );
    }
    debug!("notification stream for {} ended", characteristic.uuid);
}

/// Wait for a pending notification subscription to finish
async fn subscription_settled(subscribed: Option<oneshot::Receiver<()>>) {
    if let Some(subscribed) = subscribed
        && subscribed.await.is_err()
    {
        debug!("notifications not enabled, writing descriptor anyway");
    }
}

impl Backend for BtleBackend {
    type Device = Peripheral;
    type Handle = BtleConnection;

    fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    fn start_scan(&mut self, request: &ScanRequest) {
        if !self.shared.begin_scan(request.service) {
            post(&self.events, Event::ScanFailed { code: scan_error::ALREADY_STARTED });
            return;
        }
        if request.mode != ScanMode::LowLatency {
            debug!("scan mode {:?} is left to the host stack", request.mode);
        }

        let adapter = self.adapter.clone();
        let shared = self.shared.clone();
        let events = self.events.clone();
        let filter = ScanFilter {
            services: vec![request.service],
        };
        tokio::spawn(async move {
            if let Err(e) = adapter.start_scan(filter).await {
                error!("scan start failed: {e}");
                shared.end_scan();
                post(&events, Event::ScanFailed { code: scan_error_code(&e) });
            }
        });
    }

    fn stop_scan(&mut self) {
        if !self.shared.end_scan() {
            return;
        }

        let adapter = self.adapter.clone();
        self.closing.retain(|task| !task.is_finished());
        self.closing.push(tokio::spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("scan stop failed: {e}");
            }
        }));
    }

    fn connect(&mut self, device: &Peripheral) -> BtleConnection {
        let peripheral = device.clone();
        let id = peripheral.id();
        let generation = self.shared.open_link(id.clone());

        self.releasing.retain(|(_, done)| done.has_changed().is_ok());
        let mut pending: Vec<_> = self
            .releasing
            .iter()
            .filter(|(released, _)| *released == id)
            .map(|(_, done)| done.clone())
            .collect();

        let shared = self.shared.clone();
        let events = self.events.clone();
        let task = tokio::spawn({
            let peripheral = peripheral.clone();
            async move {
                // a previous link to this device must be down first
                for done in &mut pending {
                    let _ = done.changed().await;
                }
                match peripheral.connect().await {
                    Ok(()) => {
                        if shared.link_up(generation) {
                            post(
                                &events,
                                Event::ConnectionStateChanged {
                                    status: GattStatus::Success,
                                    state: LinkState::Connected,
                                },
                            );
                        }
                    }
                    Err(e) => {
                        warn!("connect to {id:?} failed: {e}");
                        if shared.release_link(generation) {
                            post(
                                &events,
                                Event::ConnectionStateChanged {
                                    status: GattStatus::Failure(GATT_FAILURE),
                                    state: LinkState::Disconnected,
                                },
                            );
                        }
                    }
                }
            }
        });

        BtleConnection {
            peripheral,
            generation,
            subscribed: None,
            tasks: vec![task],
        }
    }

    fn discover_services(&mut self, handle: &mut BtleConnection) {
        let peripheral = handle.peripheral.clone();
        let events = self.events.clone();
        handle.tasks.push(tokio::spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => Event::ServicesDiscovered {
                    status: GattStatus::Success,
                    services: peripheral.services().iter().map(to_gatt_service).collect(),
                },
                Err(e) => {
                    warn!("service discovery failed: {e}");
                    Event::ServicesDiscovered {
                        status: GattStatus::Failure(GATT_FAILURE),
                        services: vec![],
                    }
                }
            };
            post(&events, event);
        }));
    }

    fn set_notify(
        &mut self,
        handle: &mut BtleConnection,
        characteristic: &GattCharacteristic,
    ) -> bool {
        let Some(target) = find_characteristic(&handle.peripheral, characteristic) else {
            return false;
        };

        let (subscribed_tx, subscribed_rx) = oneshot::channel();
        handle.subscribed = Some(subscribed_rx);
        let task = tokio::spawn(forward_notifications(
            handle.peripheral.clone(),
            target,
            subscribed_tx,
            self.events.clone(),
        ));
        handle.tasks.push(task);
        true
    }

    fn write_descriptor(
        &mut self,
        handle: &mut BtleConnection,
        characteristic: &GattCharacteristic,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool {
        let Some(target) = find_characteristic(&handle.peripheral, characteristic)
            .and_then(|c| c.descriptors.into_iter().find(|d| d.uuid == descriptor))
        else {
            return false;
        };

        let peripheral = handle.peripheral.clone();
        let events = self.events.clone();
        let value = value.to_vec();
        let subscribed = handle.subscribed.take();
        handle.tasks.push(tokio::spawn(async move {
            subscription_settled(subscribed).await;
            let status = match peripheral.write_descriptor(&target, &value).await {
                Ok(()) => GattStatus::Success,
                Err(e) => {
                    // CoreBluetooth refuses direct CCCD writes; subscribe already did it
                    debug!("descriptor write failed: {e}");
                    GattStatus::Failure(GATT_FAILURE)
                }
            };
            post(&events, Event::DescriptorWritten { descriptor, status });
        }));
        true
    }

    fn disconnect(&mut self, handle: &mut BtleConnection) {
        self.shared.release_link(handle.generation);

        let peripheral = handle.peripheral.clone();
        let (done_tx, done_rx) = watch::channel(());
        self.releasing.push((peripheral.id(), done_rx));
        self.closing.retain(|task| !task.is_finished());
        self.closing.push(tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("disconnect failed: {e}");
            }
            drop(done_tx);
        }));
    }

    fn close(&mut self, handle: BtleConnection) {
        for task in handle.tasks {
            task.abort();
        }
    }
}
