//! Events delivered to the client
//!
//! Every platform callback (scan result, connection change, discovery
//! completion, value change) and every user action is turned into an
//! [`Event`] and pushed onto a single queue. The client consumes that queue
//! one event at a time.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::permission::Capability;

/// Sending half of the client's event queue
pub type EventSender<D> = mpsc::UnboundedSender<Event<D>>;

/// Receiving half of the client's event queue
pub type EventReceiver<D> = mpsc::UnboundedReceiver<Event<D>>;

/// Create the client's event queue
pub fn channel<D>() -> (EventSender<D>, EventReceiver<D>) {
    mpsc::unbounded_channel()
}

/// Completion status of a GATT operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    /// Platform-specific failure code
    Failure(i32),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

/// Link state reported by the platform on a connection change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A characteristic found during service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    /// UUIDs of the descriptors attached to this characteristic
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    pub fn has_descriptor(&self, uuid: Uuid) -> bool {
        self.descriptors.contains(&uuid)
    }
}

/// A service found during service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Look up a service by UUID in a discovery result
pub fn find_service(services: &[GattService], uuid: Uuid) -> Option<&GattService> {
    services.iter().find(|s| s.uuid == uuid)
}

/// Something that happened, for the client to react to
#[derive(Debug, Clone)]
pub enum Event<D> {
    /// The user pressed the scan control
    ScanRequested,
    /// Answer to a capability request, one entry per requested capability
    PermissionsResolved(Vec<(Capability, bool)>),
    /// The front end became visible again
    Resumed,
    /// The front end went away; stop scanning and drop the connection
    Stopped,
    /// An advertisement matching the scan filter was received
    ScanResult(D),
    /// The platform rejected or aborted the scan
    ScanFailed { code: i32 },
    /// The connection to the device changed state
    ConnectionStateChanged { status: GattStatus, state: LinkState },
    /// Service discovery finished
    ServicesDiscovered { status: GattStatus, services: Vec<GattService> },
    /// A descriptor write finished
    DescriptorWritten { descriptor: Uuid, status: GattStatus },
    /// The device notified a new characteristic value
    CharacteristicChanged { characteristic: Uuid, value: Vec<u8> },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(uuid: u128, chars: &[u128]) -> GattService {
        GattService {
            uuid: Uuid::from_u128(uuid),
            characteristics: chars
                .iter()
                .map(|c| GattCharacteristic {
                    uuid: Uuid::from_u128(*c),
                    service_uuid: Uuid::from_u128(uuid),
                    descriptors: vec![],
                })
                .collect(),
        }
    }

    #[test]
    fn finds_characteristic_within_its_service_only() {
        let services = vec![service(1, &[10, 11]), service(2, &[20])];

        let first = find_service(&services, Uuid::from_u128(1)).unwrap();
        assert!(first.characteristic(Uuid::from_u128(11)).is_some());
        assert!(first.characteristic(Uuid::from_u128(20)).is_none());
        assert!(find_service(&services, Uuid::from_u128(3)).is_none());
    }

    #[test]
    fn gatt_status_success() {
        assert!(GattStatus::Success.is_success());
        assert!(!GattStatus::Failure(133).is_success());
    }
}
