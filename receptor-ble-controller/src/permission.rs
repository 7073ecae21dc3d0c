//! Permission gate
//!
//! Scanning needs platform capabilities. On current platform levels these are
//! the Bluetooth scan and connect capabilities, older levels only know the
//! location capability. The gate is an external collaborator: requests are
//! answered later with an [`Event::PermissionsResolved`](crate::Event).

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventSender};

/// First platform level with dedicated Bluetooth capabilities
pub const BLUETOOTH_CAPABILITIES_LEVEL: u32 = 31;

/// A platform capability the client needs before scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    BluetoothScan,
    BluetoothConnect,
    FineLocation,
}

/// Capabilities required on the given platform level
pub fn required_capabilities(api_level: u32) -> &'static [Capability] {
    if api_level >= BLUETOOTH_CAPABILITIES_LEVEL {
        &[Capability::BluetoothScan, Capability::BluetoothConnect]
    } else {
        &[Capability::FineLocation]
    }
}

/// Platform permission system
pub trait PermissionGate {
    /// Whether the capability is currently held
    fn is_granted(&self, capability: Capability) -> bool;

    /// Ask the user for the capabilities (non-blocking)
    ///
    /// The answer must arrive as `Event::PermissionsResolved`.
    fn request(&mut self, capabilities: Vec<Capability>);
}

/// Subset of `required` that is not held yet
pub fn missing_capabilities<P: PermissionGate + ?Sized>(
    gate: &P,
    required: &[Capability],
) -> Vec<Capability> {
    required
        .iter()
        .copied()
        .filter(|c| !gate.is_granted(*c))
        .collect()
}

/// Capabilities refused in a permission answer
pub fn denied(results: &[(Capability, bool)]) -> Vec<Capability> {
    results
        .iter()
        .filter(|(_, granted)| !granted)
        .map(|(c, _)| *c)
        .collect()
}

/// Desktop hosts have no runtime capability prompts, the OS asks on first
/// adapter use. Every capability counts as held and every request is
/// answered with a grant.
pub struct HostPermissions<D> {
    events: EventSender<D>,
}

impl<D> HostPermissions<D> {
    pub fn new(events: EventSender<D>) -> Self {
        Self { events }
    }
}

impl<D> PermissionGate for HostPermissions<D> {
    fn is_granted(&self, _capability: Capability) -> bool {
        true
    }

    fn request(&mut self, capabilities: Vec<Capability>) {
        let results = capabilities.into_iter().map(|c| (c, true)).collect();
        if self.events.send(Event::PermissionsResolved(results)).is_err() {
            log::debug!("event queue closed, dropping permission answer");
        }
    }
}
