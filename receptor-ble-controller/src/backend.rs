//! Platform BLE backend
//!
//! Every request is fire-and-forget: the call returns immediately and the
//! outcome is posted later to the client's event queue.

use std::fmt;

use uuid::Uuid;

use crate::config::ScanMode;
use crate::event::GattCharacteristic;

/// Scan failure codes, numbered like the platform scanners report them
pub mod scan_error {
    pub const ALREADY_STARTED: i32 = 1;
    pub const APPLICATION_REGISTRATION_FAILED: i32 = 2;
    pub const INTERNAL_ERROR: i32 = 3;
    pub const FEATURE_UNSUPPORTED: i32 = 4;
}

/// Filtered scan parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Only report advertisements listing this service
    pub service: Uuid,
    pub mode: ScanMode,
}

/// BLE adapter and scanner, acquired before the client is built
pub trait Backend {
    /// A discovered device, as delivered in scan results
    type Device: Clone + fmt::Debug + Send + 'static;
    /// A live connection
    type Handle: fmt::Debug + Send + 'static;

    /// Whether the adapter is powered on
    fn is_enabled(&self) -> bool;

    /// Start a filtered scan; results arrive as `Event::ScanResult`
    fn start_scan(&mut self, request: &ScanRequest);

    /// Stop scanning; calling it while not scanning does nothing
    fn stop_scan(&mut self);

    /// Open a connection without auto-reconnect
    ///
    /// Progress arrives as `Event::ConnectionStateChanged`.
    fn connect(&mut self, device: &Self::Device) -> Self::Handle;

    /// Results arrive as `Event::ServicesDiscovered`
    fn discover_services(&mut self, handle: &mut Self::Handle);

    /// Deliver value changes of the characteristic locally
    ///
    /// Returns false if the request could not be issued.
    fn set_notify(
        &mut self,
        handle: &mut Self::Handle,
        characteristic: &GattCharacteristic,
    ) -> bool;

    /// Completion arrives as `Event::DescriptorWritten`
    ///
    /// Returns false if the request could not be issued.
    fn write_descriptor(
        &mut self,
        handle: &mut Self::Handle,
        characteristic: &GattCharacteristic,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool;

    fn disconnect(&mut self, handle: &mut Self::Handle);

    /// Release every resource held by the connection
    fn close(&mut self, handle: Self::Handle);
}
