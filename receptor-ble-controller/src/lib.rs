//! Receptor BLE Controller
//!
//! BLE central client that finds the receptor peripheral, subscribes to its
//! value characteristic and shows every notified value.
//!
//! # Example
//!
//! ```ignore
//! use receptor_ble_controller::{
//!     BtleBackend, Client, ClientConfig, DisplayHandle, Event, HostPermissions, ble, event,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::default();
//!     let (events_tx, events_rx) = event::channel();
//!     let (display, _updates) = DisplayHandle::channel();
//!
//!     let adapter = ble::get_adapter(config.adapter_index).await?;
//!     let backend = BtleBackend::new(adapter, events_tx.clone()).await?;
//!     let permissions = HostPermissions::new(events_tx.clone());
//!
//!     events_tx.send(Event::ScanRequested)?;
//!     Client::new(backend, permissions, display, config).run(events_rx).await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod ble;
pub mod client;
pub mod config;
pub mod display;
mod error;
pub mod event;
pub mod permission;

pub use backend::{Backend, ScanRequest};
pub use ble::{BtleBackend, BtleConnection, ReceptorDevice};
pub use client::{Client, ConnectionState};
pub use config::{ClientConfig, ScanMode};
pub use display::{DisplayCommand, DisplayHandle, Surface};
pub use error::ClientError;
pub use event::{Event, GattCharacteristic, GattService, GattStatus, LinkState};
pub use permission::{Capability, HostPermissions, PermissionGate};
