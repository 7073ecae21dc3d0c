//! BLE GATT constants shared with the receptor peripheral firmware
//!
//! The service and characteristic UUIDs must be identical to the ones
//! compiled into the firmware, otherwise the scan filter never matches.

use uuid::Uuid;

/// BLE Service UUID: 4fafc201-1fb5-459e-8fcc-c5c9c331914b
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Value Characteristic UUID (read/notify): beb5483e-36e1-4688-b7f5-ea07361b26a8
pub const VALUE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// Client Characteristic Configuration descriptor (GATT standard 0x2902)
pub const CLIENT_CONFIG_DESCRIPTOR_UUID: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Values written to the client configuration descriptor
pub mod client_config {
    /// Enable notifications (little-endian 0x0001)
    pub const ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];
}
