use std::path::PathBuf;

use uuid::Uuid;

use crate::permission::Capability;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Bluetooth permissions denied: {0:?}")]
    PermissionDenied(Vec<Capability>),

    #[error("Bluetooth is not enabled")]
    BluetoothDisabled,

    #[error("scan failed with error code {code}")]
    ScanFailure { code: i32 },

    #[error("service {0} not found on device")]
    ServiceMissing(Uuid),

    #[error("characteristic {0} not found on device")]
    CharacteristicMissing(Uuid),

    #[error("descriptor {0} not found on characteristic")]
    DescriptorMissing(Uuid),

    #[error("service discovery failed with status {0}")]
    DiscoveryFailed(i32),

    #[error("device disconnected")]
    Disconnected,

    #[error("no Bluetooth adapter found")]
    AdapterUnavailable,

    #[error("failed to read config {}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Btleplug(#[from] btleplug::Error),
}
