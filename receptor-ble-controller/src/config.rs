//! Client configuration

use std::path::Path;

use crate::ClientError;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "RECEPTOR_CONFIG";

/// Scan profile requested from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    LowPower,
    Balanced,
    #[default]
    LowLatency,
}

/// Client configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name shown in the "searching" status (e.g., "ESP32")
    pub peripheral_label: String,
    /// Platform level, decides which capabilities are required
    pub api_level: u32,
    pub scan_mode: ScanMode,
    /// Which Bluetooth adapter to use when several are present
    pub adapter_index: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            peripheral_label: "ESP32".to_string(),
            api_level: crate::permission::BLUETOOTH_CAPABILITIES_LEVEL,
            scan_mode: ScanMode::LowLatency,
            adapter_index: 0,
        }
    }
}

impl ClientConfig {
    /// Load config from a JSON file, or defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        if !path.exists() {
            log::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path).map_err(|source| ClientError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ClientError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load config from `path`, else from `$RECEPTOR_CONFIG`, else defaults
    pub fn resolve(path: Option<&Path>) -> Result<Self, ClientError> {
        match path {
            Some(path) => Self::load(path),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) => Self::load(Path::new(&path)),
                None => Ok(Self::default()),
            },
        }
    }
}
