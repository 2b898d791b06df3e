//! Configuration loading

use anyhow::Result;
use mbridge_bridge::BridgeConfig;
use mbridge_controller::ControllerConfig;
use mbridge_core::{AttributeMap, DeviceInfo};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Peer controller, only run when configured
    #[serde(default)]
    pub controller: Option<ControllerConfig>,
    /// Devices registered on the bridge at startup
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

/// A `[[device]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device type tag, e.g. "OnOffLight"
    #[serde(rename = "type")]
    pub device_type: String,
    pub id: String,
    #[serde(default)]
    pub node_label: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub product_label: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Initial values keyed by "cluster.attribute"
    #[serde(default)]
    pub attributes: AttributeMap,
}

impl DeviceConfig {
    /// Metadata of the device, filling gaps from the id and type
    pub fn info(&self) -> DeviceInfo {
        let product_name = self
            .product_name
            .clone()
            .unwrap_or_else(|| self.device_type.clone());
        DeviceInfo {
            node_label: self.node_label.clone().unwrap_or_else(|| self.id.clone()),
            product_label: self
                .product_label
                .clone()
                .unwrap_or_else(|| product_name.clone()),
            product_name,
            serial_number: self.serial_number.clone().unwrap_or_else(|| self.id.clone()),
        }
    }
}

/// Load configuration from file, or use defaults
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), devices = config.devices.len(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = load_config(&temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.bridge.port, 5540);
        assert!(config.controller.is_none());
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_load_full_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mbridge.toml");
        std::fs::write(
            &path,
            r#"
[bridge]
storage_path = "/var/lib/mbridge"
product_name = "Hub"
product_id = 7
passcode = 11223344

[controller]
storage_location = "/var/lib/mbridge/controller"
network_interface = "eth0"

[[device]]
type = "DimmableLight"
id = "kitchen"
node_label = "Kitchen"
attributes = { "onOff.onOff" = true, "levelControl.currentLevel" = 128 }

[[device]]
type = "ContactSensor"
id = "door"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();

        assert_eq!(config.bridge.product_name, "Hub");
        assert_eq!(config.bridge.serial_number(), "Hub-7");
        assert_eq!(config.bridge.passcode, 11223344);
        assert_eq!(config.bridge.discriminator, 3840);

        let controller = config.controller.unwrap();
        assert_eq!(controller.network_interface.as_deref(), Some("eth0"));

        assert_eq!(config.devices.len(), 2);
        let kitchen = &config.devices[0];
        assert_eq!(kitchen.device_type, "DimmableLight");
        assert_eq!(kitchen.attributes["onOff.onOff"], json!(true));
        assert_eq!(kitchen.attributes["levelControl.currentLevel"], json!(128));
        assert_eq!(kitchen.info().node_label, "Kitchen");
    }

    #[test]
    fn test_device_info_fallbacks() {
        let device = DeviceConfig {
            device_type: "Fan".to_string(),
            id: "fan-1".to_string(),
            node_label: None,
            product_name: None,
            product_label: None,
            serial_number: None,
            attributes: AttributeMap::new(),
        };

        let info = device.info();
        assert_eq!(info.node_label, "fan-1");
        assert_eq!(info.product_name, "Fan");
        assert_eq!(info.product_label, "Fan");
        assert_eq!(info.serial_number, "fan-1");
    }
}
