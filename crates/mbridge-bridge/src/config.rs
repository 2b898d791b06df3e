//! Construction parameters of the bridge

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Directory the bridge node persists into
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Name announced during commissioning
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_vendor_name")]
    pub vendor_name: String,
    #[serde(default = "default_passcode")]
    pub passcode: u32,
    #[serde(default = "default_discriminator")]
    pub discriminator: u16,
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,
    /// Also used as node label and product label of the root endpoint
    #[serde(default = "default_product_name")]
    pub product_name: String,
    #[serde(default = "default_product_id")]
    pub product_id: u16,
    /// UDP port of the node
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            device_name: default_device_name(),
            vendor_name: default_vendor_name(),
            passcode: default_passcode(),
            discriminator: default_discriminator(),
            vendor_id: default_vendor_id(),
            product_name: default_product_name(),
            product_id: default_product_id(),
            port: default_port(),
        }
    }
}

impl BridgeConfig {
    /// Serial number reported by the root endpoint
    pub fn serial_number(&self) -> String {
        format!("{}-{}", self.product_name, self.product_id)
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/bridge")
}

fn default_device_name() -> String {
    "mbridge".to_string()
}

fn default_vendor_name() -> String {
    "mbridge".to_string()
}

fn default_passcode() -> u32 {
    20202021
}

fn default_discriminator() -> u16 {
    3840
}

fn default_vendor_id() -> u16 {
    0xfff1 // test vendor
}

fn default_product_name() -> String {
    "mbridge Bridge".to_string()
}

fn default_product_id() -> u16 {
    0x8000
}

fn default_port() -> u16 {
    5540
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{ "product_name": "Hub", "port": 5550 }"#).unwrap();
        assert_eq!(config.product_name, "Hub");
        assert_eq!(config.port, 5550);
        assert_eq!(config.passcode, 20202021);
        assert_eq!(config.discriminator, 3840);
    }

    #[test]
    fn test_serial_number() {
        let config = BridgeConfig {
            product_name: "Hub".to_string(),
            product_id: 42,
            ..Default::default()
        };
        assert_eq!(config.serial_number(), "Hub-42");
    }
}
