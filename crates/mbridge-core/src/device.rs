//! Device types exposed through the bridge

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

/// Initial attribute values keyed by `"<cluster>.<attribute>"`
pub type AttributeMap = HashMap<String, serde_json::Value>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unsupported device type {0}")]
pub struct UnknownDeviceType(pub String);

/// Identifier of a bridged device, assigned by the caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The closed set of device kinds the bridge can expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    OnOffLight,
    OnOffPlugInUnit,
    DimmableLight,
    Thermostat,
    WindowCovering,
    DoorLock,
    TemperatureSensor,
    HumiditySensor,
    OccupancySensor,
    ContactSensor,
    Fan,
    ColorLight,
}

/// Clusters and device type code a bridged device exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Device type code announced on the endpoint
    pub code: u32,
    /// Application clusters served by the endpoint
    pub clusters: &'static [&'static str],
}

impl DeviceType {
    pub const ALL: [DeviceType; 12] = [
        DeviceType::OnOffLight,
        DeviceType::OnOffPlugInUnit,
        DeviceType::DimmableLight,
        DeviceType::Thermostat,
        DeviceType::WindowCovering,
        DeviceType::DoorLock,
        DeviceType::TemperatureSensor,
        DeviceType::HumiditySensor,
        DeviceType::OccupancySensor,
        DeviceType::ContactSensor,
        DeviceType::Fan,
        DeviceType::ColorLight,
    ];

    /// The tag used on the wire and in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::OnOffLight => "OnOffLight",
            DeviceType::OnOffPlugInUnit => "OnOffPlugInUnit",
            DeviceType::DimmableLight => "DimmableLight",
            DeviceType::Thermostat => "Thermostat",
            DeviceType::WindowCovering => "WindowCovering",
            DeviceType::DoorLock => "DoorLock",
            DeviceType::TemperatureSensor => "TemperatureSensor",
            DeviceType::HumiditySensor => "HumiditySensor",
            DeviceType::OccupancySensor => "OccupancySensor",
            DeviceType::ContactSensor => "ContactSensor",
            DeviceType::Fan => "Fan",
            DeviceType::ColorLight => "ColorLight",
        }
    }

    pub fn profile(&self) -> DeviceProfile {
        let (code, clusters): (u32, &'static [&'static str]) = match self {
            DeviceType::OnOffLight => (0x0100, &["onOff"]),
            DeviceType::OnOffPlugInUnit => (0x010a, &["onOff"]),
            DeviceType::DimmableLight => (0x0101, &["onOff", "levelControl"]),
            DeviceType::Thermostat => (0x0301, &["thermostat"]),
            DeviceType::WindowCovering => (0x0202, &["windowCovering"]),
            DeviceType::DoorLock => (0x000a, &["doorLock"]),
            DeviceType::TemperatureSensor => (0x0302, &["temperatureMeasurement"]),
            DeviceType::HumiditySensor => (0x0307, &["relativeHumidityMeasurement"]),
            DeviceType::OccupancySensor => (0x0107, &["occupancySensing"]),
            DeviceType::ContactSensor => (0x0015, &["booleanState"]),
            DeviceType::Fan => (0x002b, &["fanControl"]),
            DeviceType::ColorLight => (0x010d, &["onOff", "levelControl", "colorControl"]),
        };
        DeviceProfile { code, clusters }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = UnknownDeviceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownDeviceType(s.to_string()))
    }
}

/// Display metadata of a bridged device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub node_label: String,
    pub product_name: String,
    pub product_label: String,
    pub serial_number: String,
}

/// Split a `"<cluster>.<attribute>"` key into its parts
pub fn split_attribute_key(key: &str) -> Option<(&str, &str)> {
    let (cluster, attribute) = key.split_once('.')?;
    if cluster.is_empty() || attribute.is_empty() {
        return None;
    }
    Some((cluster, attribute))
}
