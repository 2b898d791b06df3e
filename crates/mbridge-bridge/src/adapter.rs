//! Device adapters: the per-device shim between the bridge and its endpoint

use mbridge_core::{split_attribute_key, AttributeMap, DeviceInfo, DeviceType, EndpointId};
use mbridge_stack::{BridgedEndpoint, BridgedEndpointConfig, ClusterState, StackError};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Cluster every bridged endpoint carries its display metadata in
pub const BRIDGED_INFO_CLUSTER: &str = "bridgedDeviceBasicInformation";

/// A registered device and the endpoint serving it
pub struct DeviceAdapter {
    id: EndpointId,
    device_type: DeviceType,
    info: DeviceInfo,
    endpoint: Arc<dyn BridgedEndpoint>,
}

impl DeviceAdapter {
    /// Endpoint definition for a device of the given type
    ///
    /// The profile of `device_type` decides which clusters the endpoint gets.
    /// Entries of `attributes` seed those clusters; entries naming any other
    /// cluster are dropped.
    pub fn definition(
        device_type: DeviceType,
        id: &EndpointId,
        info: &DeviceInfo,
        attributes: &AttributeMap,
    ) -> BridgedEndpointConfig {
        let profile = device_type.profile();
        let mut state = ClusterState::new();
        for cluster in profile.clusters {
            state.insert(cluster.to_string(), Map::new());
        }

        for (key, value) in attributes {
            let Some((cluster, attribute)) = split_attribute_key(key) else {
                debug!(id = %id, key = %key, "Ignoring malformed attribute key");
                continue;
            };
            match state.get_mut(cluster) {
                Some(values) => {
                    values.insert(attribute.to_string(), value.clone());
                }
                None => {
                    debug!(id = %id, device_type = %device_type, cluster = %cluster, "Ignoring attribute for cluster not on device");
                }
            }
        }

        if let Value::Object(basic) = json!({
            "nodeLabel": info.node_label,
            "productName": info.product_name,
            "productLabel": info.product_label,
            "serialNumber": info.serial_number,
            "reachable": true,
        }) {
            state.insert(BRIDGED_INFO_CLUSTER.to_string(), basic);
        }

        BridgedEndpointConfig {
            id: id.to_string(),
            device_type,
            info: info.clone(),
            initial_state: state,
        }
    }

    /// Wrap an endpoint that has been attached to the aggregator
    pub fn new(
        id: EndpointId,
        device_type: DeviceType,
        info: DeviceInfo,
        endpoint: Arc<dyn BridgedEndpoint>,
    ) -> Self {
        Self {
            id,
            device_type,
            info,
            endpoint,
        }
    }

    /// Push a new attribute value to the endpoint
    pub async fn update_state(
        &self,
        cluster: &str,
        attribute: &str,
        value: Value,
    ) -> Result<(), StackError> {
        debug!(
            id = %self.id,
            device_type = %self.device_type,
            cluster = %cluster,
            attribute = %attribute,
            "Updating state"
        );
        self.endpoint.set_state(cluster, attribute, value).await
    }
}

impl std::fmt::Debug for DeviceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAdapter")
            .field("id", &self.id)
            .field("device_type", &self.device_type)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}
