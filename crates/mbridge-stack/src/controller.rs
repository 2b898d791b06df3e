//! Client side of the protocol stack: controllers and connected peers

use async_trait::async_trait;
use mbridge_core::{NodeId, StorageService};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::StackError;

/// Environment a controller is bound to
#[derive(Debug, Clone)]
pub struct ControllerEnvironment {
    /// Storage root of the controller
    pub storage: StorageService,
    /// Namespace of this controller inside the storage root
    pub id: String,
    /// Network interface to restrict MDNS to
    pub network_interface: Option<String>,
}

/// Caller supplied options for a node connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOptions {
    /// Subscribe to all attributes and events after connecting
    #[serde(default)]
    pub auto_subscribe: bool,
    /// Give up on the initial connection after this long
    #[serde(default, with = "opt_millis")]
    pub connect_timeout: Option<Duration>,
    #[serde(default, with = "opt_millis")]
    pub subscribe_min_interval_floor: Option<Duration>,
    #[serde(default, with = "opt_millis")]
    pub subscribe_max_interval_ceiling: Option<Duration>,
}

/// Durations travel as integer milliseconds
mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Constructs controllers
#[async_trait]
pub trait ControllerFactory: Send + Sync {
    async fn create_controller(
        &self,
        environment: ControllerEnvironment,
    ) -> Result<Arc<dyn CommissioningController>, StackError>;
}

/// A controller able to reach commissioned peers
#[async_trait]
pub trait CommissioningController: Send + Sync {
    async fn start(&self) -> Result<(), StackError>;

    async fn close(&self) -> Result<(), StackError>;

    /// Connect to a commissioned node; `None` when the stack has no such node
    async fn connect_node(
        &self,
        node_id: NodeId,
        options: Option<ConnectOptions>,
    ) -> Result<Option<Arc<dyn PeerNode>>, StackError>;

    async fn commissioned_nodes(&self) -> Result<Vec<NodeId>, StackError>;
}

/// A connected remote node
pub trait PeerNode: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Top-level device endpoints of the node
    fn devices(&self) -> Vec<Arc<dyn PeerEndpoint>>;
}

/// An endpoint inside a peer's endpoint tree
pub trait PeerEndpoint: Send + Sync + std::fmt::Debug {
    fn number(&self) -> u16;

    /// Direct children, in enumeration order
    fn child_endpoints(&self) -> Vec<Arc<dyn PeerEndpoint>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_from_json() {
        let options: ConnectOptions =
            serde_json::from_str(r#"{ "autoSubscribe": true, "connectTimeout": 1500 }"#).unwrap();
        assert!(options.auto_subscribe);
        assert_eq!(options.connect_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.subscribe_min_interval_floor, None);
    }
}
