//! Server side of the protocol stack: the aggregated node and its endpoints

use async_trait::async_trait;
use mbridge_core::{DeviceInfo, DeviceType, NodeStorage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::StackError;

/// Context the stack keeps its own node state in
pub const ROOT_CONTEXT: &str = "root";

/// Key the stack writes into the root context once a node has been created
pub const ROOT_NUMBER_KEY: &str = "__number__";

/// Device type code of an aggregator endpoint
pub const AGGREGATOR_DEVICE_TYPE: u32 = 0x000e;

/// Attribute values of an endpoint, grouped by cluster
pub type ClusterState = HashMap<String, serde_json::Map<String, serde_json::Value>>;

/// Everything needed to construct an aggregated node
#[derive(Debug, Clone)]
pub struct ServerNodeConfig {
    /// Stable node id, also the storage namespace
    pub id: String,
    /// UDP port the node listens on
    pub port: u16,
    pub commissioning: CommissioningConfig,
    pub product_description: ProductDescription,
    pub basic_information: BasicInformation,
    /// Namespace the stack persists the node into
    pub storage: NodeStorage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissioningConfig {
    pub passcode: u32,
    pub discriminator: u16,
}

/// Announcement data of the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDescription {
    pub name: String,
    pub device_type: u32,
}

/// Basic information cluster of the root endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicInformation {
    pub vendor_name: String,
    pub vendor_id: u16,
    pub node_label: String,
    pub product_name: String,
    pub product_label: String,
    pub product_id: u16,
    pub serial_number: String,
    pub unique_id: String,
}

/// Pairing codes currently advertised by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingCodes {
    pub manual_pairing_code: String,
    pub qr_pairing_code: String,
}

/// Commissioning state as reported by the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCommissioning {
    /// The node has been joined to at least one fabric
    pub commissioned: bool,
    pub pairing_codes: PairingCodes,
}

/// A fabric the node is joined to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FabricInfo {
    pub fabric_index: u8,
    pub fabric_id: u64,
    pub node_id: u64,
    pub root_vendor_id: u16,
    pub label: String,
}

/// Definition of a device endpoint to attach below the aggregator
#[derive(Debug, Clone)]
pub struct BridgedEndpointConfig {
    pub id: String,
    pub device_type: DeviceType,
    pub info: DeviceInfo,
    pub initial_state: ClusterState,
}

/// Sending half of a commissioning window notification, held by the stack
#[derive(Debug)]
pub struct WindowCloser(oneshot::Sender<()>);

impl WindowCloser {
    /// Signal that the window has closed
    pub fn close(self) {
        // The bridge may have stopped listening already
        let _ = self.0.send(());
    }
}

/// Resolves once the commissioning window it was issued for has closed
#[derive(Debug)]
pub struct WindowClosed(oneshot::Receiver<()>);

impl WindowClosed {
    pub fn channel() -> (WindowCloser, WindowClosed) {
        let (tx, rx) = oneshot::channel();
        (WindowCloser(tx), WindowClosed(rx))
    }

    /// Wait for the window to close
    ///
    /// A stack that drops its [`WindowCloser`] without signalling has torn the
    /// window down as well, so that counts as closed.
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

/// Constructs aggregated nodes
#[async_trait]
pub trait ProtocolStack: Send + Sync {
    async fn create_server_node(
        &self,
        config: ServerNodeConfig,
    ) -> Result<Arc<dyn ServerNode>, StackError>;
}

/// An aggregated node hosted by the stack
#[async_trait]
pub trait ServerNode: Send + Sync {
    fn id(&self) -> &str;

    /// Attach an aggregator endpoint directly below the root endpoint
    async fn add_aggregator(&self, id: &str) -> Result<Arc<dyn Aggregator>, StackError>;

    /// Human readable dump of the endpoint structure
    fn describe(&self) -> String;

    /// Start announcing and listening on the network
    async fn start(&self) -> Result<(), StackError>;

    /// Stop the node; a second call reports [`StackError::AlreadyClosed`]
    async fn close(&self) -> Result<(), StackError>;

    /// Drop all persisted state of the node
    async fn erase(&self) -> Result<(), StackError>;

    fn commissioning(&self) -> NodeCommissioning;

    /// Open a basic commissioning window
    async fn open_basic_commissioning(&self) -> Result<WindowClosed, StackError>;

    /// Close any open commissioning window immediately
    async fn end_commissioning(&self) -> Result<(), StackError>;

    fn fabrics(&self) -> Vec<FabricInfo>;

    async fn remove_fabric(&self, fabric_index: u8) -> Result<(), StackError>;
}

/// Aggregator endpoint that bridged devices hang off
#[async_trait]
pub trait Aggregator: Send + Sync {
    /// Attach a device endpoint; adding the same id twice is an error
    async fn add_endpoint(
        &self,
        config: BridgedEndpointConfig,
    ) -> Result<Arc<dyn BridgedEndpoint>, StackError>;
}

/// A device endpoint attached to the aggregator
#[async_trait]
pub trait BridgedEndpoint: Send + Sync {
    fn id(&self) -> &str;

    async fn set_state(
        &self,
        cluster: &str,
        attribute: &str,
        value: serde_json::Value,
    ) -> Result<(), StackError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_window_closed_resolves_on_close() {
        let (closer, closed) = WindowClosed::channel();
        closer.close();
        closed.wait().await;
    }

    #[tokio::test]
    async fn test_window_closed_resolves_on_drop() {
        let (closer, closed) = WindowClosed::channel();
        drop(closer);
        closed.wait().await;
    }
}
