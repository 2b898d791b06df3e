//! Controller node: owns the commissioning controller and its storage

use mbridge_core::{
    convert_legacy_storage, log_failure, InvalidNodeId, NodeId, NodeRef, StorageContext,
    StorageError, StorageService,
};
use mbridge_stack::{
    CommissioningController, ConnectOptions, ControllerEnvironment, ControllerFactory,
    PeerEndpoint, PeerNode, StackError,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::resolve::find_endpoint;

/// Context the controller keeps its own keys in
pub const NODE_CONTEXT: &str = "Node";

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Storage uninitialized")]
    StorageUninitialized,
    #[error("CommissioningController not initialized")]
    NotInitialized,
    #[error("Node {0} not connected")]
    NotConnected(NodeRef),
    #[error("No controller initialized")]
    NoController(#[source] StackError),
    #[error("Invalid node id: {0}")]
    InvalidNodeId(#[from] InvalidNodeId),
    #[error("Stack error: {0}")]
    Stack(#[from] StackError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Storage directory, or a legacy single-file store to convert
    #[serde(default = "default_storage_location")]
    pub storage_location: PathBuf,
    #[serde(default)]
    pub node_num: u32,
    /// Restrict MDNS to this interface
    #[serde(default)]
    pub network_interface: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            storage_location: default_storage_location(),
            node_num: 0,
            network_interface: None,
        }
    }
}

fn default_storage_location() -> PathBuf {
    PathBuf::from("data/controller")
}

/// A controller able to reach the nodes it has commissioned
pub struct ControllerNode {
    config: ControllerConfig,
    factory: Arc<dyn ControllerFactory>,
    controller: Option<Arc<dyn CommissioningController>>,
    store: Option<StorageContext>,
}

impl ControllerNode {
    pub fn new(config: ControllerConfig, factory: Arc<dyn ControllerFactory>) -> Self {
        Self {
            config,
            factory,
            controller: None,
            store: None,
        }
    }

    /// Storage context of the controller
    pub fn store(&self) -> Result<&StorageContext, ControllerError> {
        self.store.as_ref().ok_or(ControllerError::StorageUninitialized)
    }

    /// Resolve storage, construct the controller and start it
    ///
    /// A controller from an earlier call is closed first.
    pub async fn initialize(&mut self) -> Result<(), ControllerError> {
        self.store = None;
        if let Some(previous) = self.controller.take() {
            debug!("Closing the previous controller");
            if let Err(e) = previous.close().await {
                warn!(error = %e, "Failed to close the previous controller");
            }
        }

        let converted = convert_legacy_storage(&self.config.storage_location)
            .await
            .map_err(|e| log_failure("initialize", e))?;
        info!(location = %converted.output_dir.display(), "Storage location (directory)");

        if let Some(interface) = &self.config.network_interface {
            check_network_interface(interface);
        }

        let storage = StorageService::new(&converted.output_dir);
        let environment = ControllerEnvironment {
            storage: storage.clone(),
            id: converted.id.clone(),
            network_interface: self.config.network_interface.clone(),
        };
        let controller = self
            .factory
            .create_controller(environment)
            .await
            .map_err(|e| ControllerError::NoController(log_failure("initialize", e)))?;

        let store = match Self::start_controller(&controller, &storage, &converted.id).await {
            Ok(store) => store,
            Err(e) => {
                if let Err(close_err) = controller.close().await {
                    warn!(error = %close_err, "Failed to close controller that did not start");
                }
                return Err(e);
            }
        };
        info!(node = self.config.node_num, id = %converted.id, "Controller started");

        self.controller = Some(controller);
        self.store = Some(store);
        Ok(())
    }

    async fn start_controller(
        controller: &Arc<dyn CommissioningController>,
        storage: &StorageService,
        id: &str,
    ) -> Result<StorageContext, ControllerError> {
        let store = storage.open(id)?.context(NODE_CONTEXT)?;
        controller
            .start()
            .await
            .map_err(|e| log_failure("initialize", e))?;
        Ok(store)
    }

    pub async fn close(&self) -> Result<(), ControllerError> {
        if let Some(controller) = &self.controller {
            controller.close().await.map_err(|e| log_failure("close", e))?;
        }
        Ok(())
    }

    /// Connect to a commissioned node
    ///
    /// The id may be a [`NodeId`], an integer, or its textual form (decimal,
    /// hex, or with a trailing `n`).
    pub async fn get_node(
        &self,
        node_id: impl Into<NodeRef>,
        options: Option<ConnectOptions>,
    ) -> Result<Arc<dyn PeerNode>, ControllerError> {
        let controller = self.controller()?;
        let node_ref = node_id.into();
        let id = node_ref.resolve()?;
        debug!("converting {} to {}", node_ref, id);

        controller
            .connect_node(id, options)
            .await
            .map_err(|e| log_failure("getNode", e))?
            .ok_or(ControllerError::NotConnected(node_ref))
    }

    /// Ids of every node this controller has commissioned
    ///
    /// Empty until the controller is initialized.
    pub async fn commissioned_nodes(&self) -> Result<Vec<NodeId>, ControllerError> {
        match &self.controller {
            Some(controller) => Ok(controller.commissioned_nodes().await?),
            None => Ok(Vec::new()),
        }
    }

    /// Find an endpoint anywhere in the endpoint tree of `node`
    pub fn get_endpoint(&self, node: &dyn PeerNode, number: u16) -> Option<Arc<dyn PeerEndpoint>> {
        find_endpoint(node.devices(), number)
    }

    fn controller(&self) -> Result<&Arc<dyn CommissioningController>, ControllerError> {
        self.controller.as_ref().ok_or(ControllerError::NotInitialized)
    }
}

fn check_network_interface(name: &str) {
    use network_interface::{NetworkInterface, NetworkInterfaceConfig};

    match NetworkInterface::show() {
        Ok(interfaces) if interfaces.iter().any(|iface| iface.name == name) => {
            info!(interface = %name, "MDNS restricted to network interface");
        }
        Ok(_) => warn!(interface = %name, "Network interface not found on this host"),
        Err(e) => warn!(error = %e, "Could not list network interfaces"),
    }
}
