//! Lifecycle of the aggregated bridge node

use mbridge_core::{
    log_failure, AttributeMap, BridgeEvent, DeviceInfo, DeviceType, EndpointId, NodeStorage,
    StorageContext, StorageService, UniqueId, DEFAULT_NODE_ID,
};
use mbridge_stack::{
    Aggregator, BasicInformation, CommissioningConfig, FabricInfo, PairingCodes,
    ProductDescription, ProtocolStack, ServerNode, ServerNodeConfig, StackError,
    AGGREGATOR_DEVICE_TYPE, ROOT_CONTEXT, ROOT_NUMBER_KEY,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::adapter::DeviceAdapter;
use crate::config::BridgeConfig;
use crate::error::BridgeError;

/// Context holding the bridge's own keys inside the node namespace
pub const APP_CONTEXT: &str = "bridge";
pub const UNIQUE_ID_KEY: &str = "basicInformation.uniqueId";
pub const LAST_START_KEY: &str = "lastStart";

const AGGREGATOR_ID: &str = "aggregator";

/// What a commissioner needs to pair with the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissioningState {
    pub pairing_codes: PairingCodes,
    pub commissioning_window_open: bool,
}

struct NodeHandle {
    server: Arc<dyn ServerNode>,
    aggregator: Arc<dyn Aggregator>,
}

/// Bridge-side view of the commissioning window
#[derive(Debug, Default)]
struct WindowState {
    open: bool,
    /// Bumped on every open so a stale notification cannot close a newer window
    generation: u64,
}

/// The aggregated bridge node and its registry of devices
pub struct Bridge {
    config: BridgeConfig,
    stack: Arc<dyn ProtocolStack>,
    storage: StorageService,
    node: RwLock<Option<NodeHandle>>,
    devices: RwLock<HashMap<EndpointId, DeviceAdapter>>,
    unique_id: RwLock<Option<UniqueId>>,
    window: Arc<Mutex<WindowState>>,
    event_tx: broadcast::Sender<BridgeEvent>,
}

impl Bridge {
    /// Create a bridge; nothing is read or written until [`Bridge::init`]
    pub fn new(config: BridgeConfig, stack: Arc<dyn ProtocolStack>) -> Self {
        info!(path = %config.storage_path.display(), "Device node storage location (directory)");
        let storage = StorageService::new(&config.storage_path);
        let (event_tx, _) = broadcast::channel(100);
        Self {
            config,
            stack,
            storage,
            node: RwLock::new(None),
            devices: RwLock::new(HashMap::new()),
            unique_id: RwLock::new(None),
            window: Arc::new(Mutex::new(WindowState::default())),
            event_tx,
        }
    }

    /// Subscribe to bridge events
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.event_tx.subscribe()
    }

    /// Unique id of the running node, while initialized
    pub async fn unique_id(&self) -> Option<UniqueId> {
        self.unique_id.read().await.clone()
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    fn node_storage(&self) -> Result<NodeStorage, BridgeError> {
        Ok(self.storage.open(DEFAULT_NODE_ID)?)
    }

    fn app_storage(&self) -> Result<StorageContext, BridgeError> {
        Ok(self.node_storage()?.context(APP_CONTEXT)?)
    }

    /// Whether the storage was written by a bridge that predates persisted ids
    ///
    /// Such a node has the stack's root marker but never recorded a start.
    pub async fn is_legacy_bridge(&self) -> Result<bool, BridgeError> {
        let root = self.node_storage()?.context(ROOT_CONTEXT)?;
        let app = self.app_storage()?;
        Ok(root.has(ROOT_NUMBER_KEY).await? && !app.has(LAST_START_KEY).await?)
    }

    /// Create the aggregated node and attach its aggregator
    ///
    /// Fails with [`BridgeError::AlreadyInitialized`] while a node is live;
    /// [`Bridge::initialize_bridge`] closes it first. On any other failure the
    /// bridge stays uninitialized.
    pub async fn init(&self) -> Result<(), BridgeError> {
        if self.node.read().await.is_some() {
            return Err(BridgeError::AlreadyInitialized);
        }

        let (node, unique_id) = self.build_node().await.map_err(|e| log_failure("init", e))?;
        *self.node.write().await = Some(node);
        *self.unique_id.write().await = Some(unique_id);
        Ok(())
    }

    async fn build_node(&self) -> Result<(NodeHandle, UniqueId), BridgeError> {
        let node_storage = self.node_storage()?;
        let app = node_storage.context(APP_CONTEXT)?;

        let unique_id = match app.get::<UniqueId>(UNIQUE_ID_KEY).await? {
            Some(id) => id,
            None if self.is_legacy_bridge().await? => UniqueId::legacy(),
            None => UniqueId::random(),
        };
        info!(unique_id = %unique_id, "Unique ID");

        let server = self
            .stack
            .create_server_node(self.server_node_config(&unique_id, node_storage))
            .await?;
        info!(id = %server.id(), "ServerNode created");

        match Self::attach_aggregator(&server, &app, &unique_id).await {
            Ok(aggregator) => Ok((NodeHandle { server, aggregator }, unique_id)),
            Err(e) => {
                if let Err(close_err) = server.close().await {
                    warn!(error = %close_err, "Failed to close partially initialized node");
                }
                Err(e)
            }
        }
    }

    async fn attach_aggregator(
        server: &Arc<dyn ServerNode>,
        app: &StorageContext,
        unique_id: &UniqueId,
    ) -> Result<Arc<dyn Aggregator>, BridgeError> {
        let aggregator = server.add_aggregator(AGGREGATOR_ID).await?;
        app.set(UNIQUE_ID_KEY, unique_id).await?;
        Ok(aggregator)
    }

    fn server_node_config(&self, unique_id: &UniqueId, storage: NodeStorage) -> ServerNodeConfig {
        let config = &self.config;
        ServerNodeConfig {
            id: DEFAULT_NODE_ID.to_string(),
            port: config.port,
            commissioning: CommissioningConfig {
                passcode: config.passcode,
                discriminator: config.discriminator,
            },
            product_description: ProductDescription {
                name: config.device_name.clone(),
                device_type: AGGREGATOR_DEVICE_TYPE,
            },
            basic_information: BasicInformation {
                vendor_name: config.vendor_name.clone(),
                vendor_id: config.vendor_id,
                node_label: config.product_name.clone(),
                product_name: config.product_name.clone(),
                product_label: config.product_name.clone(),
                product_id: config.product_id,
                serial_number: config.serial_number(),
                unique_id: unique_id.to_string(),
            },
            storage,
        }
    }

    /// Close the node, if any, and forget every registered device
    ///
    /// Safe to call repeatedly and before [`Bridge::init`].
    pub async fn close(&self) -> Result<(), BridgeError> {
        let node = self.node.write().await.take();
        let result = match node {
            Some(node) => match node.server.close().await {
                Ok(()) => Ok(()),
                Err(StackError::AlreadyClosed(id)) => {
                    debug!(id = %id, "Node was already closed");
                    Ok(())
                }
                Err(e) => Err(log_failure("close", e).into()),
            },
            None => Ok(()),
        };
        self.devices.write().await.clear();
        *self.unique_id.write().await = None;

        // A window never outlives its node
        let generation = self.window.lock().await.generation;
        mark_window_closed(&self.window, &self.event_tx, generation).await;
        result
    }

    /// Close and re-create the node, optionally starting from empty storage
    ///
    /// A reset erases everything the node persisted and gives the bridge a
    /// fresh unique id, so controllers see it as a new device.
    pub async fn initialize_bridge(&self, reset_storage: bool) -> Result<(), BridgeError> {
        info!("Closing bridge");
        self.close().await?;
        info!("Initializing bridge");
        self.init().await?;

        if reset_storage {
            warn!("!!! Erasing ServerNode storage !!!");
            let server = self
                .node
                .read()
                .await
                .as_ref()
                .map(|node| node.server.clone())
                .ok_or(BridgeError::NotInitialized)?;
            server.erase().await.map_err(|e| log_failure("initializeBridge", e))?;
            self.close().await?;

            let unique_id = UniqueId::random();
            self.app_storage()?.set(UNIQUE_ID_KEY, &unique_id).await?;
            self.init().await?;
        }

        info!("Bridge initialized");
        Ok(())
    }

    /// Register a device and attach its endpoint to the aggregator
    ///
    /// Nothing is registered unless every check passes and the stack accepts
    /// the endpoint.
    pub async fn add_endpoint(
        &self,
        device_type: &str,
        id: impl Into<EndpointId>,
        info: DeviceInfo,
        attributes: AttributeMap,
    ) -> Result<(), BridgeError> {
        let id = id.into();
        let aggregator = self
            .node
            .read()
            .await
            .as_ref()
            .map(|node| node.aggregator.clone());

        let mut devices = self.devices.write().await;
        if devices.contains_key(&id) {
            return Err(BridgeError::DeviceExists(id));
        }
        let aggregator = aggregator.ok_or(BridgeError::AggregatorNotInitialized)?;

        let device_type: DeviceType = device_type.parse()?;
        let definition = DeviceAdapter::definition(device_type, &id, &info, &attributes);
        let endpoint = aggregator
            .add_endpoint(definition)
            .await
            .map_err(|e| log_failure("addEndpoint", e))?;

        info!(id = %id, device_type = %device_type, "Registered device");
        devices.insert(id.clone(), DeviceAdapter::new(id, device_type, info, endpoint));
        Ok(())
    }

    /// Start the node and record the start time
    pub async fn start_bridge(&self) -> Result<(), BridgeError> {
        if self.devices.read().await.is_empty() {
            return Err(BridgeError::NoDevices);
        }
        let server = self.server().await?;

        info!("Endpoint structure:\n{}", server.describe());
        info!("Starting bridge");
        server.start().await.map_err(|e| log_failure("startBridge", e))?;
        info!("Bridge started");

        self.record_last_start()
            .await
            .map_err(|e| log_failure("startBridge", e))
    }

    /// Store the start time, strictly after any previously stored one
    async fn record_last_start(&self) -> Result<(), BridgeError> {
        let app = self.app_storage()?;
        let previous = app.get::<i64>(LAST_START_KEY).await?;
        let now = chrono::Utc::now().timestamp_millis();
        let last_start = match previous {
            Some(previous) if previous >= now => previous + 1,
            _ => now,
        };
        app.set(LAST_START_KEY, &last_start).await?;
        Ok(())
    }

    /// Forward an attribute change to a registered device
    ///
    /// Unknown ids are ignored.
    pub async fn set_endpoint_state(
        &self,
        id: &str,
        cluster: &str,
        attribute: &str,
        value: serde_json::Value,
    ) -> Result<(), BridgeError> {
        let devices = self.devices.read().await;
        let Some(device) = devices.get(&EndpointId::from(id)) else {
            debug!(id = %id, "State update for unknown device ignored");
            return Ok(());
        };
        device
            .update_state(cluster, attribute, value)
            .await
            .map_err(|e| log_failure("setEndpointState", e))?;
        Ok(())
    }

    /// Open a basic commissioning window
    ///
    /// When the window closes, whether by timeout, by a successful commissioning
    /// or through [`Bridge::close_commissioning_window`], a single
    /// `commissioningWindowClosed` event is emitted.
    pub async fn open_commissioning_window(&self) -> Result<(), BridgeError> {
        let server = self.server().await?;
        debug!("Opening basic commissioning window");
        let closed = server
            .open_basic_commissioning()
            .await
            .map_err(|e| log_failure("openCommissioningWindow", e))?;

        let generation = {
            let mut window = self.window.lock().await;
            window.generation += 1;
            window.open = true;
            window.generation
        };

        let window = self.window.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            closed.wait().await;
            mark_window_closed(&window, &event_tx, generation).await;
        });

        debug!("Basic commissioning window open");
        Ok(())
    }

    /// Close the commissioning window immediately
    pub async fn close_commissioning_window(&self) -> Result<(), BridgeError> {
        let server = self.server().await?;
        debug!("Closing basic commissioning window");
        server
            .end_commissioning()
            .await
            .map_err(|e| log_failure("closeCommissioningWindow", e))?;

        let generation = self.window.lock().await.generation;
        mark_window_closed(&self.window, &self.event_tx, generation).await;
        Ok(())
    }

    pub async fn commissioning_state(&self) -> Result<CommissioningState, BridgeError> {
        let commissioning = self.server().await?.commissioning();
        let in_commission = self.window.lock().await.open;
        Ok(CommissioningState {
            pairing_codes: commissioning.pairing_codes,
            commissioning_window_open: !commissioning.commissioned || in_commission,
        })
    }

    pub async fn fabrics(&self) -> Result<Vec<FabricInfo>, BridgeError> {
        Ok(self.server().await?.fabrics())
    }

    pub async fn remove_fabric(&self, fabric_index: u8) -> Result<(), BridgeError> {
        self.server()
            .await?
            .remove_fabric(fabric_index)
            .await
            .map_err(|e| log_failure("removeFabric", e))?;
        info!(fabric_index, "Removed fabric");
        Ok(())
    }

    async fn server(&self) -> Result<Arc<dyn ServerNode>, BridgeError> {
        self.node
            .read()
            .await
            .as_ref()
            .map(|node| node.server.clone())
            .ok_or(BridgeError::NotInitialized)
    }
}

/// Flip the window to closed and notify, once per opened window
async fn mark_window_closed(
    window: &Mutex<WindowState>,
    event_tx: &broadcast::Sender<BridgeEvent>,
    generation: u64,
) {
    let mut state = window.lock().await;
    if !state.open || state.generation != generation {
        return;
    }
    state.open = false;
    debug!("Commissioning window closed");
    // No subscribers is fine
    let _ = event_tx.send(BridgeEvent::commissioning_window_closed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbridge_core::{StorageError, COMMISSIONING_WINDOW_CLOSED};
    use mbridge_stack::loopback::LoopbackStack;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn test_bridge(temp_dir: &TempDir) -> (Bridge, LoopbackStack) {
        let stack = LoopbackStack::new();
        let config = BridgeConfig {
            storage_path: temp_dir.path().to_path_buf(),
            product_name: "Test Bridge".to_string(),
            product_id: 32768,
            ..Default::default()
        };
        (Bridge::new(config, Arc::new(stack.clone())), stack)
    }

    fn info(label: &str) -> DeviceInfo {
        DeviceInfo {
            node_label: label.to_string(),
            product_name: "Lamp".to_string(),
            product_label: "Lamp".to_string(),
            serial_number: format!("{}-1", label),
        }
    }

    fn app_context(temp_dir: &TempDir) -> StorageContext {
        StorageService::new(temp_dir.path())
            .open(DEFAULT_NODE_ID)
            .unwrap()
            .context(APP_CONTEXT)
            .unwrap()
    }

    fn root_context(temp_dir: &TempDir) -> StorageContext {
        StorageService::new(temp_dir.path())
            .open(DEFAULT_NODE_ID)
            .unwrap()
            .context(ROOT_CONTEXT)
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_does_no_io() {
        let temp_dir = TempDir::new().unwrap();
        let storage_path = temp_dir.path().join("bridge");
        let config = BridgeConfig {
            storage_path: storage_path.clone(),
            ..Default::default()
        };
        let _bridge = Bridge::new(config, Arc::new(LoopbackStack::new()));
        assert!(!storage_path.exists());
    }

    #[tokio::test]
    async fn test_init_builds_node_from_config() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);

        bridge.init().await.unwrap();

        let node = stack.last_server_node().unwrap();
        let config = node.config();
        assert_eq!(config.id, DEFAULT_NODE_ID);
        assert_eq!(config.port, 5540);
        assert_eq!(config.basic_information.serial_number, "Test Bridge-32768");
        assert_eq!(config.basic_information.node_label, "Test Bridge");
        assert_eq!(config.product_description.device_type, AGGREGATOR_DEVICE_TYPE);

        let unique_id = bridge.unique_id().await.unwrap();
        assert_eq!(unique_id.as_str().len(), 32);
        assert_eq!(config.basic_information.unique_id, unique_id.as_str());
        let stored: Option<UniqueId> = app_context(&temp_dir).get(UNIQUE_ID_KEY).await.unwrap();
        assert_eq!(stored, Some(unique_id));
    }

    #[tokio::test]
    async fn test_unique_id_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, _stack) = test_bridge(&temp_dir);
        bridge.initialize_bridge(false).await.unwrap();
        let first = bridge.unique_id().await.unwrap();

        let (restarted, _stack) = test_bridge(&temp_dir);
        restarted.initialize_bridge(false).await.unwrap();
        assert_eq!(restarted.unique_id().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_reset_yields_new_unique_id() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.initialize_bridge(false).await.unwrap();
        let before = bridge.unique_id().await.unwrap();

        bridge.initialize_bridge(true).await.unwrap();
        let after = bridge.unique_id().await.unwrap();

        assert_ne!(before, after);
        assert_eq!(after.as_str().len(), 32);
        assert!(!stack.last_server_node().unwrap().is_closed());
        // close, init, erase, close, init
        assert_eq!(stack.server_nodes_created(), 3);
    }

    #[tokio::test]
    async fn test_legacy_detection() {
        // marker, no last start
        let temp_dir = TempDir::new().unwrap();
        let (bridge, _stack) = test_bridge(&temp_dir);
        root_context(&temp_dir).set(ROOT_NUMBER_KEY, &0).await.unwrap();
        assert!(bridge.is_legacy_bridge().await.unwrap());

        // marker and last start
        app_context(&temp_dir).set(LAST_START_KEY, &1).await.unwrap();
        assert!(!bridge.is_legacy_bridge().await.unwrap());

        // no marker, last start
        root_context(&temp_dir).delete(ROOT_NUMBER_KEY).await.unwrap();
        assert!(!bridge.is_legacy_bridge().await.unwrap());

        // neither
        app_context(&temp_dir).delete(LAST_START_KEY).await.unwrap();
        assert!(!bridge.is_legacy_bridge().await.unwrap());
    }

    #[tokio::test]
    async fn test_legacy_bridge_keeps_default_id() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, _stack) = test_bridge(&temp_dir);
        root_context(&temp_dir).set(ROOT_NUMBER_KEY, &0).await.unwrap();

        bridge.init().await.unwrap();

        assert_eq!(bridge.unique_id().await.unwrap(), UniqueId::legacy());
    }

    #[tokio::test]
    async fn test_init_failure_leaves_bridge_uninitialized() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        stack.fail_next_create("no network");

        assert!(matches!(bridge.init().await, Err(BridgeError::Stack(_))));
        assert!(bridge.unique_id().await.is_none());
        assert!(matches!(
            bridge.add_endpoint("OnOffLight", "light-1", info("a"), AttributeMap::new()).await,
            Err(BridgeError::AggregatorNotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_reinit_is_rejected_and_keeps_node() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.init().await.unwrap();
        bridge
            .add_endpoint("OnOffLight", "l1", info("l1"), AttributeMap::new())
            .await
            .unwrap();
        let unique_id = bridge.unique_id().await.unwrap();
        stack.fail_next_create("boom");

        assert!(matches!(
            bridge.init().await,
            Err(BridgeError::AlreadyInitialized)
        ));

        assert_eq!(bridge.device_count().await, 1);
        assert_eq!(bridge.unique_id().await, Some(unique_id));
        assert!(bridge.commissioning_state().await.is_ok());
        assert!(!stack.last_server_node().unwrap().is_closed());
        assert_eq!(stack.server_nodes_created(), 1);
    }

    #[tokio::test]
    async fn test_failed_initialize_bridge_leaves_bridge_uninitialized() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.initialize_bridge(false).await.unwrap();
        stack.fail_next_create("boom");

        assert!(matches!(
            bridge.initialize_bridge(false).await,
            Err(BridgeError::Stack(_))
        ));
        assert!(bridge.unique_id().await.is_none());
        assert!(matches!(
            bridge.commissioning_state().await,
            Err(BridgeError::NotInitialized)
        ));

        // The next attempt recovers
        bridge.initialize_bridge(false).await.unwrap();
        assert!(bridge.commissioning_state().await.is_ok());
    }

    #[tokio::test]
    async fn test_init_surfaces_corrupt_storage() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        let node_dir = temp_dir.path().join(DEFAULT_NODE_ID);
        std::fs::create_dir_all(&node_dir).unwrap();
        std::fs::write(node_dir.join(format!("{}.json", APP_CONTEXT)), "[]").unwrap();

        assert!(matches!(
            bridge.init().await,
            Err(BridgeError::Storage(StorageError::NotAnObject(_)))
        ));
        assert!(bridge.unique_id().await.is_none());
        assert_eq!(stack.server_nodes_created(), 0);
    }

    #[tokio::test]
    async fn test_start_surfaces_corrupt_last_start() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.init().await.unwrap();
        bridge
            .add_endpoint("OnOffLight", "light-1", info("a"), AttributeMap::new())
            .await
            .unwrap();
        app_context(&temp_dir).set(LAST_START_KEY, "yesterday").await.unwrap();

        assert!(matches!(
            bridge.start_bridge().await,
            Err(BridgeError::Storage(StorageError::JsonError(_)))
        ));
        assert!(stack.last_server_node().unwrap().is_started());
    }

    #[tokio::test]
    async fn test_distinct_registrations() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.init().await.unwrap();

        for id in ["light-1", "light-2", "plug-1"] {
            bridge
                .add_endpoint("OnOffLight", id, info(id), AttributeMap::new())
                .await
                .unwrap();
        }

        assert_eq!(bridge.device_count().await, 3);
        assert_eq!(stack.last_server_node().unwrap().endpoint_ids().len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.init().await.unwrap();
        bridge
            .add_endpoint("OnOffLight", "light-1", info("a"), AttributeMap::new())
            .await
            .unwrap();

        let err = bridge
            .add_endpoint("DimmableLight", "light-1", info("b"), AttributeMap::new())
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Device light-1 already exists! Call 'resetEndpoints' first and try again."
        );
        assert_eq!(bridge.device_count().await, 1);
        assert_eq!(stack.last_server_node().unwrap().endpoint_ids(), vec!["light-1"]);
    }

    #[tokio::test]
    async fn test_unsupported_device_type() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.init().await.unwrap();

        let err = bridge
            .add_endpoint("Toaster", "toaster-1", info("t"), AttributeMap::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Unsupported device type Toaster");
        assert_eq!(bridge.device_count().await, 0);
        assert!(stack.last_server_node().unwrap().endpoint_ids().is_empty());
    }

    #[tokio::test]
    async fn test_close_twice_clears_registry() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);

        // Never initialized
        bridge.close().await.unwrap();

        bridge.init().await.unwrap();
        bridge
            .add_endpoint("Fan", "fan-1", info("f"), AttributeMap::new())
            .await
            .unwrap();

        bridge.close().await.unwrap();
        bridge.close().await.unwrap();

        assert_eq!(bridge.device_count().await, 0);
        assert!(stack.last_server_node().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_close_tolerates_node_closed_by_stack() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.init().await.unwrap();

        stack.last_server_node().unwrap().close().await.unwrap();

        bridge.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_without_devices_fails() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.init().await.unwrap();

        let err = bridge.start_bridge().await.unwrap_err();

        assert_eq!(err.to_string(), "No devices added, not starting");
        assert!(!stack.last_server_node().unwrap().is_started());
        assert!(!app_context(&temp_dir).has(LAST_START_KEY).await.unwrap());
    }

    #[tokio::test]
    async fn test_last_start_strictly_increases() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.init().await.unwrap();
        bridge
            .add_endpoint("OnOffLight", "light-1", info("a"), AttributeMap::new())
            .await
            .unwrap();

        bridge.start_bridge().await.unwrap();
        let first: i64 = app_context(&temp_dir).get(LAST_START_KEY).await.unwrap().unwrap();
        bridge.start_bridge().await.unwrap();
        let second: i64 = app_context(&temp_dir).get(LAST_START_KEY).await.unwrap().unwrap();

        assert!(second > first);
        assert!(stack.last_server_node().unwrap().is_started());
        // A started bridge is no longer legacy
        assert!(!bridge.is_legacy_bridge().await.unwrap());
    }

    #[tokio::test]
    async fn test_set_endpoint_state() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.init().await.unwrap();
        let mut attributes = AttributeMap::new();
        attributes.insert("onOff.onOff".to_string(), json!(false));
        bridge
            .add_endpoint("OnOffLight", "light-1", info("a"), attributes)
            .await
            .unwrap();

        bridge
            .set_endpoint_state("light-1", "onOff", "onOff", json!(true))
            .await
            .unwrap();
        // Unknown ids are a no-op
        bridge
            .set_endpoint_state("missing", "onOff", "onOff", json!(true))
            .await
            .unwrap();

        let state = stack.last_server_node().unwrap().endpoint_state("light-1").unwrap();
        assert_eq!(state["onOff"]["onOff"], json!(true));
    }

    #[tokio::test]
    async fn test_window_closes_when_stack_expires_it() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.init().await.unwrap();
        let node = stack.last_server_node().unwrap();
        node.set_commissioned(true);
        let mut events = bridge.subscribe();

        assert!(!bridge.commissioning_state().await.unwrap().commissioning_window_open);

        bridge.open_commissioning_window().await.unwrap();
        assert!(bridge.commissioning_state().await.unwrap().commissioning_window_open);

        node.expire_commissioning_window();
        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        assert_eq!(event.event_name(), COMMISSIONING_WINDOW_CLOSED);
        assert!(!bridge.commissioning_state().await.unwrap().commissioning_window_open);
    }

    #[tokio::test]
    async fn test_explicit_close_emits_one_event() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.init().await.unwrap();
        stack.last_server_node().unwrap().set_commissioned(true);
        let mut events = bridge.subscribe();

        bridge.open_commissioning_window().await.unwrap();
        bridge.close_commissioning_window().await.unwrap();

        assert!(!bridge.commissioning_state().await.unwrap().commissioning_window_open);
        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        assert_eq!(event.event_name(), COMMISSIONING_WINDOW_CLOSED);
        // The stack's own notification for the same window is swallowed
        assert!(timeout(Duration::from_millis(100), events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_close_resets_open_window() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.init().await.unwrap();
        let mut events = bridge.subscribe();

        bridge.open_commissioning_window().await.unwrap();
        assert!(bridge.window.lock().await.open);

        bridge.close().await.unwrap();
        assert!(!bridge.window.lock().await.open);
        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        assert_eq!(event.event_name(), COMMISSIONING_WINDOW_CLOSED);
        assert!(timeout(Duration::from_millis(100), events.recv()).await.is_err());

        // A fresh node starts with the window closed
        bridge.init().await.unwrap();
        stack.last_server_node().unwrap().set_commissioned(true);
        assert!(!bridge.commissioning_state().await.unwrap().commissioning_window_open);
    }

    #[tokio::test]
    async fn test_uncommissioned_bridge_reports_window_open() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, _stack) = test_bridge(&temp_dir);
        assert!(matches!(
            bridge.commissioning_state().await,
            Err(BridgeError::NotInitialized)
        ));

        bridge.init().await.unwrap();
        let state = bridge.commissioning_state().await.unwrap();
        assert!(state.commissioning_window_open);
        assert!(!state.pairing_codes.manual_pairing_code.is_empty());
    }

    #[tokio::test]
    async fn test_fabric_operations() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, stack) = test_bridge(&temp_dir);
        bridge.init().await.unwrap();
        stack.last_server_node().unwrap().add_fabric(FabricInfo {
            fabric_index: 1,
            fabric_id: 0xabcd,
            node_id: 7,
            root_vendor_id: 0xfff1,
            label: "home".to_string(),
        });

        assert_eq!(bridge.fabrics().await.unwrap().len(), 1);
        bridge.remove_fabric(1).await.unwrap();
        assert!(bridge.fabrics().await.unwrap().is_empty());
        assert!(matches!(
            bridge.remove_fabric(1).await,
            Err(BridgeError::Stack(StackError::FabricNotFound(1)))
        ));
    }
}
