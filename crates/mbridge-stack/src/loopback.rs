//! In-process protocol stack
//!
//! Nodes created here never touch the network. They keep their endpoint tree,
//! commissioning window and fabrics in memory and persist the same root
//! context marker a real stack writes, so storage-driven behavior (identity
//! reuse, legacy detection, erase) can be exercised end to end.

use async_trait::async_trait;
use mbridge_core::NodeId;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::controller::{
    CommissioningController, ConnectOptions, ControllerEnvironment, ControllerFactory, PeerEndpoint,
    PeerNode,
};
use crate::server::{
    Aggregator, BridgedEndpoint, BridgedEndpointConfig, ClusterState, FabricInfo,
    NodeCommissioning, PairingCodes, ProtocolStack, ServerNode, ServerNodeConfig, WindowClosed,
    WindowCloser, ROOT_CONTEXT, ROOT_NUMBER_KEY,
};
use crate::StackError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not wedge the others
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct StackState {
    server_nodes: Vec<Arc<LoopbackServerNode>>,
    controllers: Vec<Arc<LoopbackController>>,
    peers: BTreeMap<NodeId, Arc<LoopbackPeerNode>>,
    fail_next_create: Option<String>,
    refuse_controllers: bool,
    fail_controller_start: Option<String>,
}

/// Shared handle to the in-process stack
#[derive(Clone, Default)]
pub struct LoopbackStack {
    state: Arc<Mutex<StackState>>,
}

impl LoopbackStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently created server node
    pub fn last_server_node(&self) -> Option<Arc<LoopbackServerNode>> {
        lock(&self.state).server_nodes.last().cloned()
    }

    pub fn server_nodes_created(&self) -> usize {
        lock(&self.state).server_nodes.len()
    }

    /// The most recently created controller
    pub fn last_controller(&self) -> Option<Arc<LoopbackController>> {
        lock(&self.state).controllers.last().cloned()
    }

    /// Make the next `create_server_node` call fail with the given message
    pub fn fail_next_create(&self, message: impl Into<String>) {
        lock(&self.state).fail_next_create = Some(message.into());
    }

    /// Make every `create_controller` call fail
    pub fn refuse_controllers(&self) {
        lock(&self.state).refuse_controllers = true;
    }

    /// Make `start` fail with the given message on controllers created from now on
    pub fn fail_controller_start(&self, message: impl Into<String>) {
        lock(&self.state).fail_controller_start = Some(message.into());
    }

    /// Register a commissioned peer reachable by controllers of this stack
    pub fn add_peer(&self, peer: LoopbackPeerNode) {
        let peer = Arc::new(peer);
        lock(&self.state).peers.insert(peer.node_id, peer);
    }
}

#[async_trait]
impl ProtocolStack for LoopbackStack {
    async fn create_server_node(
        &self,
        config: ServerNodeConfig,
    ) -> Result<Arc<dyn ServerNode>, StackError> {
        let injected = lock(&self.state).fail_next_create.take();
        if let Some(message) = injected {
            return Err(StackError::Other(message));
        }

        config
            .storage
            .context(ROOT_CONTEXT)?
            .set(ROOT_NUMBER_KEY, &0u16)
            .await?;

        info!(id = %config.id, port = config.port, "Created loopback server node");
        let node = Arc::new(LoopbackServerNode {
            config,
            state: Mutex::new(ServerState::default()),
        });
        lock(&self.state).server_nodes.push(node.clone());
        Ok(node)
    }
}

#[async_trait]
impl ControllerFactory for LoopbackStack {
    async fn create_controller(
        &self,
        environment: ControllerEnvironment,
    ) -> Result<Arc<dyn CommissioningController>, StackError> {
        let mut state = lock(&self.state);
        if state.refuse_controllers {
            return Err(StackError::Other("controller construction refused".to_string()));
        }
        let controller = Arc::new(LoopbackController {
            environment,
            peers: state.peers.clone(),
            fail_start: state.fail_controller_start.clone(),
            state: Mutex::new(ControllerState::default()),
        });
        state.controllers.push(controller.clone());
        Ok(controller)
    }
}

#[derive(Default)]
struct ServerState {
    aggregator: Option<Arc<LoopbackAggregator>>,
    started: bool,
    closed: bool,
    erased: bool,
    commissioned: bool,
    window: Option<WindowCloser>,
    fabrics: Vec<FabricInfo>,
}

/// Aggregated node living in memory
pub struct LoopbackServerNode {
    config: ServerNodeConfig,
    state: Mutex<ServerState>,
}

impl LoopbackServerNode {
    pub fn config(&self) -> &ServerNodeConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        lock(&self.state).started
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn is_erased(&self) -> bool {
        lock(&self.state).erased
    }

    pub fn is_window_open(&self) -> bool {
        lock(&self.state).window.is_some()
    }

    /// Ids of the endpoints attached to the aggregator, in attach order
    pub fn endpoint_ids(&self) -> Vec<String> {
        match &lock(&self.state).aggregator {
            Some(aggregator) => aggregator.endpoint_ids(),
            None => Vec::new(),
        }
    }

    /// Current attribute values of an attached endpoint
    pub fn endpoint_state(&self, id: &str) -> Option<ClusterState> {
        let aggregator = lock(&self.state).aggregator.clone()?;
        aggregator.endpoint(id).map(|e| e.state())
    }

    /// Let the commissioning window time out, as the stack's timer would
    pub fn expire_commissioning_window(&self) {
        if let Some(closer) = lock(&self.state).window.take() {
            debug!(id = %self.config.id, "Loopback commissioning window expired");
            closer.close();
        }
    }

    pub fn set_commissioned(&self, commissioned: bool) {
        lock(&self.state).commissioned = commissioned;
    }

    pub fn add_fabric(&self, fabric: FabricInfo) {
        let mut state = lock(&self.state);
        state.commissioned = true;
        state.fabrics.push(fabric);
    }
}

#[async_trait]
impl ServerNode for LoopbackServerNode {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn add_aggregator(&self, id: &str) -> Result<Arc<dyn Aggregator>, StackError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(StackError::Closed(self.config.id.clone()));
        }
        if state.aggregator.is_some() {
            return Err(StackError::EndpointExists(id.to_string()));
        }
        let aggregator = Arc::new(LoopbackAggregator {
            id: id.to_string(),
            endpoints: Mutex::new(Vec::new()),
        });
        state.aggregator = Some(aggregator.clone());
        Ok(aggregator)
    }

    fn describe(&self) -> String {
        let mut out = format!("{} (root)", self.config.id);
        if let Some(aggregator) = &lock(&self.state).aggregator {
            out.push_str(&format!("\n  {} (aggregator)", aggregator.id));
            for endpoint in lock(&aggregator.endpoints).iter() {
                out.push_str(&format!(
                    "\n    {} ({})",
                    endpoint.config.id, endpoint.config.device_type
                ));
            }
        }
        out
    }

    async fn start(&self) -> Result<(), StackError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(StackError::Closed(self.config.id.clone()));
        }
        state.started = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), StackError> {
        let window = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(StackError::AlreadyClosed(self.config.id.clone()));
            }
            state.closed = true;
            state.started = false;
            state.window.take()
        };
        if let Some(closer) = window {
            closer.close();
        }
        Ok(())
    }

    async fn erase(&self) -> Result<(), StackError> {
        {
            let mut state = lock(&self.state);
            state.closed = true;
            state.started = false;
            state.erased = true;
            state.fabrics.clear();
            state.commissioned = false;
        }
        self.config.storage.erase().await?;
        Ok(())
    }

    fn commissioning(&self) -> NodeCommissioning {
        let commissioning = &self.config.commissioning;
        NodeCommissioning {
            commissioned: lock(&self.state).commissioned,
            pairing_codes: PairingCodes {
                manual_pairing_code: format!(
                    "{:04}{:08}",
                    commissioning.discriminator, commissioning.passcode
                ),
                qr_pairing_code: format!(
                    "MT:LOOPBACK-{}-{}",
                    commissioning.discriminator, commissioning.passcode
                ),
            },
        }
    }

    async fn open_basic_commissioning(&self) -> Result<WindowClosed, StackError> {
        let (closer, closed) = WindowClosed::channel();
        let previous = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(StackError::Closed(self.config.id.clone()));
            }
            state.window.replace(closer)
        };
        if let Some(previous) = previous {
            previous.close();
        }
        Ok(closed)
    }

    async fn end_commissioning(&self) -> Result<(), StackError> {
        let window = lock(&self.state).window.take();
        if let Some(closer) = window {
            closer.close();
        }
        Ok(())
    }

    fn fabrics(&self) -> Vec<FabricInfo> {
        lock(&self.state).fabrics.clone()
    }

    async fn remove_fabric(&self, fabric_index: u8) -> Result<(), StackError> {
        let mut state = lock(&self.state);
        let before = state.fabrics.len();
        state.fabrics.retain(|f| f.fabric_index != fabric_index);
        if state.fabrics.len() == before {
            return Err(StackError::FabricNotFound(fabric_index));
        }
        if state.fabrics.is_empty() {
            state.commissioned = false;
        }
        Ok(())
    }
}

/// Aggregator endpoint of a loopback node
pub struct LoopbackAggregator {
    id: String,
    endpoints: Mutex<Vec<Arc<LoopbackEndpointServer>>>,
}

impl LoopbackAggregator {
    fn endpoint_ids(&self) -> Vec<String> {
        lock(&self.endpoints)
            .iter()
            .map(|e| e.config.id.clone())
            .collect()
    }

    fn endpoint(&self, id: &str) -> Option<Arc<LoopbackEndpointServer>> {
        lock(&self.endpoints)
            .iter()
            .find(|e| e.config.id == id)
            .cloned()
    }
}

#[async_trait]
impl Aggregator for LoopbackAggregator {
    async fn add_endpoint(
        &self,
        config: BridgedEndpointConfig,
    ) -> Result<Arc<dyn BridgedEndpoint>, StackError> {
        let mut endpoints = lock(&self.endpoints);
        if endpoints.iter().any(|e| e.config.id == config.id) {
            return Err(StackError::EndpointExists(config.id));
        }
        let endpoint = Arc::new(LoopbackEndpointServer {
            state: Mutex::new(config.initial_state.clone()),
            config,
        });
        endpoints.push(endpoint.clone());
        Ok(endpoint)
    }
}

/// Device endpoint attached to a loopback aggregator
pub struct LoopbackEndpointServer {
    config: BridgedEndpointConfig,
    state: Mutex<ClusterState>,
}

impl LoopbackEndpointServer {
    fn state(&self) -> ClusterState {
        lock(&self.state).clone()
    }
}

#[async_trait]
impl BridgedEndpoint for LoopbackEndpointServer {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn set_state(
        &self,
        cluster: &str,
        attribute: &str,
        value: serde_json::Value,
    ) -> Result<(), StackError> {
        let mut state = lock(&self.state);
        let attributes = state
            .get_mut(cluster)
            .ok_or_else(|| StackError::UnknownCluster {
                endpoint: self.config.id.clone(),
                cluster: cluster.to_string(),
            })?;
        attributes.insert(attribute.to_string(), value);
        Ok(())
    }
}

#[derive(Default)]
struct ControllerState {
    started: bool,
    closed: bool,
    last_connect_options: Option<ConnectOptions>,
}

/// Controller reaching the peers registered on its [`LoopbackStack`]
pub struct LoopbackController {
    environment: ControllerEnvironment,
    peers: BTreeMap<NodeId, Arc<LoopbackPeerNode>>,
    fail_start: Option<String>,
    state: Mutex<ControllerState>,
}

impl LoopbackController {
    pub fn environment(&self) -> &ControllerEnvironment {
        &self.environment
    }

    pub fn is_started(&self) -> bool {
        lock(&self.state).started
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn last_connect_options(&self) -> Option<ConnectOptions> {
        lock(&self.state).last_connect_options.clone()
    }
}

#[async_trait]
impl CommissioningController for LoopbackController {
    async fn start(&self) -> Result<(), StackError> {
        if let Some(message) = &self.fail_start {
            return Err(StackError::Other(message.clone()));
        }
        let mut state = lock(&self.state);
        state.started = true;
        state.closed = false;
        Ok(())
    }

    async fn close(&self) -> Result<(), StackError> {
        let mut state = lock(&self.state);
        state.started = false;
        state.closed = true;
        Ok(())
    }

    async fn connect_node(
        &self,
        node_id: NodeId,
        options: Option<ConnectOptions>,
    ) -> Result<Option<Arc<dyn PeerNode>>, StackError> {
        {
            let mut state = lock(&self.state);
            if !state.started {
                return Err(StackError::ControllerNotStarted);
            }
            state.last_connect_options = options;
        }
        Ok(self
            .peers
            .get(&node_id)
            .map(|peer| peer.clone() as Arc<dyn PeerNode>))
    }

    async fn commissioned_nodes(&self) -> Result<Vec<NodeId>, StackError> {
        Ok(self.peers.keys().copied().collect())
    }
}

/// A remote node with a fixed endpoint tree
#[derive(Debug)]
pub struct LoopbackPeerNode {
    node_id: NodeId,
    devices: Vec<Arc<LoopbackEndpoint>>,
}

impl LoopbackPeerNode {
    pub fn new(node_id: impl Into<NodeId>, devices: Vec<LoopbackEndpoint>) -> Self {
        Self {
            node_id: node_id.into(),
            devices: devices.into_iter().map(Arc::new).collect(),
        }
    }
}

impl PeerNode for LoopbackPeerNode {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn devices(&self) -> Vec<Arc<dyn PeerEndpoint>> {
        self.devices
            .iter()
            .map(|e| e.clone() as Arc<dyn PeerEndpoint>)
            .collect()
    }
}

/// Endpoint of a loopback peer
#[derive(Debug, Clone)]
pub struct LoopbackEndpoint {
    number: u16,
    children: Vec<Arc<LoopbackEndpoint>>,
}

impl LoopbackEndpoint {
    pub fn new(number: u16) -> Self {
        Self {
            number,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: LoopbackEndpoint) -> Self {
        self.children.push(Arc::new(child));
        self
    }
}

impl PeerEndpoint for LoopbackEndpoint {
    fn number(&self) -> u16 {
        self.number
    }

    fn child_endpoints(&self) -> Vec<Arc<dyn PeerEndpoint>> {
        self.children
            .iter()
            .map(|e| e.clone() as Arc<dyn PeerEndpoint>)
            .collect()
    }
}
