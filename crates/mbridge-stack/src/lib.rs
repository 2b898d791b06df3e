//! mbridge Stack - Boundary to the Matter protocol stack
//!
//! The commissioning protocol, fabrics, sessions and the network transport all
//! live in the protocol stack. This crate describes the part of it that mbridge
//! drives:
//! - [`ProtocolStack`] / [`ServerNode`] for the aggregated bridge node
//! - [`ControllerFactory`] / [`CommissioningController`] for reaching peers
//!
//! With the `loopback` feature an in-process implementation is available for
//! tests and offline runs.

pub mod controller;
#[cfg(feature = "loopback")]
pub mod loopback;
pub mod server;

use mbridge_core::StorageError;
use thiserror::Error;

pub use controller::{
    CommissioningController, ConnectOptions, ControllerEnvironment, ControllerFactory, PeerEndpoint,
    PeerNode,
};
pub use server::{
    Aggregator, BasicInformation, BridgedEndpoint, BridgedEndpointConfig, ClusterState,
    CommissioningConfig, FabricInfo, NodeCommissioning, PairingCodes, ProductDescription,
    ProtocolStack, ServerNode, ServerNodeConfig, WindowClosed, WindowCloser,
    AGGREGATOR_DEVICE_TYPE, ROOT_CONTEXT, ROOT_NUMBER_KEY,
};

#[derive(Error, Debug)]
pub enum StackError {
    #[error("Node {0} is already closed")]
    AlreadyClosed(String),
    #[error("Node {0} is closed")]
    Closed(String),
    #[error("Endpoint {0} was already added")]
    EndpointExists(String),
    #[error("Endpoint {endpoint} has no cluster {cluster}")]
    UnknownCluster { endpoint: String, cluster: String },
    #[error("Fabric {0} not found")]
    FabricNotFound(u8),
    #[error("Controller is not started")]
    ControllerNotStarted,
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Other(String),
}
