//! mbridge Controller - Reaching commissioned peer nodes
//!
//! [`ControllerNode`] prepares controller storage (converting legacy
//! single-file stores), starts a commissioning controller and connects to
//! peers by node id. [`find_endpoint`] locates an endpoint anywhere inside a
//! peer's endpoint tree.

pub mod node;
pub mod resolve;

pub use node::{ControllerConfig, ControllerError, ControllerNode, NODE_CONTEXT};
pub use resolve::find_endpoint;
