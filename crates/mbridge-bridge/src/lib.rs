//! mbridge Bridge - Exposes devices as endpoints of one aggregated node
//!
//! [`Bridge`] owns the lifecycle of the node: identity resolution and legacy
//! storage detection at init, the registry of bridged devices, start, the
//! commissioning window and fabrics. The protocol itself is delegated to a
//! [`mbridge_stack::ProtocolStack`].

pub mod adapter;
pub mod bridge;
pub mod config;
mod error;

pub use adapter::DeviceAdapter;
pub use bridge::{Bridge, CommissioningState, APP_CONTEXT, LAST_START_KEY, UNIQUE_ID_KEY};
pub use config::BridgeConfig;
pub use error::BridgeError;
