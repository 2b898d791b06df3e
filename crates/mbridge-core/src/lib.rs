//! mbridge Core - Shared types and storage
//!
//! This crate provides the foundational types for the mbridge system:
//! - Device type tags and the metadata of bridged devices
//! - Bridge identity and the events it emits
//! - Operational node ids of remote peers
//! - Directory-backed key-value storage and legacy storage conversion
//! - Diagnostic logging of delegated failures

pub mod device;
pub mod diagnostics;
pub mod event;
pub mod identity;
pub mod legacy;
pub mod node_id;
pub mod storage;

pub use device::{
    split_attribute_key, AttributeMap, DeviceInfo, DeviceProfile, DeviceType, EndpointId,
    UnknownDeviceType,
};
pub use diagnostics::log_failure;
pub use event::{BridgeEvent, TriggeredEvent, COMMISSIONING_WINDOW_CLOSED};
pub use identity::{UniqueId, DEFAULT_NODE_ID};
pub use legacy::{convert_legacy_storage, ConvertedStorage};
pub use node_id::{InvalidNodeId, NodeId, NodeRef};
pub use storage::{NodeStorage, StorageContext, StorageError, StorageService};
