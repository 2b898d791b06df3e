use mbridge_core::{EndpointId, StorageError, UnknownDeviceType};
use mbridge_stack::StackError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Device {0} already exists! Call 'resetEndpoints' first and try again.")]
    DeviceExists(EndpointId),
    #[error("Aggregator not initialized, aborting.")]
    AggregatorNotInitialized,
    #[error(transparent)]
    UnsupportedDeviceType(#[from] UnknownDeviceType),
    #[error("No devices added, not starting")]
    NoDevices,
    #[error("Bridge not initialized")]
    NotInitialized,
    #[error("Bridge already initialized, close it first")]
    AlreadyInitialized,
    #[error("Stack error: {0}")]
    Stack(#[from] StackError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
