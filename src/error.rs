//! Error kinds shared across the registry, transport, store and scheduler.
//!
//! See spec §7. Decode/transport failures that are expected in normal
//! operation are logged and swallowed at the call site rather than
//! propagated through this type — `BridgeError` covers the cases callers
//! actually need to branch on.

use thiserror::Error;

use crate::model::DeviceKind;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed BusPro frame")]
    DecodeError,

    #[error("UDP transport has no bound socket yet")]
    TransportNotReady,

    #[error("a {kind:?} device already exists at address {address}")]
    Conflict { kind: DeviceKind, address: String },

    #[error("no {kind:?} device at address {address}")]
    NotFound { kind: DeviceKind, address: String },

    #[error("validation failed: {0}")]
    ValidationError(String),

    #[error("persistence error: {0}")]
    PersistenceError(#[from] std::io::Error),

    #[error("MQTT client disconnected")]
    MqttDisconnected,
}

pub type BridgeResult<T> = Result<T, BridgeError>;
