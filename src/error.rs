//! Error types for the device tree
//!
//! Two layers, both built on thiserror:
//! - [`DeviceError`] is what collaborators (scanners, connections, protocol
//!   sessions) report.
//! - [`RpcError`] is what a tree request resolves to. Every variant maps to a
//!   stable [`ErrorKind`] that is sent to the caller.

use serde::Serialize;
use thiserror::Error;

use crate::model::{OathError, PinError};

/// Result type alias for tree operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Result type alias for collaborator operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Stable, caller-visible error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NoSuchNode,
    NoSuchAction,
    ActionNotApplicable,
    InvalidParams,
    AmbiguousDevice,
    PinRequired,
    Cancelled,
    DeviceError,
    NotSupported,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NoSuchNode => "no-such-node",
            ErrorKind::NoSuchAction => "no-such-action",
            ErrorKind::ActionNotApplicable => "action-not-applicable",
            ErrorKind::InvalidParams => "invalid-params",
            ErrorKind::AmbiguousDevice => "ambiguous-device",
            ErrorKind::PinRequired => "pin-required",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DeviceError => "device-error",
            ErrorKind::NotSupported => "not-supported",
        }
    }
}

/// Top-level error type for all tree requests
#[derive(Error, Debug)]
pub enum RpcError {
    /// Path segment does not (or no longer) resolve
    #[error("No such node: {name}")]
    NoSuchNode { name: String },

    /// Action is not defined on the node
    #[error("No such action: {name}")]
    NoSuchAction { name: String },

    /// Action is defined but gated off by current device state
    #[error("Action not applicable in current state: {name}")]
    ActionNotApplicable { name: String },

    /// Malformed or missing action parameters
    #[error("Invalid params: {reason}")]
    InvalidParams { reason: String },

    /// A connection request cannot be routed to a single physical device
    #[error("Unable to uniquely identify device for {connection} connection")]
    AmbiguousDevice { connection: String },

    /// PIN-gated subtree entered before a PIN was verified
    #[error("PIN required: {reason}")]
    PinRequired { reason: String },

    /// Feature acknowledged but not implemented
    #[error("Not supported: {feature}")]
    NotSupported { feature: String },

    /// Lower-layer failure
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// Errors reported by collaborators (transports and protocol sessions)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// I/O failure, card/reader exception or a device that went away
    #[error("Transport failure: {reason}")]
    Transport { reason: String },

    /// No attached device matched the request
    #[error("No matching YubiKey found")]
    NotFound,

    /// Device answered but refused or did not understand the command
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    /// Wrong PIN
    #[error("Invalid PIN: attempts remaining: {retries}")]
    PinInvalid { retries: u8 },

    /// PIN retries exhausted
    #[error("PIN is blocked")]
    PinBlocked,

    /// Fingerprint capture failed, carries the authenticator's sample status
    #[error("Fingerprint capture failed with code {code}")]
    Capture { code: u8 },

    /// Operation aborted by a cancellation request
    #[error("Operation cancelled")]
    Cancelled,

    /// Timed out waiting for user interaction
    #[error("Timed out waiting for user interaction")]
    Timeout,

    /// Operation not available on this device or adapter
    #[error("Not supported: {feature}")]
    NotSupported { feature: String },
}

impl DeviceError {
    pub fn transport(reason: impl Into<String>) -> Self {
        DeviceError::Transport {
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        DeviceError::Protocol {
            reason: reason.into(),
        }
    }
}

impl RpcError {
    pub fn no_such_node(name: impl Into<String>) -> Self {
        RpcError::NoSuchNode { name: name.into() }
    }

    pub fn no_such_action(name: impl Into<String>) -> Self {
        RpcError::NoSuchAction { name: name.into() }
    }

    pub fn invalid_params(reason: impl Into<String>) -> Self {
        RpcError::InvalidParams {
            reason: reason.into(),
        }
    }

    pub fn not_supported(feature: impl Into<String>) -> Self {
        RpcError::NotSupported {
            feature: feature.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::NoSuchNode { .. } => ErrorKind::NoSuchNode,
            RpcError::NoSuchAction { .. } => ErrorKind::NoSuchAction,
            RpcError::ActionNotApplicable { .. } => ErrorKind::ActionNotApplicable,
            RpcError::InvalidParams { .. } => ErrorKind::InvalidParams,
            RpcError::AmbiguousDevice { .. } => ErrorKind::AmbiguousDevice,
            RpcError::PinRequired { .. } => ErrorKind::PinRequired,
            RpcError::NotSupported { .. } => ErrorKind::NotSupported,
            RpcError::Device(DeviceError::Cancelled) => ErrorKind::Cancelled,
            RpcError::Device(DeviceError::NotSupported { .. }) => ErrorKind::NotSupported,
            RpcError::Device(_) => ErrorKind::DeviceError,
        }
    }

    /// True for faults that device nodes turn into child removal
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Device(DeviceError::Transport { .. }))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::invalid_params(err.to_string())
    }
}

impl From<hex::FromHexError> for RpcError {
    fn from(err: hex::FromHexError) -> Self {
        RpcError::invalid_params(format!("invalid hex: {}", err))
    }
}

impl From<OathError> for RpcError {
    fn from(err: OathError) -> Self {
        RpcError::invalid_params(err.to_string())
    }
}

impl From<PinError> for RpcError {
    fn from(err: PinError) -> Self {
        RpcError::invalid_params(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::no_such_node("ccid");
        assert_eq!(err.to_string(), "No such node: ccid");
    }

    #[test]
    fn test_device_error_conversion() {
        let err: RpcError = DeviceError::transport("reader removed").into();
        assert!(err.is_transport());
        assert_eq!(err.kind(), ErrorKind::DeviceError);
        assert!(err.to_string().contains("reader removed"));
    }

    #[test]
    fn test_cancelled_has_own_kind() {
        let err = RpcError::Device(DeviceError::Cancelled);
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!err.is_transport());
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(ErrorKind::NoSuchNode.as_str(), "no-such-node");
        assert_eq!(
            serde_json::to_value(ErrorKind::ActionNotApplicable).unwrap(),
            serde_json::json!("action-not-applicable")
        );
    }

    #[test]
    fn test_result_type_alias() {
        let result: RpcResult<i32> = Ok(42);
        assert_eq!(result.unwrap(), 42);

        let result: RpcResult<i32> = Err(RpcError::AmbiguousDevice {
            connection: "fido".to_string(),
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::AmbiguousDevice);
    }
}
