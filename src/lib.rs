//! Hierarchical, capability-gated resource tree over attached YubiKeys
//!
//! The root exposes two enumerators: `usb` for directly attached keys and
//! `nfc` for smartcard readers. Below a device sit its connection kinds and
//! below those the protocol applications (management, OATH, FIDO2, YubiOTP).
//! Every node offers `get` and whatever actions its current device state
//! allows. [`rpc::serve`] drives the tree from line-delimited JSON.

pub mod adapters;
pub mod enumerate;
pub mod error;
pub mod model;
pub mod node;
pub mod ports;
pub mod rpc;
pub mod signal;

// Re-export commonly used types
pub use error::{DeviceError, ErrorKind, RpcError, RpcResult};
pub use node::{Data, DeviceTree, Params};
pub use signal::{ActionContext, CancelToken};
