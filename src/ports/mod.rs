//! Ports (traits) for the hardware the tree talks to
//!
//! The tree depends on these abstractions only. Adapters provide them for
//! real PC/SC readers and for the in-process virtual key set.
//!
//! Three layers:
//! - scanners discover devices and report a raw state token,
//! - device handles open transport-level connections,
//! - connections hand out protocol sessions.

mod device;
mod scanner;
mod session;

#[cfg(test)]
pub mod contract_tests;

pub use device::{Connection, DeviceHandle};
pub use scanner::{ReaderScanner, UsbScan, UsbScanner};
pub use session::{
    BioEnrollment, CredentialManagement, Ctap2Session, FingerprintEnroller, ManagementSession,
    OathSession, YubiOtpSession,
};
