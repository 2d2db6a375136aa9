//! Adapters - concrete implementations of ports (traits)

mod pcsc;
pub mod virtual_key;

// Re-export for convenience
pub use pcsc::PcscBackend;
pub use virtual_key::{VirtualBackend, VirtualKey};
