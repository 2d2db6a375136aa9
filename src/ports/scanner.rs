use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Connection, DeviceHandle};
use crate::error::DeviceResult;
use crate::model::{ConnectionKind, DeviceInfo, UsbPid};

/// Result of a cheap USB bus probe
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct UsbScan {
    /// Number of attached devices per product id
    pub pids: BTreeMap<UsbPid, usize>,
    /// Raw state value, changes whenever the attached set changes
    pub state: u64,
}

impl UsbScan {
    /// Number of attached devices exposing the given connection kind
    pub fn count_supporting(&self, kind: ConnectionKind) -> usize {
        self.pids
            .iter()
            .filter(|(pid, _)| pid.interfaces().supports_connection(kind))
            .map(|(_, n)| n)
            .sum()
    }
}

/// Discovers YubiKeys attached over USB
pub trait UsbScanner: Send + Sync {
    fn scan_devices(&self) -> DeviceResult<UsbScan>;

    /// Every attached device together with its identity, read fresh
    fn list_all_devices(&self) -> DeviceResult<Vec<(Arc<dyn DeviceHandle>, DeviceInfo)>>;

    /// Resolve a device by serial (or by uniqueness when `None`) and open the
    /// first of `kinds` it supports
    fn connect_to_device(
        &self,
        serial: Option<u32>,
        kinds: &[ConnectionKind],
    ) -> DeviceResult<Box<dyn Connection>>;
}

/// Discovers smartcard readers (including NFC readers)
pub trait ReaderScanner: Send + Sync {
    /// All readers; every handle returns `Some` from `reader_name`
    fn list_readers(&self) -> DeviceResult<Vec<Arc<dyn DeviceHandle>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_supporting() {
        let mut scan = UsbScan::default();
        scan.pids.insert(UsbPid::YK4_OTP_FIDO_CCID, 2);
        scan.pids.insert(UsbPid::SKY_FIDO, 1);

        assert_eq!(scan.count_supporting(ConnectionKind::Fido), 3);
        assert_eq!(scan.count_supporting(ConnectionKind::SmartCard), 2);
        assert_eq!(UsbScan::default().count_supporting(ConnectionKind::Otp), 0);
    }
}
