//! PC/SC implementation of the scanner ports
//!
//! Uses the yubikey crate's PC/SC context. A YubiKey attached over USB shows
//! up as a reader named after its own CCID interface ("Yubico YubiKey
//! OTP+FIDO+CCID 00 00"); those readers form the USB device set, every reader
//! forms the reader set. Only smartcard connections are available, and the
//! identity read over them comes from the PIV application.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::{debug, warn};
use yubikey::{Context, YubiKey};

use crate::enumerate::YK_READER_NAME;
use crate::error::{DeviceError, DeviceResult};
use crate::model::{
    Capabilities, ConnectionKind, DeviceConfig, DeviceInfo, Transport, UsbInterfaces, UsbPid,
    Version,
};
use crate::ports::{
    Connection, Ctap2Session, DeviceHandle, ManagementSession, OathSession, ReaderScanner, UsbScan,
    UsbScanner, YubiOtpSession,
};

fn is_yubikey_reader(name: &str) -> bool {
    name.to_lowercase().contains(YK_READER_NAME)
}

/// Product id implied by the interface list in a YubiKey reader name
fn pid_from_reader_name(name: &str) -> Option<UsbPid> {
    let name = name.to_lowercase();
    let label = name.split_whitespace().nth(2)?;
    let interfaces = label
        .split('+')
        .fold(UsbInterfaces::default(), |ifaces, part| match part {
            "otp" => ifaces.union(UsbInterfaces::OTP),
            "fido" | "u2f" => ifaces.union(UsbInterfaces::FIDO),
            "ccid" => ifaces.union(UsbInterfaces::CCID),
            _ => ifaces,
        });
    UsbPid::yk4_with(interfaces)
}

fn context() -> DeviceResult<Context> {
    Context::open()
        .map_err(|e| DeviceError::transport(format!("Failed to open PC/SC context: {}", e)))
}

fn reader_names() -> DeviceResult<Vec<String>> {
    let mut context = context()?;
    let readers = context
        .iter()
        .map_err(|e| DeviceError::transport(format!("Failed to iterate readers: {}", e)))?;
    Ok(readers.map(|reader| reader.name().to_string()).collect())
}

fn open_reader(name: &str) -> DeviceResult<YubiKey> {
    let mut context = context()?;
    let readers = context
        .iter()
        .map_err(|e| DeviceError::transport(format!("Failed to iterate readers: {}", e)))?;
    for reader in readers {
        if reader.name() == name {
            return reader
                .open()
                .map_err(|e| DeviceError::transport(format!("Failed to open {}: {}", name, e)));
        }
    }
    Err(DeviceError::transport(format!("Reader {} is gone", name)))
}

fn identity(yubikey: &YubiKey, transport: Transport) -> DeviceInfo {
    let version = yubikey.version();
    let caps: BTreeMap<Transport, Capabilities> =
        [(transport, Capabilities::PIV)].into_iter().collect();
    DeviceInfo {
        config: DeviceConfig {
            enabled_capabilities: caps.clone(),
            ..DeviceConfig::default()
        },
        serial: Some(u32::from(yubikey.serial())),
        version: Version::new(version.major, version.minor, version.patch),
        supported_capabilities: caps,
        ..DeviceInfo::default()
    }
}

/// Smartcard connection through one PC/SC reader
struct PcscConnection {
    reader: String,
    transport: Transport,
    yubikey: Option<YubiKey>,
}

impl PcscConnection {
    fn unsupported<T>(application: &str) -> DeviceResult<T> {
        Err(DeviceError::NotSupported {
            feature: format!("{} over PC/SC", application),
        })
    }
}

impl Connection for PcscConnection {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::SmartCard
    }

    fn read_info(&mut self, _pid: Option<UsbPid>) -> DeviceResult<DeviceInfo> {
        let yubikey = self
            .yubikey
            .as_ref()
            .ok_or_else(|| DeviceError::transport("connection closed"))?;
        Ok(identity(yubikey, self.transport))
    }

    fn management(&mut self) -> DeviceResult<Box<dyn ManagementSession>> {
        Self::unsupported("management")
    }

    fn oath(&mut self) -> DeviceResult<Box<dyn OathSession>> {
        Self::unsupported("OATH")
    }

    fn ctap2(&mut self) -> DeviceResult<Box<dyn Ctap2Session>> {
        Self::unsupported("CTAP2")
    }

    fn yubiotp(&mut self) -> DeviceResult<Box<dyn YubiOtpSession>> {
        Self::unsupported("YubiOTP")
    }

    fn close(&mut self) {
        if self.yubikey.take().is_some() {
            debug!("Closed PC/SC connection to {}", self.reader);
        }
    }
}

/// One PC/SC reader, with or without a key in it
struct PcscDevice {
    reader: String,
    transport: Transport,
    pid: Option<UsbPid>,
}

impl PcscDevice {
    fn new(reader: String) -> Self {
        let (transport, pid) = if is_yubikey_reader(&reader) {
            (Transport::Usb, pid_from_reader_name(&reader))
        } else {
            (Transport::Nfc, None)
        };
        Self {
            reader,
            transport,
            pid,
        }
    }

    fn connect(&self) -> DeviceResult<PcscConnection> {
        Ok(PcscConnection {
            reader: self.reader.clone(),
            transport: self.transport,
            yubikey: Some(open_reader(&self.reader)?),
        })
    }
}

impl DeviceHandle for PcscDevice {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn pid(&self) -> Option<UsbPid> {
        self.pid
    }

    fn reader_name(&self) -> Option<&str> {
        Some(&self.reader)
    }

    fn supports_connection(&self, kind: ConnectionKind) -> bool {
        kind == ConnectionKind::SmartCard
    }

    fn open_connection(&self, kind: ConnectionKind) -> DeviceResult<Box<dyn Connection>> {
        if kind != ConnectionKind::SmartCard {
            return PcscConnection::unsupported(&format!("{} connection", kind));
        }
        Ok(Box::new(self.connect()?))
    }
}

/// Scanner backed by the system PC/SC service
#[derive(Debug, Clone, Default)]
pub struct PcscBackend;

impl PcscBackend {
    fn yubikey_readers(&self) -> DeviceResult<Vec<PcscDevice>> {
        Ok(reader_names()?
            .into_iter()
            .filter(|name| is_yubikey_reader(name))
            .map(PcscDevice::new)
            .collect())
    }
}

impl UsbScanner for PcscBackend {
    fn scan_devices(&self) -> DeviceResult<UsbScan> {
        let mut names: Vec<String> = reader_names()?
            .into_iter()
            .filter(|name| is_yubikey_reader(name))
            .collect();
        names.sort();

        let mut scan = UsbScan::default();
        for name in &names {
            if let Some(pid) = pid_from_reader_name(name) {
                *scan.pids.entry(pid).or_default() += 1;
            }
        }
        let mut hasher = DefaultHasher::new();
        names.hash(&mut hasher);
        scan.state = hasher.finish();
        Ok(scan)
    }

    fn list_all_devices(&self) -> DeviceResult<Vec<(Arc<dyn DeviceHandle>, DeviceInfo)>> {
        let mut devices: Vec<(Arc<dyn DeviceHandle>, DeviceInfo)> = Vec::new();
        for device in self.yubikey_readers()? {
            if device.pid.is_none() {
                continue;
            }
            match device.connect() {
                Ok(mut connection) => {
                    let info = connection.read_info(device.pid);
                    connection.close();
                    devices.push((Arc::new(device), info?));
                }
                Err(e) => warn!("Skipping {}: {}", device.reader, e),
            }
        }
        Ok(devices)
    }

    fn connect_to_device(
        &self,
        serial: Option<u32>,
        kinds: &[ConnectionKind],
    ) -> DeviceResult<Box<dyn Connection>> {
        if !kinds.contains(&ConnectionKind::SmartCard) {
            return PcscConnection::unsupported("non-smartcard connection");
        }

        let mut matches = Vec::new();
        for device in self.yubikey_readers()? {
            let Ok(mut connection) = device.connect() else {
                continue;
            };
            let info = connection.read_info(device.pid)?;
            if serial.is_none() || info.serial == serial {
                matches.push(connection);
            } else {
                connection.close();
            }
        }

        match matches.len() {
            0 => Err(DeviceError::NotFound),
            1 => Ok(Box::new(matches.remove(0))),
            _ => Err(DeviceError::protocol("Multiple matching devices")),
        }
    }
}

impl ReaderScanner for PcscBackend {
    fn list_readers(&self) -> DeviceResult<Vec<Arc<dyn DeviceHandle>>> {
        Ok(reader_names()?
            .into_iter()
            .map(|name| Arc::new(PcscDevice::new(name)) as Arc<dyn DeviceHandle>)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::contract_tests::scanner_contract;

    #[test]
    fn test_pid_from_reader_name() {
        assert_eq!(
            pid_from_reader_name("Yubico YubiKey OTP+FIDO+CCID 00 00"),
            Some(UsbPid::YK4_OTP_FIDO_CCID)
        );
        assert_eq!(
            pid_from_reader_name("Yubico YubiKey CCID 01 00"),
            Some(UsbPid::YK4_CCID)
        );
        assert_eq!(pid_from_reader_name("Yubico YubiKey"), None);
    }

    #[test]
    fn test_reader_classification() {
        assert!(is_yubikey_reader("Yubico YubiKey FIDO+CCID 00 00"));
        assert!(!is_yubikey_reader("ACS ACR1252 Dual Reader PICC"));

        let device = PcscDevice::new("ACS ACR1252 Dual Reader PICC".to_string());
        assert_eq!(device.transport(), Transport::Nfc);
        assert_eq!(device.pid(), None);
        assert!(device.supports_connection(ConnectionKind::SmartCard));
        assert!(!device.supports_connection(ConnectionKind::Fido));
    }

    #[test]
    #[cfg_attr(not(feature = "hardware-tests"), ignore)] // Requires a PC/SC service - enable with: --features hardware-tests
    fn test_scan_is_stable() {
        scanner_contract::test_scan_is_stable(PcscBackend);
    }

    #[test]
    #[cfg_attr(not(feature = "hardware-tests"), ignore)] // Requires YubiKey hardware - enable with: --features hardware-tests
    fn test_listing_matches_scan() {
        scanner_contract::test_listing_matches_scan(PcscBackend);
    }

    #[test]
    #[cfg_attr(not(feature = "hardware-tests"), ignore)] // Requires YubiKey hardware - enable with: --features hardware-tests
    fn test_listed_devices_report_identity() {
        scanner_contract::test_listed_devices_report_identity(PcscBackend);
    }

    #[test]
    #[cfg_attr(not(feature = "hardware-tests"), ignore)] // Requires a PC/SC service - enable with: --features hardware-tests
    fn test_connect_unknown_serial_fails() {
        scanner_contract::test_connect_unknown_serial_fails(PcscBackend);
    }

    #[test]
    #[cfg_attr(not(feature = "hardware-tests"), ignore)] // Requires a PC/SC service - enable with: --features hardware-tests
    fn test_readers_are_uniquely_named() {
        scanner_contract::test_readers_are_uniquely_named(PcscBackend);
    }
}
