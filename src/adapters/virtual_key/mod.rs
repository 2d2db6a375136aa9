//! In-process simulated keys and readers
//!
//! [`VirtualBackend`] implements both scanner ports over a shared world of
//! [`VirtualKey`]s. Keys can be plugged, unplugged, inserted into readers and
//! made to fail mid-session, which makes every tree behaviour reproducible
//! without hardware.

mod key;
mod sessions;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

pub use key::{CaptureStep, OtpSlotConfig, VirtualKey};

use crate::error::{DeviceError, DeviceResult};
use crate::model::{
    Capabilities, ConnectionKind, CredentialData, DeviceInfo, HashAlgorithm, OathType, Slot,
    Transport, UsbInterfaces, UsbPid,
};
use crate::ports::{Connection, DeviceHandle, ReaderScanner, UsbScan, UsbScanner};
use sessions::{Link, VirtualConnection};

/// Identifier of a key within one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placement {
    Usb,
    Reader(String),
}

struct KeySlot {
    key: VirtualKey,
    placement: Placement,
    faulty: bool,
}

#[derive(Default)]
pub(crate) struct World {
    keys: BTreeMap<KeyId, KeySlot>,
    readers: Vec<String>,
    next_id: u64,
    bus_state: u64,
    bus_failure: bool,
    listings: usize,
    scans: usize,
}

impl World {
    fn add_key(&mut self, key: VirtualKey, placement: Placement) -> KeyId {
        self.next_id += 1;
        let id = KeyId(self.next_id);
        self.keys.insert(
            id,
            KeySlot {
                key,
                placement,
                faulty: false,
            },
        );
        id
    }

    fn usb_keys(&self) -> impl Iterator<Item = (KeyId, &VirtualKey)> {
        self.keys
            .iter()
            .filter(|(_, slot)| slot.placement == Placement::Usb)
            .map(|(id, slot)| (*id, &slot.key))
    }

    fn card_in(&self, reader: &str) -> Option<KeyId> {
        self.keys
            .iter()
            .find(|(_, slot)| matches!(&slot.placement, Placement::Reader(name) if name == reader))
            .map(|(id, _)| *id)
    }

    fn eject(&mut self, reader: &str) {
        if let Some(id) = self.card_in(reader) {
            self.keys.remove(&id);
        }
    }

    pub(crate) fn bump_bus_state(&mut self) {
        self.bus_state += 1;
    }

    /// The key behind `id`, if it is still attached and healthy
    pub(crate) fn reachable_mut(&mut self, id: KeyId) -> DeviceResult<&mut VirtualKey> {
        let slot = self
            .keys
            .get_mut(&id)
            .ok_or_else(|| DeviceError::transport("device removed"))?;
        if slot.faulty {
            return Err(DeviceError::transport("I/O error"));
        }
        Ok(&mut slot.key)
    }
}

/// Interfaces label used in the name of a key's own CCID reader
fn interfaces_label(interfaces: UsbInterfaces) -> String {
    [
        (UsbInterfaces::OTP, "OTP"),
        (UsbInterfaces::FIDO, "FIDO"),
        (UsbInterfaces::CCID, "CCID"),
    ]
    .into_iter()
    .filter(|(iface, _)| interfaces.contains(*iface))
    .map(|(_, label)| label)
    .collect::<Vec<_>>()
    .join("+")
}

/// First connection kind of `pid`, the one a bus listing finds the key on
fn primary_connection(pid: UsbPid) -> Option<ConnectionKind> {
    ConnectionKind::ALL
        .into_iter()
        .find(|kind| pid.interfaces().supports_connection(*kind))
}

#[derive(Debug, Clone)]
enum Location {
    Usb(KeyId),
    Reader(String),
}

/// Device handle into the virtual world
struct VirtualDevice {
    world: Arc<Mutex<World>>,
    location: Location,
    transport: Transport,
    pid: Option<UsbPid>,
    reader_name: Option<String>,
    kinds: Vec<ConnectionKind>,
}

impl VirtualDevice {
    fn resolve(&self) -> DeviceResult<KeyId> {
        let world = self.world.lock();
        match &self.location {
            Location::Usb(id) => Ok(*id),
            Location::Reader(name) => world
                .card_in(name)
                .ok_or_else(|| DeviceError::transport(format!("No card in reader {}", name))),
        }
    }
}

impl DeviceHandle for VirtualDevice {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn pid(&self) -> Option<UsbPid> {
        self.pid
    }

    fn reader_name(&self) -> Option<&str> {
        self.reader_name.as_deref()
    }

    fn supports_connection(&self, kind: ConnectionKind) -> bool {
        match &self.location {
            Location::Usb(_) => self.kinds.contains(&kind),
            Location::Reader(name) => match kind {
                ConnectionKind::SmartCard => true,
                ConnectionKind::Fido => {
                    let world = self.world.lock();
                    world
                        .card_in(name)
                        .and_then(|id| world.keys.get(&id))
                        .is_some_and(|slot| slot.key.fido.is_some())
                }
                ConnectionKind::Otp => false,
            },
        }
    }

    fn open_connection(&self, kind: ConnectionKind) -> DeviceResult<Box<dyn Connection>> {
        if !self.supports_connection(kind) {
            return Err(DeviceError::NotSupported {
                feature: format!("{} connection", kind),
            });
        }
        let id = self.resolve()?;
        self.world.lock().reachable_mut(id)?;
        debug!("Opening {} connection to virtual key {:?}", kind, id);
        let link = Link::new(self.world.clone(), id);
        Ok(Box::new(VirtualConnection::new(link, kind, self.transport)))
    }
}

/// Scanner over a shared set of simulated keys and readers
///
/// Cloning yields another handle to the same world.
#[derive(Clone, Default)]
pub struct VirtualBackend {
    world: Arc<Mutex<World>>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A populated world for interactive use
    pub fn demo() -> Self {
        let backend = Self::new();

        let mut totp = CredentialData::new(
            "alice@example.com".to_string(),
            OathType::Totp,
            HashAlgorithm::Sha1,
            b"Hello!\xde\xad\xbe\xef".to_vec(),
        );
        totp.issuer = Some("Example".to_string());
        let hotp = CredentialData::new(
            "counter".to_string(),
            OathType::Hotp,
            HashAlgorithm::Sha256,
            b"12345678901234567890".to_vec(),
        );

        backend.plug_usb(
            VirtualKey::yubikey5(Some(12345678))
                .with_oath_credential(totp, false)
                .with_oath_credential(hotp, true)
                .with_otp_slot(Slot::Two, OtpSlotConfig::challenge_response(b"challenge-secret", false))
                .with_resident_credential("example.com", "alice")
                .with_resident_credential("github.com", "alice"),
        );
        backend.plug_usb(
            VirtualKey::bio(Some(23456789))
                .with_fido_pin("123456")
                .with_fingerprint(Some("right index")),
        );
        backend.insert_card(
            "ACS ACR1252 Dual Reader PICC",
            VirtualKey::yubikey5(Some(34567890)),
        );
        backend
    }

    /// Attach `key` over USB
    pub fn plug_usb(&self, key: VirtualKey) -> KeyId {
        let mut world = self.world.lock();
        let id = world.add_key(key, Placement::Usb);
        world.bump_bus_state();
        info!("Plugged virtual key {:?}", id);
        id
    }

    pub fn unplug(&self, id: KeyId) {
        let mut world = self.world.lock();
        if world.keys.remove(&id).is_some() {
            world.bump_bus_state();
            info!("Unplugged virtual key {:?}", id);
        }
    }

    pub fn add_reader(&self, name: &str) {
        let mut world = self.world.lock();
        if !world.readers.iter().any(|reader| reader == name) {
            world.readers.push(name.to_string());
        }
    }

    /// Remove a reader together with any card in it
    pub fn remove_reader(&self, name: &str) {
        let mut world = self.world.lock();
        world.eject(name);
        world.readers.retain(|reader| reader != name);
    }

    /// Place `key` in `reader`, adding the reader if needed and replacing any
    /// card already present
    pub fn insert_card(&self, reader: &str, key: VirtualKey) -> KeyId {
        self.add_reader(reader);
        let mut world = self.world.lock();
        world.eject(reader);
        world.add_key(key, Placement::Reader(reader.to_string()))
    }

    pub fn remove_card(&self, reader: &str) {
        self.world.lock().eject(reader);
    }

    /// Make bus scans and listings fail
    pub fn set_bus_failure(&self, failing: bool) {
        self.world.lock().bus_failure = failing;
    }

    /// Make every I/O on `id` fail with a transport error
    pub fn set_fault(&self, id: KeyId, faulty: bool) {
        if let Some(slot) = self.world.lock().keys.get_mut(&id) {
            slot.faulty = faulty;
        }
    }

    /// Change the enabled capabilities of `id` in place, without re-enumeration
    pub fn set_enabled_capabilities(&self, id: KeyId, transport: Transport, caps: Capabilities) {
        if let Some(slot) = self.world.lock().keys.get_mut(&id) {
            slot.key
                .info
                .config
                .enabled_capabilities
                .insert(transport, caps);
        }
    }

    /// Snapshot of the key behind `id`
    pub fn key(&self, id: KeyId) -> Option<VirtualKey> {
        self.world.lock().keys.get(&id).map(|slot| slot.key.clone())
    }

    /// Number of full device listings served
    pub fn listing_count(&self) -> usize {
        self.world.lock().listings
    }

    /// Number of bus scans served
    pub fn scan_count(&self) -> usize {
        self.world.lock().scans
    }

    fn usb_handle(&self, id: KeyId, pid: UsbPid, kinds: Vec<ConnectionKind>) -> Arc<dyn DeviceHandle> {
        Arc::new(VirtualDevice {
            world: self.world.clone(),
            location: Location::Usb(id),
            transport: Transport::Usb,
            pid: Some(pid),
            reader_name: None,
            kinds,
        })
    }
}

impl UsbScanner for VirtualBackend {
    fn scan_devices(&self) -> DeviceResult<UsbScan> {
        let mut world = self.world.lock();
        if world.bus_failure {
            return Err(DeviceError::transport("USB bus unavailable"));
        }
        world.scans += 1;
        let mut scan = UsbScan {
            state: world.bus_state,
            ..UsbScan::default()
        };
        for (_, key) in world.usb_keys() {
            *scan.pids.entry(key.pid).or_default() += 1;
        }
        Ok(scan)
    }

    fn list_all_devices(&self) -> DeviceResult<Vec<(Arc<dyn DeviceHandle>, DeviceInfo)>> {
        let keys: Vec<(KeyId, UsbPid, DeviceInfo)> = {
            let mut world = self.world.lock();
            if world.bus_failure {
                return Err(DeviceError::transport("USB bus unavailable"));
            }
            world.listings += 1;
            world
                .usb_keys()
                .map(|(id, key)| (id, key.pid, key.info.clone()))
                .collect()
        };
        Ok(keys
            .into_iter()
            .filter_map(|(id, pid, info)| {
                let kind = primary_connection(pid)?;
                Some((self.usb_handle(id, pid, vec![kind]), info))
            })
            .collect())
    }

    fn connect_to_device(
        &self,
        serial: Option<u32>,
        kinds: &[ConnectionKind],
    ) -> DeviceResult<Box<dyn Connection>> {
        let candidates: Vec<(KeyId, UsbPid)> = {
            let world = self.world.lock();
            if world.bus_failure {
                return Err(DeviceError::transport("USB bus unavailable"));
            }
            world
                .usb_keys()
                .filter(|(_, key)| serial.is_none() || key.info.serial == serial)
                .filter(|(_, key)| {
                    kinds
                        .iter()
                        .any(|kind| key.pid.interfaces().supports_connection(*kind))
                })
                .map(|(id, key)| (id, key.pid))
                .collect()
        };

        let (id, pid) = match candidates.as_slice() {
            [] => return Err(DeviceError::NotFound),
            [single] => *single,
            _ => return Err(DeviceError::protocol("Multiple matching devices")),
        };
        let kind = kinds
            .iter()
            .copied()
            .find(|kind| pid.interfaces().supports_connection(*kind))
            .ok_or(DeviceError::NotFound)?;
        self.usb_handle(id, pid, vec![kind]).open_connection(kind)
    }
}

impl ReaderScanner for VirtualBackend {
    /// External readers plus the CCID reader every USB key with a smartcard
    /// interface exposes
    fn list_readers(&self) -> DeviceResult<Vec<Arc<dyn DeviceHandle>>> {
        let world = self.world.lock();
        let mut readers: Vec<Arc<dyn DeviceHandle>> = Vec::new();

        let own = world
            .usb_keys()
            .filter(|(_, key)| key.pid.interfaces().supports_connection(ConnectionKind::SmartCard));
        for (index, (id, key)) in own.enumerate() {
            readers.push(Arc::new(VirtualDevice {
                world: self.world.clone(),
                location: Location::Usb(id),
                transport: Transport::Usb,
                pid: Some(key.pid),
                reader_name: Some(format!(
                    "Yubico YubiKey {} {:02} 00",
                    interfaces_label(key.pid.interfaces()),
                    index
                )),
                kinds: vec![ConnectionKind::SmartCard],
            }));
        }

        for name in &world.readers {
            readers.push(Arc::new(VirtualDevice {
                world: self.world.clone(),
                location: Location::Reader(name.clone()),
                transport: Transport::Nfc,
                pid: None,
                reader_name: Some(name.clone()),
                kinds: vec![ConnectionKind::SmartCard, ConnectionKind::Fido],
            }));
        }
        Ok(readers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract_tests_for;
    use crate::ports::contract_tests::scanner_contract;

    fn populated() -> VirtualBackend {
        let backend = VirtualBackend::new();
        backend.plug_usb(VirtualKey::yubikey5(Some(100)));
        backend.plug_usb(VirtualKey::yubikey5(Some(101)));
        backend.plug_usb(VirtualKey::security_key());
        backend.insert_card("NFC Reader", VirtualKey::yubikey5(Some(102)));
        backend
    }

    contract_tests_for!(
        virtual_scanner_contract,
        make = populated,
        tests = {
            test_scan_is_stable => scanner_contract::test_scan_is_stable,
            test_listing_matches_scan => scanner_contract::test_listing_matches_scan,
            test_listed_devices_report_identity => scanner_contract::test_listed_devices_report_identity,
            test_connect_unknown_serial_fails => scanner_contract::test_connect_unknown_serial_fails,
            test_readers_are_uniquely_named => scanner_contract::test_readers_are_uniquely_named,
        }
    );

    #[test]
    fn test_fault_breaks_open_connections() {
        let backend = VirtualBackend::new();
        let id = backend.plug_usb(VirtualKey::yubikey5(Some(1)));
        let (device, _) = backend.list_all_devices().unwrap().remove(0);
        let mut connection = device.open_connection(ConnectionKind::SmartCard).unwrap();
        assert!(connection.read_info(None).is_ok());

        backend.set_fault(id, true);
        let err = connection.read_info(None).unwrap_err();
        assert!(matches!(err, DeviceError::Transport { .. }));

        backend.set_fault(id, false);
        connection.close();
        assert!(connection.read_info(None).is_err());
    }

    #[test]
    fn test_connect_by_serial_opens_other_interface() {
        let backend = VirtualBackend::new();
        backend.plug_usb(VirtualKey::yubikey5(Some(1)));
        backend.plug_usb(VirtualKey::yubikey5(Some(2)));

        let connection = backend
            .connect_to_device(Some(2), &[ConnectionKind::Otp])
            .unwrap();
        assert_eq!(connection.kind(), ConnectionKind::Otp);

        let err = backend
            .connect_to_device(None, &[ConnectionKind::Otp])
            .err()
            .unwrap();
        assert!(matches!(err, DeviceError::Protocol { .. }));
    }

    #[test]
    fn test_card_follows_reader() {
        let backend = VirtualBackend::new();
        backend.add_reader("Reader");
        let reader = backend.list_readers().unwrap().remove(0);
        assert!(!reader.supports_connection(ConnectionKind::Fido));
        assert!(reader.open_connection(ConnectionKind::SmartCard).is_err());

        backend.insert_card("Reader", VirtualKey::yubikey5(Some(3)));
        assert!(reader.supports_connection(ConnectionKind::Fido));
        let mut connection = reader.open_connection(ConnectionKind::SmartCard).unwrap();
        assert_eq!(connection.read_info(None).unwrap().serial, Some(3));

        backend.remove_card("Reader");
        assert!(connection.read_info(None).is_err());
    }

    #[test]
    fn test_plug_changes_scan_state() {
        let backend = VirtualBackend::new();
        let before = backend.scan_devices().unwrap();
        let id = backend.plug_usb(VirtualKey::security_key());
        let plugged = backend.scan_devices().unwrap();
        assert_ne!(before, plugged);
        assert_eq!(plugged.pids[&UsbPid::SKY_FIDO], 1);

        backend.unplug(id);
        assert!(backend.scan_devices().unwrap().pids.is_empty());
        assert_eq!(backend.scan_count(), 3);
    }

    #[test]
    fn test_demo_world() {
        let backend = VirtualBackend::demo();
        assert_eq!(backend.list_all_devices().unwrap().len(), 2);
        assert_eq!(backend.list_readers().unwrap().len(), 2);
    }
}
