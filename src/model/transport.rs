use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

/// Physical channel class to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Usb,
    Nfc,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Usb => write!(f, "usb"),
            Transport::Nfc => write!(f, "nfc"),
        }
    }
}

/// Kind of transport-level connection that can be opened to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionKind {
    SmartCard,
    Otp,
    Fido,
}

impl ConnectionKind {
    pub const ALL: [ConnectionKind; 3] = [
        ConnectionKind::SmartCard,
        ConnectionKind::Otp,
        ConnectionKind::Fido,
    ];
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::SmartCard => write!(f, "ccid"),
            ConnectionKind::Otp => write!(f, "otp"),
            ConnectionKind::Fido => write!(f, "fido"),
        }
    }
}

/// Set of USB interfaces a product exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UsbInterfaces(u8);

impl UsbInterfaces {
    pub const OTP: UsbInterfaces = UsbInterfaces(0x01);
    pub const FIDO: UsbInterfaces = UsbInterfaces(0x02);
    pub const CCID: UsbInterfaces = UsbInterfaces(0x04);
    pub const ALL: UsbInterfaces = UsbInterfaces(0x07);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: UsbInterfaces) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: UsbInterfaces) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn for_connection(kind: ConnectionKind) -> Self {
        match kind {
            ConnectionKind::SmartCard => Self::CCID,
            ConnectionKind::Otp => Self::OTP,
            ConnectionKind::Fido => Self::FIDO,
        }
    }

    pub fn supports_connection(self, kind: ConnectionKind) -> bool {
        self.contains(Self::for_connection(kind))
    }

    /// Decode a legacy (pre 5.0) mode code
    pub fn from_mode_code(code: u8) -> Option<Self> {
        let (otp, fido, ccid) = (Self::OTP, Self::FIDO, Self::CCID);
        match code & 0x07 {
            0 => Some(otp),
            1 => Some(ccid),
            2 => Some(otp.union(ccid)),
            3 => Some(fido),
            4 => Some(otp.union(fido)),
            5 => Some(fido.union(ccid)),
            6 => Some(Self::ALL),
            _ => None,
        }
    }
}

/// Product family, derived from the USB product id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// YubiKey Standard
    Yks,
    Neo,
    /// Security Key by Yubico
    Sky,
    /// YubiKey 4 and 5 series
    Yk4,
    /// YubiKey Plus
    Ykp,
}

/// USB product id of a YubiKey
///
/// The id encodes both the product family and the set of enabled USB
/// interfaces, so interface visibility can be decided without any I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsbPid(u16);

impl UsbPid {
    pub const YKS_OTP: UsbPid = UsbPid(0x0010);
    pub const NEO_OTP: UsbPid = UsbPid(0x0110);
    pub const NEO_OTP_CCID: UsbPid = UsbPid(0x0111);
    pub const NEO_CCID: UsbPid = UsbPid(0x0112);
    pub const NEO_FIDO: UsbPid = UsbPid(0x0113);
    pub const NEO_OTP_FIDO: UsbPid = UsbPid(0x0114);
    pub const NEO_FIDO_CCID: UsbPid = UsbPid(0x0115);
    pub const NEO_OTP_FIDO_CCID: UsbPid = UsbPid(0x0116);
    pub const SKY_FIDO: UsbPid = UsbPid(0x0120);
    pub const YK4_OTP: UsbPid = UsbPid(0x0401);
    pub const YK4_FIDO: UsbPid = UsbPid(0x0402);
    pub const YK4_OTP_FIDO: UsbPid = UsbPid(0x0403);
    pub const YK4_CCID: UsbPid = UsbPid(0x0404);
    pub const YK4_OTP_CCID: UsbPid = UsbPid(0x0405);
    pub const YK4_FIDO_CCID: UsbPid = UsbPid(0x0406);
    pub const YK4_OTP_FIDO_CCID: UsbPid = UsbPid(0x0407);
    pub const YKP_OTP_FIDO: UsbPid = UsbPid(0x0410);

    pub const fn new(pid: u16) -> Self {
        Self(pid)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    pub fn key_type(self) -> Option<KeyType> {
        match self.0 {
            0x0010 => Some(KeyType::Yks),
            0x0110..=0x0116 => Some(KeyType::Neo),
            0x0120 => Some(KeyType::Sky),
            0x0401..=0x0407 => Some(KeyType::Yk4),
            0x0410 => Some(KeyType::Ykp),
            _ => None,
        }
    }

    pub fn interfaces(self) -> UsbInterfaces {
        let (otp, fido, ccid) = (UsbInterfaces::OTP, UsbInterfaces::FIDO, UsbInterfaces::CCID);
        match self.0 {
            0x0010 | 0x0110 | 0x0401 => otp,
            0x0111 | 0x0405 => otp.union(ccid),
            0x0112 | 0x0404 => ccid,
            0x0113 | 0x0120 | 0x0402 => fido,
            0x0114 | 0x0403 | 0x0410 => otp.union(fido),
            0x0115 | 0x0406 => fido.union(ccid),
            0x0116 | 0x0407 => UsbInterfaces::ALL,
            _ => UsbInterfaces::default(),
        }
    }

    /// Product id for a YubiKey 4/5 with the given interfaces enabled
    pub fn yk4_with(interfaces: UsbInterfaces) -> Option<Self> {
        match interfaces.bits() {
            0 => None,
            bits => Some(Self(0x0400 + bits as u16)),
        }
    }
}

impl Serialize for UsbPid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.0)
    }
}

impl fmt::Display for UsbPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_interfaces() {
        let ifaces = UsbPid::YK4_OTP_FIDO_CCID.interfaces();
        for kind in ConnectionKind::ALL {
            assert!(ifaces.supports_connection(kind));
        }

        let ifaces = UsbPid::SKY_FIDO.interfaces();
        assert!(ifaces.supports_connection(ConnectionKind::Fido));
        assert!(!ifaces.supports_connection(ConnectionKind::SmartCard));
        assert!(!ifaces.supports_connection(ConnectionKind::Otp));
    }

    #[test]
    fn test_pid_key_type() {
        assert_eq!(UsbPid::NEO_FIDO_CCID.key_type(), Some(KeyType::Neo));
        assert_eq!(UsbPid::YK4_CCID.key_type(), Some(KeyType::Yk4));
        assert_eq!(UsbPid::new(0xffff).key_type(), None);
    }

    #[test]
    fn test_yk4_pid_from_interfaces() {
        let pid = UsbPid::yk4_with(UsbInterfaces::OTP.union(UsbInterfaces::CCID)).unwrap();
        assert_eq!(pid, UsbPid::YK4_OTP_CCID);
        assert_eq!(UsbPid::yk4_with(UsbInterfaces::default()), None);
    }

    #[test]
    fn test_mode_codes() {
        assert_eq!(UsbInterfaces::from_mode_code(2), Some(UsbInterfaces::OTP.union(UsbInterfaces::CCID)));
        assert_eq!(UsbInterfaces::from_mode_code(6), Some(UsbInterfaces::ALL));
        assert_eq!(UsbInterfaces::from_mode_code(7), None);
    }

    #[test]
    fn test_transport_serialises_lowercase() {
        assert_eq!(
            serde_json::to_value(Transport::Nfc).unwrap(),
            serde_json::json!("nfc")
        );
    }
}
