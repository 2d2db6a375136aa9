//! Device identity as read from a key's management application

use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Serializer};

use super::{Capabilities, KeyType, Transport};

/// Firmware version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.major, self.minor, self.patch).serialize(serializer)
    }
}

/// Physical form factor reported by the key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FormFactor {
    #[default]
    Unknown,
    UsbAKeychain,
    UsbANano,
    UsbCKeychain,
    UsbCNano,
    UsbCLightning,
    UsbABio,
    UsbCBio,
}

impl FormFactor {
    pub fn code(self) -> u8 {
        match self {
            FormFactor::Unknown => 0x00,
            FormFactor::UsbAKeychain => 0x01,
            FormFactor::UsbANano => 0x02,
            FormFactor::UsbCKeychain => 0x03,
            FormFactor::UsbCNano => 0x04,
            FormFactor::UsbCLightning => 0x05,
            FormFactor::UsbABio => 0x06,
            FormFactor::UsbCBio => 0x07,
        }
    }
}

impl Serialize for FormFactor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

/// Mutable device configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DeviceConfig {
    pub enabled_capabilities: BTreeMap<Transport, Capabilities>,
    pub auto_eject_timeout: Option<u16>,
    pub challenge_response_timeout: Option<u8>,
    pub device_flags: Option<u8>,
}

/// Identity and capability snapshot of one key
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DeviceInfo {
    pub config: DeviceConfig,
    pub serial: Option<u32>,
    pub version: Version,
    pub form_factor: FormFactor,
    pub supported_capabilities: BTreeMap<Transport, Capabilities>,
    pub is_locked: bool,
    pub is_fips: bool,
    pub is_sky: bool,
}

impl DeviceInfo {
    /// Capabilities currently enabled over `transport`
    pub fn enabled(&self, transport: Transport) -> Capabilities {
        self.config
            .enabled_capabilities
            .get(&transport)
            .copied()
            .unwrap_or_default()
    }

    pub fn supports_transport(&self, transport: Transport) -> bool {
        self.supported_capabilities
            .get(&transport)
            .is_some_and(|caps| !caps.is_empty())
    }

    /// Human-readable product name
    pub fn display_name(&self, key_type: Option<KeyType>) -> String {
        let nfc = if self.supports_transport(Transport::Nfc) {
            " NFC"
        } else {
            ""
        };

        if key_type == Some(KeyType::Sky) || self.is_sky {
            return format!("Security Key{} by Yubico", nfc);
        }

        match key_type {
            Some(KeyType::Yks) => "YubiKey Standard".to_string(),
            Some(KeyType::Neo) => "YubiKey NEO".to_string(),
            Some(KeyType::Ykp) => "YubiKey Plus".to_string(),
            _ if self.version.major >= 5 => {
                let series = match self.form_factor {
                    FormFactor::UsbABio | FormFactor::UsbCBio => {
                        return format!("YubiKey Bio{}", fips(self));
                    }
                    FormFactor::UsbANano => "5 Nano",
                    FormFactor::UsbCKeychain => "5C",
                    FormFactor::UsbCNano => "5C Nano",
                    FormFactor::UsbCLightning => "5Ci",
                    FormFactor::UsbAKeychain | FormFactor::Unknown => "5",
                };
                format!("YubiKey {}{}{}", series, nfc, fips(self))
            }
            _ if self.version.major == 4 => format!("YubiKey 4{}", fips(self)),
            _ => "YubiKey".to_string(),
        }
    }
}

fn fips(info: &DeviceInfo) -> &'static str {
    if info.is_fips {
        " FIPS"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_v5(form_factor: FormFactor, nfc: bool) -> DeviceInfo {
        let mut supported = BTreeMap::new();
        supported.insert(Transport::Usb, Capabilities::OATH);
        if nfc {
            supported.insert(Transport::Nfc, Capabilities::OATH);
        }
        DeviceInfo {
            version: Version::new(5, 4, 3),
            form_factor,
            supported_capabilities: supported,
            ..DeviceInfo::default()
        }
    }

    #[test]
    fn test_version_ordering() {
        assert!(Version::new(5, 3, 0) > Version::new(5, 2, 7));
        assert!(Version::new(3, 0, 0) <= Version::new(3, 0, 0));
        assert_eq!(Version::new(5, 4, 3).to_string(), "5.4.3");
    }

    #[test]
    fn test_version_serialises_as_triple() {
        let value = serde_json::to_value(Version::new(5, 4, 3)).unwrap();
        assert_eq!(value, serde_json::json!([5, 4, 3]));
    }

    #[test]
    fn test_display_names() {
        let info = info_v5(FormFactor::UsbAKeychain, true);
        assert_eq!(info.display_name(Some(KeyType::Yk4)), "YubiKey 5 NFC");

        let info = info_v5(FormFactor::UsbCNano, false);
        assert_eq!(info.display_name(Some(KeyType::Yk4)), "YubiKey 5C Nano");

        let info = info_v5(FormFactor::UsbAKeychain, true);
        assert_eq!(
            info.display_name(Some(KeyType::Sky)),
            "Security Key NFC by Yubico"
        );

        let info = DeviceInfo {
            version: Version::new(3, 4, 0),
            ..DeviceInfo::default()
        };
        assert_eq!(info.display_name(Some(KeyType::Neo)), "YubiKey NEO");
        assert_eq!(info.display_name(None), "YubiKey");
    }

    #[test]
    fn test_enabled_defaults_to_empty() {
        let info = DeviceInfo::default();
        assert!(info.enabled(Transport::Nfc).is_empty());
    }
}
