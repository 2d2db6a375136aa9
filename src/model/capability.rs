use std::fmt;

use serde::{Serialize, Serializer};

/// Per-transport set of enabled (or supported) protocol applications
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u16);

impl Capabilities {
    pub const OTP: Capabilities = Capabilities(0x0001);
    pub const U2F: Capabilities = Capabilities(0x0002);
    pub const OPENPGP: Capabilities = Capabilities(0x0008);
    pub const PIV: Capabilities = Capabilities(0x0010);
    pub const OATH: Capabilities = Capabilities(0x0020);
    pub const HSMAUTH: Capabilities = Capabilities(0x0100);
    pub const FIDO2: Capabilities = Capabilities(0x0200);

    const NAMES: [(Capabilities, &'static str); 7] = [
        (Self::OTP, "OTP"),
        (Self::U2F, "U2F"),
        (Self::OPENPGP, "OPENPGP"),
        (Self::PIV, "PIV"),
        (Self::OATH, "OATH"),
        (Self::HSMAUTH, "HSMAUTH"),
        (Self::FIDO2, "FIDO2"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn union(self, other: Capabilities) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: Capabilities) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(cap, _)| self.contains(*cap))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Capabilities({})", names.join("|"))
    }
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let caps = Capabilities::OATH.union(Capabilities::FIDO2);
        assert!(caps.contains(Capabilities::OATH));
        assert!(caps.contains(Capabilities::FIDO2));
        assert!(!caps.contains(Capabilities::OTP));
        assert!(!caps.contains(Capabilities::empty()));
    }

    #[test]
    fn test_difference() {
        let caps = Capabilities::from_bits(0x023b).difference(Capabilities::OATH);
        assert!(!caps.contains(Capabilities::OATH));
        assert!(caps.contains(Capabilities::PIV));
    }

    #[test]
    fn test_debug_lists_names() {
        let caps = Capabilities::OTP.union(Capabilities::PIV);
        assert_eq!(format!("{:?}", caps), "Capabilities(OTP|PIV)");
    }
}
