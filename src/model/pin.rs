use std::fmt;

use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// FIDO2 client PIN
///
/// Held in memory only while the owning FIDO2 node is alive; wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Pin(String);

impl Pin {
    /// Minimum length in Unicode code points
    pub const MIN_LENGTH: usize = 4;

    /// Maximum length in UTF-8 bytes
    pub const MAX_LENGTH: usize = 63;

    pub fn new(pin: String) -> Result<Self, PinError> {
        if pin.chars().count() < Self::MIN_LENGTH {
            return Err(PinError::TooShort);
        }
        if pin.len() > Self::MAX_LENGTH {
            return Err(PinError::TooLong);
        }
        Ok(Self(pin))
    }

    pub fn from_str(pin: &str) -> Result<Self, PinError> {
        Self::new(pin.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pin([REDACTED])")
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinError {
    #[error("PIN must be at least {min} characters", min = Pin::MIN_LENGTH)]
    TooShort,

    #[error("PIN must be at most {max} bytes", max = Pin::MAX_LENGTH)]
    TooLong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_valid() {
        assert!(Pin::from_str("1234").is_ok());
        assert!(Pin::from_str(&"9".repeat(63)).is_ok());
    }

    #[test]
    fn test_pin_too_short() {
        assert_eq!(Pin::from_str("123").unwrap_err(), PinError::TooShort);
    }

    #[test]
    fn test_pin_too_long() {
        assert_eq!(
            Pin::from_str(&"9".repeat(64)).unwrap_err(),
            PinError::TooLong
        );
    }

    #[test]
    fn test_pin_length_counts_code_points() {
        // four characters, eight bytes
        assert!(Pin::from_str("äöüß").is_ok());
    }

    #[test]
    fn test_pin_debug_redacted() {
        let pin = Pin::from_str("123456").unwrap();
        let debug_str = format!("{:?}", pin);
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("123456"));
    }
}
