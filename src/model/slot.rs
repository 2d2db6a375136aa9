use std::fmt;

use thiserror::Error;

/// YubiOTP configuration slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    One,
    Two,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::One, Slot::Two];

    pub fn number(self) -> u8 {
        match self {
            Slot::One => 1,
            Slot::Two => 2,
        }
    }

    pub fn from_number(number: u8) -> Result<Self, SlotError> {
        match number {
            1 => Ok(Slot::One),
            2 => Ok(Slot::Two),
            _ => Err(SlotError::Unsupported {
                slot: number.to_string(),
            }),
        }
    }

    pub fn other(self) -> Self {
        match self {
            Slot::One => Slot::Two,
            Slot::Two => Slot::One,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::One => write!(f, "one"),
            Slot::Two => write!(f, "two"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("Slot not supported: {slot}")]
    Unsupported { slot: String },
}

/// Touch/configuration flags of both OTP slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigState {
    flags: u8,
}

impl ConfigState {
    const SLOT1_VALID: u8 = 0x01;
    const SLOT2_VALID: u8 = 0x02;
    const SLOT1_TOUCH: u8 = 0x04;
    const SLOT2_TOUCH: u8 = 0x08;
    const LED_INV: u8 = 0x10;

    pub const fn from_flags(flags: u8) -> Self {
        Self { flags }
    }

    pub fn flags(self) -> u8 {
        self.flags
    }

    pub fn is_configured(self, slot: Slot) -> bool {
        let bit = match slot {
            Slot::One => Self::SLOT1_VALID,
            Slot::Two => Self::SLOT2_VALID,
        };
        self.flags & bit != 0
    }

    pub fn is_touch_triggered(self, slot: Slot) -> bool {
        let bit = match slot {
            Slot::One => Self::SLOT1_TOUCH,
            Slot::Two => Self::SLOT2_TOUCH,
        };
        self.flags & bit != 0
    }

    pub fn is_led_inverted(self) -> bool {
        self.flags & Self::LED_INV != 0
    }

    pub fn with_slot(self, slot: Slot, configured: bool, touch: bool) -> Self {
        let (valid, touch_bit) = match slot {
            Slot::One => (Self::SLOT1_VALID, Self::SLOT1_TOUCH),
            Slot::Two => (Self::SLOT2_VALID, Self::SLOT2_TOUCH),
        };
        let mut flags = self.flags & !(valid | touch_bit);
        if configured {
            flags |= valid;
        }
        if configured && touch {
            flags |= touch_bit;
        }
        Self { flags }
    }

    pub fn with_led_inverted(self, inverted: bool) -> Self {
        let flags = if inverted {
            self.flags | Self::LED_INV
        } else {
            self.flags & !Self::LED_INV
        };
        Self { flags }
    }
}
