mod capability;
mod device_info;
mod fido;
mod oath;
mod pin;
mod slot;
mod transport;

pub use capability::Capabilities;
pub use device_info::{DeviceConfig, DeviceInfo, FormFactor, Version};
pub use fido::{
    CredentialRecord, CredentialsMetadata, Ctap2Info, Permission, PinToken, RelyingParty,
    TemplateId,
};
pub use oath::{
    decode_base32, CredentialData, HashAlgorithm, OathCode, OathCredential, OathError, OathInfo, OathType,
    DEFAULT_DIGITS, DEFAULT_PERIOD,
};
pub use pin::{Pin, PinError};
pub use slot::{ConfigState, Slot, SlotError};
pub use transport::{ConnectionKind, KeyType, Transport, UsbInterfaces, UsbPid};
