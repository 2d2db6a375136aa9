//! Protocol sessions, each created from an open [`super::Connection`]

use std::collections::BTreeMap;

use crate::error::DeviceResult;
use crate::model::{
    ConfigState, CredentialData, CredentialRecord, CredentialsMetadata, Ctap2Info, DeviceConfig,
    DeviceInfo, OathCode, OathCredential, OathInfo, Permission, Pin, PinToken, RelyingParty, Slot,
    TemplateId, Version,
};
use crate::signal::CancelToken;

pub trait ManagementSession: Send {
    fn version(&self) -> Version;

    fn read_device_info(&mut self) -> DeviceResult<DeviceInfo>;

    /// Firmware 5.0.0 and later
    fn write_device_config(
        &mut self,
        config: &DeviceConfig,
        reboot: bool,
        cur_lock_code: Option<&[u8]>,
        new_lock_code: Option<&[u8]>,
    ) -> DeviceResult<()>;

    /// Firmware before 5.0.0
    fn set_mode(
        &mut self,
        mode: u8,
        challenge_response_timeout: u8,
        auto_eject_timeout: u16,
    ) -> DeviceResult<()>;
}

pub trait OathSession: Send {
    fn info(&self) -> OathInfo;

    fn derive_key(&self, password: &str) -> Vec<u8>;

    fn validate(&mut self, key: &[u8]) -> DeviceResult<()>;

    /// Raw HMAC over `challenge` with the credential's secret
    fn calculate(&mut self, credential_id: &[u8], challenge: &[u8]) -> DeviceResult<Vec<u8>>;

    fn list_credentials(&mut self) -> DeviceResult<Vec<OathCredential>>;

    /// `timestamp` in unix seconds, now when `None`
    fn calculate_code(
        &mut self,
        credential: &OathCredential,
        timestamp: Option<u64>,
    ) -> DeviceResult<OathCode>;

    fn delete_credential(&mut self, credential_id: &[u8]) -> DeviceResult<()>;

    fn put_credential(
        &mut self,
        data: &CredentialData,
        require_touch: bool,
    ) -> DeviceResult<OathCredential>;
}

/// CTAP2 authenticator with client PIN support
pub trait Ctap2Session: Send {
    fn info(&mut self) -> DeviceResult<Ctap2Info>;

    fn get_pin_token(
        &mut self,
        pin: &Pin,
        permission: Permission,
        rp_id: Option<&str>,
    ) -> DeviceResult<PinToken>;

    fn set_pin(&mut self, new_pin: &Pin) -> DeviceResult<()>;

    fn change_pin(&mut self, pin: &Pin, new_pin: &Pin) -> DeviceResult<()>;

    /// Consumes a token derived with [`Permission::CredentialManagement`]
    fn credential_management(
        &mut self,
        token: PinToken,
    ) -> DeviceResult<Box<dyn CredentialManagement>>;

    /// Consumes a token derived with [`Permission::BioEnroll`]
    fn bio_enrollment(&mut self, token: PinToken) -> DeviceResult<Box<dyn BioEnrollment>>;
}

pub trait CredentialManagement: Send {
    fn metadata(&mut self) -> DeviceResult<CredentialsMetadata>;

    fn enumerate_rps(&mut self) -> DeviceResult<Vec<RelyingParty>>;

    fn enumerate_creds(&mut self, rp_id_hash: &[u8]) -> DeviceResult<Vec<CredentialRecord>>;

    fn delete_cred(&mut self, credential_id: &[u8]) -> DeviceResult<()>;
}

pub trait BioEnrollment: Send {
    fn enumerate_enrollments(&mut self) -> DeviceResult<BTreeMap<TemplateId, Option<String>>>;

    fn enroll(&mut self) -> DeviceResult<Box<dyn FingerprintEnroller>>;

    fn set_name(&mut self, template_id: &TemplateId, name: &str) -> DeviceResult<()>;

    fn remove_enrollment(&mut self, template_id: &TemplateId) -> DeviceResult<()>;
}

/// One in-progress fingerprint enrollment
pub trait FingerprintEnroller: Send {
    /// Good samples still needed, `None` before the first capture
    fn remaining(&self) -> Option<u32>;

    /// Wait for one sample
    ///
    /// `Ok(Some(id))` once the template is complete, `Ok(None)` after a good
    /// sample when more are needed, `Err(DeviceError::Capture { .. })` for a
    /// bad sample and `Err(DeviceError::Cancelled)` when `cancel` fires.
    fn capture(&mut self, cancel: &CancelToken) -> DeviceResult<Option<TemplateId>>;
}

pub trait YubiOtpSession: Send {
    fn version(&self) -> Version;

    fn config_state(&mut self) -> DeviceResult<ConfigState>;

    /// Exchange both slot configurations in a single command
    fn swap_slots(&mut self) -> DeviceResult<()>;

    fn delete_slot(&mut self, slot: Slot, acc_code: Option<&[u8]>) -> DeviceResult<()>;

    fn calculate_hmac_sha1(
        &mut self,
        slot: Slot,
        challenge: &[u8],
        cancel: &CancelToken,
    ) -> DeviceResult<Vec<u8>>;
}
