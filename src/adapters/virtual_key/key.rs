//! State of one simulated key

use std::collections::{BTreeMap, VecDeque};

use sha2::{Digest, Sha256};

use crate::model::{
    Capabilities, CredentialData, CredentialRecord, Ctap2Info, DeviceConfig, DeviceInfo,
    FormFactor, Slot, TemplateId, Transport, UsbPid, Version,
};

const FIDO_PIN_RETRIES: u8 = 8;
const MAX_RESIDENT_CREDENTIALS: u32 = 25;
const DEFAULT_ENROLL_SAMPLES: u32 = 4;

/// Outcome of one simulated fingerprint capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStep {
    Good,
    /// Bad sample carrying the authenticator's status code
    Fail(u8),
}

/// One programmed YubiOTP slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpSlotConfig {
    pub secret: Vec<u8>,
    pub touch: bool,
    pub acc_code: Option<Vec<u8>>,
}

impl OtpSlotConfig {
    pub fn challenge_response(secret: &[u8], touch: bool) -> Self {
        Self {
            secret: secret.to_vec(),
            touch,
            acc_code: None,
        }
    }

    pub fn with_access_code(mut self, acc_code: &[u8]) -> Self {
        self.acc_code = Some(acc_code.to_vec());
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BioState {
    pub templates: BTreeMap<TemplateId, Option<String>>,
    pub script: VecDeque<CaptureStep>,
    pub samples: u32,
    pub next_template: u16,
}

impl BioState {
    pub fn next_template_id(&mut self) -> TemplateId {
        self.next_template += 1;
        TemplateId::new(self.next_template.to_be_bytes().to_vec())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FidoState {
    pub pin: Option<String>,
    pub retries: u8,
    pub credentials: Vec<(String, CredentialRecord)>,
    pub bio: Option<BioState>,
}

impl FidoState {
    fn new(bio: bool) -> Self {
        Self {
            pin: None,
            retries: FIDO_PIN_RETRIES,
            credentials: Vec::new(),
            bio: bio.then(|| BioState {
                templates: BTreeMap::new(),
                script: VecDeque::new(),
                samples: DEFAULT_ENROLL_SAMPLES,
                next_template: 0,
            }),
        }
    }

    pub fn reset_retries(&mut self) {
        self.retries = FIDO_PIN_RETRIES;
    }

    pub fn max_remaining(&self) -> u32 {
        MAX_RESIDENT_CREDENTIALS.saturating_sub(self.credentials.len() as u32)
    }

    pub fn info(&self) -> Ctap2Info {
        let mut options = BTreeMap::new();
        options.insert("rk".to_string(), true);
        options.insert("up".to_string(), true);
        options.insert("plat".to_string(), false);
        options.insert("clientPin".to_string(), self.pin.is_some());
        options.insert("credMgmt".to_string(), true);
        if let Some(bio) = &self.bio {
            options.insert("uv".to_string(), !bio.templates.is_empty());
            options.insert("bioEnroll".to_string(), !bio.templates.is_empty());
        }
        Ctap2Info {
            versions: vec!["U2F_V2".to_string(), "FIDO_2_0".to_string(), "FIDO_2_1".to_string()],
            extensions: vec!["credProtect".to_string(), "hmac-secret".to_string()],
            aaguid: Sha256::digest(b"ykrpc virtual authenticator")[..16].to_vec(),
            options,
            max_msg_size: 1200,
            pin_uv_protocols: vec![2, 1],
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StoredOath {
    pub data: CredentialData,
    pub touch: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct OathStore {
    pub salt: Vec<u8>,
    pub access_key: Option<Vec<u8>>,
    pub credentials: Vec<StoredOath>,
}

impl OathStore {
    pub fn device_id(&self) -> String {
        hex::encode(&Sha256::digest(&self.salt)[..8])
    }

    pub fn find(&self, credential_id: &[u8]) -> Option<usize> {
        self.credentials
            .iter()
            .position(|stored| stored.data.id() == credential_id)
    }
}

/// A simulated YubiKey
///
/// Built with one of the product constructors and refined with the `with_*`
/// builders before being plugged into a [`super::VirtualBackend`].
#[derive(Debug, Clone)]
pub struct VirtualKey {
    pub(crate) pid: UsbPid,
    pub(crate) info: DeviceInfo,
    pub(crate) lock_code: Option<Vec<u8>>,
    pub(crate) fido: Option<FidoState>,
    pub(crate) oath: OathStore,
    pub(crate) otp: [Option<OtpSlotConfig>; 2],
    pub(crate) led_inverted: bool,
}

impl VirtualKey {
    fn new(pid: UsbPid, info: DeviceInfo, fido: Option<FidoState>) -> Self {
        let salt = Sha256::digest(format!("{:?}{}", info.serial, pid).as_bytes())[..8].to_vec();
        Self {
            pid,
            info,
            lock_code: None,
            fido,
            oath: OathStore {
                salt,
                access_key: None,
                credentials: Vec::new(),
            },
            otp: [None, None],
            led_inverted: false,
        }
    }

    /// YubiKey 5 NFC with every interface enabled
    pub fn yubikey5(serial: Option<u32>) -> Self {
        let all = Capabilities::OTP
            .union(Capabilities::U2F)
            .union(Capabilities::OPENPGP)
            .union(Capabilities::PIV)
            .union(Capabilities::OATH)
            .union(Capabilities::FIDO2);
        let caps: BTreeMap<Transport, Capabilities> =
            [(Transport::Usb, all), (Transport::Nfc, all)].into_iter().collect();
        let info = DeviceInfo {
            config: DeviceConfig {
                enabled_capabilities: caps.clone(),
                auto_eject_timeout: Some(0),
                challenge_response_timeout: Some(15),
                device_flags: Some(0),
            },
            serial,
            version: Version::new(5, 4, 3),
            form_factor: FormFactor::UsbAKeychain,
            supported_capabilities: caps,
            ..DeviceInfo::default()
        };
        Self::new(UsbPid::YK4_OTP_FIDO_CCID, info, Some(FidoState::new(false)))
    }

    /// Security Key NFC: FIDO only, no serial
    pub fn security_key() -> Self {
        let fido = Capabilities::U2F.union(Capabilities::FIDO2);
        let caps: BTreeMap<Transport, Capabilities> =
            [(Transport::Usb, fido), (Transport::Nfc, fido)].into_iter().collect();
        let info = DeviceInfo {
            config: DeviceConfig {
                enabled_capabilities: caps.clone(),
                ..DeviceConfig::default()
            },
            version: Version::new(5, 4, 3),
            form_factor: FormFactor::UsbAKeychain,
            supported_capabilities: caps,
            is_sky: true,
            ..DeviceInfo::default()
        };
        Self::new(UsbPid::SKY_FIDO, info, Some(FidoState::new(false)))
    }

    /// YubiKey Bio with fingerprint enrollment
    pub fn bio(serial: Option<u32>) -> Self {
        let fido = Capabilities::U2F.union(Capabilities::FIDO2);
        let caps: BTreeMap<Transport, Capabilities> = [(Transport::Usb, fido)].into_iter().collect();
        let info = DeviceInfo {
            config: DeviceConfig {
                enabled_capabilities: caps.clone(),
                ..DeviceConfig::default()
            },
            serial,
            version: Version::new(5, 5, 6),
            form_factor: FormFactor::UsbABio,
            supported_capabilities: caps,
            ..DeviceInfo::default()
        };
        Self::new(UsbPid::YK4_FIDO, info, Some(FidoState::new(true)))
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.info.version = version;
        self
    }

    /// Replace the product id, which decides the exposed USB interfaces
    pub fn with_pid(mut self, pid: UsbPid) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_enabled_capabilities(mut self, transport: Transport, caps: Capabilities) -> Self {
        self.info.config.enabled_capabilities.insert(transport, caps);
        self
    }

    pub fn with_fido_pin(mut self, pin: &str) -> Self {
        if let Some(fido) = &mut self.fido {
            fido.pin = Some(pin.to_string());
        }
        self
    }

    pub fn with_resident_credential(mut self, rp_id: &str, user_name: &str) -> Self {
        if let Some(fido) = &mut self.fido {
            let credential_id = Sha256::digest(format!("{}/{}", rp_id, user_name).as_bytes())[..16].to_vec();
            fido.credentials.push((
                rp_id.to_string(),
                CredentialRecord {
                    credential_id,
                    user_id: user_name.as_bytes().to_vec(),
                    user_name: user_name.to_string(),
                },
            ));
        }
        self
    }

    pub fn with_fingerprint(mut self, name: Option<&str>) -> Self {
        if let Some(bio) = self.fido.as_mut().and_then(|fido| fido.bio.as_mut()) {
            let id = bio.next_template_id();
            bio.templates.insert(id, name.map(str::to_string));
        }
        self
    }

    /// Outcomes of upcoming captures; one template needs as many good
    /// samples as the script contains
    pub fn with_capture_script(mut self, steps: Vec<CaptureStep>) -> Self {
        if let Some(bio) = self.fido.as_mut().and_then(|fido| fido.bio.as_mut()) {
            let goods = steps.iter().filter(|step| **step == CaptureStep::Good).count() as u32;
            bio.samples = goods.max(1);
            bio.script = steps.into();
        }
        self
    }

    pub fn with_otp_slot(mut self, slot: Slot, config: OtpSlotConfig) -> Self {
        self.otp[slot_index(slot)] = Some(config);
        self
    }

    pub fn with_led_inverted(mut self, inverted: bool) -> Self {
        self.led_inverted = inverted;
        self
    }

    pub fn with_oath_credential(mut self, data: CredentialData, touch: bool) -> Self {
        self.oath.credentials.push(StoredOath { data, touch });
        self
    }

    /// Protect the OATH application with a key derived from `password`
    pub fn with_oath_password(mut self, password: &str) -> Self {
        self.oath.access_key = Some(super::sessions::derive_oath_key(password, &self.oath.salt));
        self
    }

    pub fn with_lock_code(mut self, lock_code: &[u8]) -> Self {
        self.lock_code = Some(lock_code.to_vec());
        self.info.is_locked = true;
        self
    }

    pub fn serial(&self) -> Option<u32> {
        self.info.serial
    }

    pub fn pid(&self) -> UsbPid {
        self.pid
    }
}

pub(crate) fn slot_index(slot: Slot) -> usize {
    match slot {
        Slot::One => 0,
        Slot::Two => 1,
    }
}
