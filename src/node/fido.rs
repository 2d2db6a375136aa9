//! FIDO2 subtree: PIN handling, discoverable credentials, fingerprints
//!
//! The verified PIN lives in [`Ctap2Node`] only. Entering `credentials` or
//! `fingerprints` derives a fresh permission-scoped token from it and moves
//! that token straight into the sub-protocol session.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use super::{available_actions, create_gated, defines_action, gated_children};
use super::{always, parse_params, to_data, ActionGate, ChildGate, Children, Data, Node, Params};
use crate::data;
use crate::error::{DeviceError, RpcError, RpcResult};
use crate::model::{CredentialRecord, Ctap2Info, Permission, Pin, RelyingParty, TemplateId};
use crate::ports::{BioEnrollment, CredentialManagement, Ctap2Session};
use crate::signal::ActionContext;

/// Relying party used when a PIN is verified without any real RP
const VERIFY_RP_ID: &str = "ykrpc.example.com";

#[derive(Debug, Deserialize)]
struct VerifyPinParams {
    pin: String,
}

#[derive(Debug, Deserialize)]
struct SetPinParams {
    pin: Option<String>,
    new_pin: String,
}

#[derive(Debug, Deserialize)]
struct AddParams {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RenameParams {
    name: String,
}

/// FIDO2 authenticator (`ctap2`)
pub struct Ctap2Node {
    session: Box<dyn Ctap2Session>,
    info: Ctap2Info,
    pin: Option<Pin>,
}

impl Ctap2Node {
    const ACTIONS: &'static [ActionGate<Ctap2Node>] = &[
        ActionGate {
            name: "reset",
            available: always,
        },
        ActionGate {
            name: "set_pin",
            available: always,
        },
        ActionGate {
            name: "verify_pin",
            available: always,
        },
    ];

    const CHILDREN: &'static [ChildGate<Ctap2Node>] = &[
        ChildGate {
            name: "credentials",
            visible: |node| node.info.supports_credential_management(),
            create: Ctap2Node::credentials,
        },
        ChildGate {
            name: "fingerprints",
            visible: |node| node.info.supports_bio_enrollment(),
            create: Ctap2Node::fingerprints,
        },
    ];

    pub fn new(mut session: Box<dyn Ctap2Session>) -> RpcResult<Self> {
        let info = session.info()?;
        Ok(Self {
            session,
            info,
            pin: None,
        })
    }

    fn verified_pin(&self) -> RpcResult<&Pin> {
        self.pin.as_ref().ok_or_else(|| RpcError::PinRequired {
            reason: "verify_pin must be called first".to_string(),
        })
    }

    fn credentials(&mut self) -> RpcResult<Box<dyn Node>> {
        let pin = self.verified_pin()?.clone();
        let token = self
            .session
            .get_pin_token(&pin, Permission::CredentialManagement, None)?;
        let credman = self.session.credential_management(token)?;
        Ok(Box::new(CredentialsNode::new(credman)?))
    }

    fn fingerprints(&mut self) -> RpcResult<Box<dyn Node>> {
        let pin = self.verified_pin()?.clone();
        let token = self.session.get_pin_token(&pin, Permission::BioEnroll, None)?;
        let bio = self.session.bio_enrollment(token)?;
        Ok(Box::new(FingerprintsNode::new(bio)?))
    }

    fn verify_pin(&mut self, params: VerifyPinParams) -> RpcResult<Data> {
        let pin = Pin::new(params.pin)?;
        // the token itself is discarded, only the PIN is kept
        self.session
            .get_pin_token(&pin, Permission::GetAssertion, Some(VERIFY_RP_ID))?;
        self.pin = Some(pin);
        debug!("FIDO2 PIN verified");
        Ok(data!())
    }

    fn set_pin(&mut self, params: SetPinParams) -> RpcResult<Data> {
        let new_pin = Pin::new(params.new_pin)?;
        self.info = self.session.info()?;
        if self.info.has_client_pin() {
            let pin = params
                .pin
                .ok_or_else(|| RpcError::invalid_params("pin is required to change the PIN"))?;
            self.session.change_pin(&Pin::new(pin)?, &new_pin)?;
        } else {
            self.session.set_pin(&new_pin)?;
        }
        self.pin = None;
        self.info = self.session.info()?;
        info!("FIDO2 PIN updated");
        Ok(data!())
    }
}

impl Node for Ctap2Node {
    fn data(&mut self) -> RpcResult<Data> {
        self.info = self.session.info()?;
        to_data(&self.info)
    }

    fn actions(&self) -> Vec<&'static str> {
        available_actions(self, Self::ACTIONS)
    }

    fn knows_action(&self, action: &str) -> bool {
        defines_action(Self::ACTIONS, action)
    }

    fn invoke(&mut self, action: &str, params: Params, _ctx: &ActionContext) -> RpcResult<Data> {
        match action {
            "reset" => Err(RpcError::not_supported("FIDO2 reset")),
            "verify_pin" => self.verify_pin(parse_params(params)?),
            "set_pin" => self.set_pin(parse_params(params)?),
            _ => Err(RpcError::no_such_action(action)),
        }
    }

    fn children(&mut self) -> RpcResult<Children> {
        Ok(gated_children(self, Self::CHILDREN))
    }

    fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        create_gated(self, Self::CHILDREN, name)
    }

    fn close(&mut self) {
        self.pin = None;
    }
}

/// Credential management session and the listings built from it
struct CredentialStore {
    credman: Box<dyn CredentialManagement>,
    rps: BTreeMap<String, RelyingParty>,
    creds: BTreeMap<String, BTreeMap<String, CredentialRecord>>,
}

impl CredentialStore {
    fn refresh_rps(&mut self) -> RpcResult<()> {
        let metadata = self.credman.metadata()?;
        self.rps = if metadata.existing == 0 {
            BTreeMap::new()
        } else {
            self.credman
                .enumerate_rps()?
                .into_iter()
                .map(|rp| (rp.rp_id.clone(), rp))
                .collect()
        };
        self.creds.retain(|rp_id, _| self.rps.contains_key(rp_id));
        Ok(())
    }

    /// Re-enumerate the relying parties, then the credentials of `rp_id`
    fn refresh_rp(&mut self, rp_id: &str) -> RpcResult<()> {
        self.refresh_rps()?;
        let Some(rp) = self.rps.get(rp_id) else {
            return Ok(());
        };
        let creds = self
            .credman
            .enumerate_creds(&rp.rp_id_hash)?
            .into_iter()
            .map(|cred| (cred.key(), cred))
            .collect();
        self.creds.insert(rp_id.to_string(), creds);
        Ok(())
    }

    fn credential(&self, rp_id: &str, key: &str) -> Option<&CredentialRecord> {
        self.creds.get(rp_id).and_then(|creds| creds.get(key))
    }
}

type SharedCredentials = Arc<Mutex<CredentialStore>>;

/// Relying parties with discoverable credentials (`credentials`)
pub struct CredentialsNode {
    store: SharedCredentials,
}

impl CredentialsNode {
    fn new(credman: Box<dyn CredentialManagement>) -> RpcResult<Self> {
        let mut store = CredentialStore {
            credman,
            rps: BTreeMap::new(),
            creds: BTreeMap::new(),
        };
        store.refresh_rps()?;
        Ok(Self {
            store: Arc::new(Mutex::new(store)),
        })
    }
}

impl Node for CredentialsNode {
    fn children(&mut self) -> RpcResult<Children> {
        self.store
            .lock()
            .rps
            .iter()
            .map(|(rp_id, rp)| Ok((rp_id.clone(), to_data(rp)?)))
            .collect()
    }

    fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        let rp = self
            .store
            .lock()
            .rps
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::no_such_node(name))?;
        self.store.lock().refresh_rp(&rp.rp_id)?;
        Ok(Box::new(RelyingPartyNode {
            store: self.store.clone(),
            rp,
        }))
    }
}

struct RelyingPartyNode {
    store: SharedCredentials,
    rp: RelyingParty,
}

impl Node for RelyingPartyNode {
    fn data(&mut self) -> RpcResult<Data> {
        to_data(&self.rp)
    }

    fn children(&mut self) -> RpcResult<Children> {
        let store = self.store.lock();
        match store.creds.get(&self.rp.rp_id) {
            Some(creds) => creds
                .iter()
                .map(|(key, cred)| Ok((key.clone(), to_data(cred)?)))
                .collect(),
            None => Ok(Children::new()),
        }
    }

    fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        if self.store.lock().credential(&self.rp.rp_id, name).is_none() {
            return Err(RpcError::no_such_node(name));
        }
        Ok(Box::new(CredentialNode {
            store: self.store.clone(),
            rp_id: self.rp.rp_id.clone(),
            key: name.to_string(),
        }))
    }
}

struct CredentialNode {
    store: SharedCredentials,
    rp_id: String,
    key: String,
}

impl CredentialNode {
    fn record(&self) -> RpcResult<CredentialRecord> {
        self.store
            .lock()
            .credential(&self.rp_id, &self.key)
            .cloned()
            .ok_or_else(|| RpcError::no_such_node(self.key.as_str()))
    }
}

impl Node for CredentialNode {
    fn data(&mut self) -> RpcResult<Data> {
        to_data(&self.record()?)
    }

    fn actions(&self) -> Vec<&'static str> {
        vec!["delete"]
    }

    fn invoke(&mut self, action: &str, _params: Params, _ctx: &ActionContext) -> RpcResult<Data> {
        match action {
            "delete" => {
                let record = self.record()?;
                let mut store = self.store.lock();
                store.credman.delete_cred(&record.credential_id)?;
                info!("Deleted credential {} for {}", self.key, self.rp_id);
                store.refresh_rp(&self.rp_id)?;
                Ok(data!())
            }
            _ => Err(RpcError::no_such_action(action)),
        }
    }
}

/// Bio enrollment session and the template listing
struct BioStore {
    bio: Box<dyn BioEnrollment>,
    templates: BTreeMap<TemplateId, Option<String>>,
}

impl BioStore {
    fn refresh(&mut self) -> RpcResult<()> {
        self.templates = self.bio.enumerate_enrollments()?;
        Ok(())
    }
}

type SharedBio = Arc<Mutex<BioStore>>;

/// Enrolled fingerprints (`fingerprints`)
pub struct FingerprintsNode {
    store: SharedBio,
}

impl FingerprintsNode {
    fn new(bio: Box<dyn BioEnrollment>) -> RpcResult<Self> {
        let mut store = BioStore {
            bio,
            templates: BTreeMap::new(),
        };
        store.refresh()?;
        Ok(Self {
            store: Arc::new(Mutex::new(store)),
        })
    }

    /// Interactive enrollment
    ///
    /// Each round signals `capture` with the remaining sample count, then
    /// waits for one sample. A bad sample signals `capture-error` and the
    /// round repeats. Cancellation is observed at every round boundary and
    /// inside the capture itself.
    fn add(&mut self, params: AddParams, ctx: &ActionContext) -> RpcResult<Data> {
        let mut enroller = self.store.lock().bio.enroll()?;

        let template_id = loop {
            if ctx.is_cancelled() {
                info!("Fingerprint enrollment cancelled");
                return Err(DeviceError::Cancelled.into());
            }
            ctx.signal("capture", data! { "remaining" => enroller.remaining() });
            match enroller.capture(&ctx.cancel) {
                Ok(Some(template_id)) => break template_id,
                Ok(None) => {}
                Err(DeviceError::Capture { code }) => {
                    debug!("Fingerprint capture failed with code {}", code);
                    ctx.signal("capture-error", data! { "code" => code });
                }
                Err(e) => return Err(e.into()),
            }
        };

        let mut store = self.store.lock();
        if let Some(name) = params.name.as_deref().filter(|name| !name.is_empty()) {
            store.bio.set_name(&template_id, name)?;
        }
        store.templates.insert(template_id.clone(), params.name.clone());
        info!("Enrolled fingerprint {}", template_id.to_hex());

        Ok(data! {
            "template_id" => template_id.to_hex(),
            "name" => params.name,
        })
    }
}

impl Node for FingerprintsNode {
    fn actions(&self) -> Vec<&'static str> {
        vec!["add"]
    }

    fn invoke(&mut self, action: &str, params: Params, ctx: &ActionContext) -> RpcResult<Data> {
        match action {
            "add" => self.add(parse_params(params)?, ctx),
            _ => Err(RpcError::no_such_action(action)),
        }
    }

    fn children(&mut self) -> RpcResult<Children> {
        Ok(self
            .store
            .lock()
            .templates
            .iter()
            .map(|(id, name)| (id.to_hex(), data! { "name" => name }))
            .collect())
    }

    fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        let template_id = TemplateId::from_hex(name).map_err(|_| RpcError::no_such_node(name))?;
        if !self.store.lock().templates.contains_key(&template_id) {
            return Err(RpcError::no_such_node(name));
        }
        Ok(Box::new(FingerprintNode {
            store: self.store.clone(),
            template_id,
        }))
    }
}

struct FingerprintNode {
    store: SharedBio,
    template_id: TemplateId,
}

impl FingerprintNode {
    fn name(&self) -> RpcResult<Option<String>> {
        self.store
            .lock()
            .templates
            .get(&self.template_id)
            .cloned()
            .ok_or_else(|| RpcError::no_such_node(self.template_id.to_hex()))
    }
}

impl Node for FingerprintNode {
    fn data(&mut self) -> RpcResult<Data> {
        Ok(data! {
            "template_id" => self.template_id.to_hex(),
            "name" => self.name()?,
        })
    }

    fn actions(&self) -> Vec<&'static str> {
        vec!["delete", "rename"]
    }

    fn invoke(&mut self, action: &str, params: Params, _ctx: &ActionContext) -> RpcResult<Data> {
        self.name()?;
        let mut store = self.store.lock();
        match action {
            "rename" => {
                let params: RenameParams = parse_params(params)?;
                store.bio.set_name(&self.template_id, &params.name)?;
                store.refresh()?;
                Ok(data!())
            }
            "delete" => {
                store.bio.remove_enrollment(&self.template_id)?;
                info!("Removed fingerprint {}", self.template_id.to_hex());
                store.refresh()?;
                Ok(data!())
            }
            _ => Err(RpcError::no_such_action(action)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::virtual_key::{CaptureStep, VirtualBackend, VirtualKey};
    use crate::model::ConnectionKind;
    use crate::ports::UsbScanner;
    use crate::signal::CancelToken;

    fn ctap2(key: VirtualKey) -> Ctap2Node {
        let backend = VirtualBackend::new();
        backend.plug_usb(key);
        let mut connection = backend
            .connect_to_device(None, &[ConnectionKind::Fido])
            .unwrap();
        Ctap2Node::new(connection.ctap2().unwrap()).unwrap()
    }

    fn recording_context() -> (ActionContext, Arc<Mutex<Vec<(String, Data)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |name: &str, body: Data| seen.lock().push((name.to_string(), body))
        };
        (ActionContext::new(CancelToken::new(), Arc::new(sink)), seen)
    }

    #[test]
    fn test_children_require_verified_pin() {
        let mut node = ctap2(VirtualKey::bio(Some(10)).with_fido_pin("1234"));
        assert!(node.children().unwrap().contains_key("fingerprints"));

        let err = node.create_child("fingerprints").err().unwrap();
        assert!(matches!(err, RpcError::PinRequired { .. }));
    }

    #[test]
    fn test_wrong_pin_is_not_kept() {
        let mut node = ctap2(VirtualKey::yubikey5(Some(11)).with_fido_pin("1234"));
        let ctx = ActionContext::detached();

        let err = node
            .invoke("verify_pin", data! { "pin" => "4321" }, &ctx)
            .unwrap_err();
        assert!(matches!(err, RpcError::Device(DeviceError::PinInvalid { .. })));
        assert!(node.pin.is_none());

        node.invoke("verify_pin", data! { "pin" => "1234" }, &ctx)
            .unwrap();
        assert!(node.create_child("credentials").is_ok());
    }

    #[test]
    fn test_reset_not_supported() {
        let mut node = ctap2(VirtualKey::yubikey5(Some(12)));
        let err = node
            .invoke("reset", Params::new(), &ActionContext::detached())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotSupported);
    }

    #[test]
    fn test_set_pin_then_change() {
        let mut node = ctap2(VirtualKey::yubikey5(Some(13)));
        let ctx = ActionContext::detached();
        assert!(!node.info.has_client_pin());

        node.invoke("set_pin", data! { "new_pin" => "123456" }, &ctx)
            .unwrap();
        assert!(node.info.has_client_pin());

        let err = node
            .invoke("set_pin", data! { "new_pin" => "654321" }, &ctx)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParams);

        node.invoke(
            "set_pin",
            data! { "pin" => "123456", "new_pin" => "654321" },
            &ctx,
        )
        .unwrap();
        node.invoke("verify_pin", data! { "pin" => "654321" }, &ctx)
            .unwrap();
    }

    #[test]
    fn test_enrollment_signals_errors_and_progress() {
        let key = VirtualKey::bio(Some(14))
            .with_fido_pin("1234")
            .with_capture_script(vec![
                CaptureStep::Fail(0x03),
                CaptureStep::Fail(0x05),
                CaptureStep::Good,
            ]);
        let mut node = ctap2(key);
        let ctx = ActionContext::detached();
        node.invoke("verify_pin", data! { "pin" => "1234" }, &ctx)
            .unwrap();
        let mut fingerprints = node.create_child("fingerprints").unwrap();

        let (ctx, seen) = recording_context();
        let result = fingerprints
            .invoke("add", data! { "name" => "thumb" }, &ctx)
            .unwrap();

        let seen = seen.lock();
        let errors: Vec<_> = seen.iter().filter(|(n, _)| n == "capture-error").collect();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].1["code"], 0x03);
        assert_eq!(errors[1].1["code"], 0x05);

        let progress: Vec<_> = seen.iter().filter(|(n, _)| n == "capture").collect();
        assert_eq!(progress.len(), 3);
        assert!(progress[0].1["remaining"].is_null());
        assert_eq!(seen[0].0, "capture");

        let template_id = result["template_id"].as_str().unwrap().to_string();
        assert_eq!(result["name"], "thumb");
        let children = fingerprints.children().unwrap();
        assert_eq!(children[&template_id]["name"], "thumb");
    }

    #[test]
    fn test_enrollment_cancelled_after_first_progress() {
        let key = VirtualKey::bio(Some(15))
            .with_fido_pin("1234")
            .with_capture_script(vec![CaptureStep::Good, CaptureStep::Good]);
        let mut node = ctap2(key);
        node.invoke("verify_pin", data! { "pin" => "1234" }, &ActionContext::detached())
            .unwrap();
        let mut fingerprints = node.create_child("fingerprints").unwrap();
        let before = fingerprints.children().unwrap();

        let cancel = CancelToken::new();
        let sink = {
            let cancel = cancel.clone();
            move |name: &str, _: Data| {
                if name == "capture" {
                    cancel.cancel();
                }
            }
        };
        let ctx = ActionContext::new(cancel, Arc::new(sink));

        let err = fingerprints
            .invoke("add", Params::new(), &ctx)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
        assert_eq!(fingerprints.children().unwrap(), before);
    }

    #[test]
    fn test_delete_credential_refreshes_listing() {
        let key = VirtualKey::yubikey5(Some(16))
            .with_fido_pin("1234")
            .with_resident_credential("example.com", "alice")
            .with_resident_credential("example.com", "bob")
            .with_resident_credential("github.com", "carol");
        let mut node = ctap2(key);
        node.invoke("verify_pin", data! { "pin" => "1234" }, &ActionContext::detached())
            .unwrap();
        let mut credentials = node.create_child("credentials").unwrap();
        assert_eq!(credentials.children().unwrap().len(), 2);

        let mut rp = credentials.create_child("github.com").unwrap();
        let creds = rp.children().unwrap();
        assert_eq!(creds.len(), 1);
        let key = creds.keys().next().unwrap().clone();

        let mut cred = rp.create_child(&key).unwrap();
        cred.invoke("delete", Params::new(), &ActionContext::detached())
            .unwrap();

        assert!(rp.children().unwrap().is_empty());
        assert!(!credentials.children().unwrap().contains_key("github.com"));
        let err = cred.data().unwrap_err();
        assert!(matches!(err, RpcError::NoSuchNode { .. }));
    }
}
