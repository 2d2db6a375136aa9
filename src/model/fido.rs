//! FIDO2 value types shared by the ctap2 port and the tree

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Scope a PIN/UV auth token is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    MakeCredential,
    GetAssertion,
    CredentialManagement,
    BioEnroll,
    LargeBlobWrite,
    AuthenticatorConfig,
}

impl Permission {
    pub fn bits(self) -> u8 {
        match self {
            Permission::MakeCredential => 0x01,
            Permission::GetAssertion => 0x02,
            Permission::CredentialManagement => 0x04,
            Permission::BioEnroll => 0x08,
            Permission::LargeBlobWrite => 0x10,
            Permission::AuthenticatorConfig => 0x20,
        }
    }
}

/// PIN-derived, permission-scoped authorisation value
///
/// Returned by a derive call and moved straight into the operation that
/// needs it. Never stored by the tree.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PinToken {
    #[zeroize(skip)]
    permission: Permission,
    token: Vec<u8>,
}

impl PinToken {
    pub fn new(permission: Permission, token: Vec<u8>) -> Self {
        Self { permission, token }
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.token
    }
}

impl fmt::Debug for PinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PinToken({:?}, [REDACTED])", self.permission)
    }
}

/// Authenticator info as returned by authenticatorGetInfo
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Ctap2Info {
    pub versions: Vec<String>,
    pub extensions: Vec<String>,
    #[serde(serialize_with = "hex::serde::serialize")]
    pub aaguid: Vec<u8>,
    pub options: BTreeMap<String, bool>,
    pub max_msg_size: u32,
    pub pin_uv_protocols: Vec<u8>,
}

impl Ctap2Info {
    pub fn option(&self, name: &str) -> Option<bool> {
        self.options.get(name).copied()
    }

    pub fn has_client_pin(&self) -> bool {
        self.option("clientPin") == Some(true)
    }

    pub fn supports_credential_management(&self) -> bool {
        self.option("credMgmt") == Some(true) || self.option("credentialMgmtPreview") == Some(true)
    }

    /// Bio enrollment is supported when the option is present at all;
    /// `false` only means no template is enrolled yet.
    pub fn supports_bio_enrollment(&self) -> bool {
        self.option("bioEnroll").is_some() || self.option("userVerificationMgmtPreview").is_some()
    }
}

/// Discoverable credential counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CredentialsMetadata {
    pub existing: u32,
    pub max_remaining: u32,
}

/// Relying party with at least one discoverable credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelyingParty {
    pub rp_id: String,
    #[serde(serialize_with = "hex::serde::serialize")]
    pub rp_id_hash: Vec<u8>,
}

impl RelyingParty {
    pub fn new(rp_id: impl Into<String>) -> Self {
        let rp_id = rp_id.into();
        let rp_id_hash = Sha256::digest(rp_id.as_bytes()).to_vec();
        Self { rp_id, rp_id_hash }
    }
}

/// One discoverable credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialRecord {
    #[serde(serialize_with = "hex::serde::serialize")]
    pub credential_id: Vec<u8>,
    #[serde(serialize_with = "hex::serde::serialize")]
    pub user_id: Vec<u8>,
    pub user_name: String,
}

impl CredentialRecord {
    /// Tree identifier for the credential
    pub fn key(&self) -> String {
        hex::encode(&self.credential_id)
    }
}

/// Identifier of an enrolled fingerprint template
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateId(Vec<u8>);

impl TemplateId {
    pub fn new(id: Vec<u8>) -> Self {
        Self(id)
    }

    pub fn from_hex(id: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(id).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rp_id_hash_is_sha256() {
        let rp = RelyingParty::new("example.com");
        assert_eq!(
            hex::encode(&rp.rp_id_hash),
            "a379a6f6eeafb9a55e378c118034e2751e682fab9f2d30ab13d2125586ce1947"
        );
    }

    #[test]
    fn test_credential_record_serialises_hex() {
        let cred = CredentialRecord {
            credential_id: vec![0xca, 0xfe],
            user_id: vec![0x01],
            user_name: "alice".to_string(),
        };
        assert_eq!(cred.key(), "cafe");
        let value = serde_json::to_value(&cred).unwrap();
        assert_eq!(value["credential_id"], "cafe");
        assert_eq!(value["user_id"], "01");
    }

    #[test]
    fn test_template_id_hex() {
        let id = TemplateId::from_hex("0a0b").unwrap();
        assert_eq!(id.as_bytes(), &[0x0a, 0x0b]);
        assert_eq!(id.to_hex(), "0a0b");
        assert!(TemplateId::from_hex("xyz").is_err());
    }

    #[test]
    fn test_info_option_helpers() {
        let mut info = Ctap2Info::default();
        assert!(!info.supports_bio_enrollment());
        info.options.insert("bioEnroll".to_string(), false);
        info.options.insert("credMgmt".to_string(), true);
        assert!(info.supports_bio_enrollment());
        assert!(info.supports_credential_management());
        assert!(!info.has_client_pin());
    }

    #[test]
    fn test_pin_token_debug_redacted() {
        let token = PinToken::new(Permission::BioEnroll, vec![1, 2, 3]);
        assert!(format!("{:?}", token).contains("REDACTED"));
        assert_eq!(token.permission().bits(), 0x08);
    }
}
