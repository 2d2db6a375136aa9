//! OATH (TOTP/HOTP) credential types

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use thiserror::Error;
use url::{form_urlencoded, Url};

use super::Version;

pub const DEFAULT_PERIOD: u32 = 30;
pub const DEFAULT_DIGITS: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OathType {
    Hotp,
    Totp,
}

impl FromStr for OathType {
    type Err = OathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HOTP" => Ok(OathType::Hotp),
            "TOTP" => Ok(OathType::Totp),
            _ => Err(OathError::UnknownType {
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl FromStr for HashAlgorithm {
    type Err = OathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SHA1" => Ok(HashAlgorithm::Sha1),
            "SHA256" => Ok(HashAlgorithm::Sha256),
            "SHA512" => Ok(HashAlgorithm::Sha512),
            _ => Err(OathError::UnknownAlgorithm {
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OathError {
    #[error("Unknown OATH type: {value}")]
    UnknownType { value: String },

    #[error("Unknown hash algorithm: {value}")]
    UnknownAlgorithm { value: String },

    #[error("Invalid otpauth URI: {reason}")]
    InvalidUri { reason: String },

    #[error("Invalid base32 secret")]
    InvalidSecret,
}

/// Everything needed to program a new OATH credential
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialData {
    pub name: String,
    pub oath_type: OathType,
    pub hash_algorithm: HashAlgorithm,
    pub secret: Vec<u8>,
    pub digits: u8,
    pub period: u32,
    pub counter: u32,
    pub issuer: Option<String>,
}

impl CredentialData {
    pub fn new(
        name: impl Into<String>,
        oath_type: OathType,
        hash_algorithm: HashAlgorithm,
        secret: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            oath_type,
            hash_algorithm,
            secret,
            digits: DEFAULT_DIGITS,
            period: DEFAULT_PERIOD,
            counter: 0,
            issuer: None,
        }
    }

    /// Identifier the credential is stored under on the key
    pub fn id(&self) -> Vec<u8> {
        let mut id = match &self.issuer {
            Some(issuer) => format!("{}:{}", issuer, self.name),
            None => self.name.clone(),
        };
        if self.oath_type == OathType::Totp && self.period != DEFAULT_PERIOD {
            id = format!("{}/{}", self.period, id);
        }
        id.into_bytes()
    }

    /// Parse an `otpauth://` URI
    pub fn parse_uri(uri: &str) -> Result<Self, OathError> {
        let invalid = |reason: &str| OathError::InvalidUri {
            reason: reason.to_string(),
        };

        let url = Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "otpauth" {
            return Err(invalid("scheme must be otpauth"));
        }
        let oath_type: OathType = url.host_str().ok_or_else(|| invalid("missing type"))?.parse()?;

        let label = decode_component(url.path().trim_start_matches('/'));
        let (mut issuer, name) = match label.split_once(':') {
            Some((issuer, name)) => (Some(issuer.trim().to_string()), name.trim().to_string()),
            None => (None, label.trim().to_string()),
        };
        if name.is_empty() {
            return Err(invalid("missing account name"));
        }

        let mut data = CredentialData::new(name, oath_type, HashAlgorithm::Sha1, Vec::new());
        let mut secret = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "secret" => secret = Some(decode_base32(&value)?),
                "issuer" => issuer = Some(value.into_owned()),
                "algorithm" => data.hash_algorithm = value.parse()?,
                "digits" => data.digits = value.parse().map_err(|_| invalid("bad digits"))?,
                "period" => data.period = value.parse().map_err(|_| invalid("bad period"))?,
                "counter" => data.counter = value.parse().map_err(|_| invalid("bad counter"))?,
                _ => {}
            }
        }
        data.secret = secret.ok_or_else(|| invalid("missing secret"))?;
        data.issuer = issuer;
        Ok(data)
    }
}

impl fmt::Debug for CredentialData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialData")
            .field("name", &self.name)
            .field("issuer", &self.issuer)
            .field("oath_type", &self.oath_type)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("digits", &self.digits)
            .field("period", &self.period)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

fn decode_component(value: &str) -> String {
    form_urlencoded::parse(value.as_bytes())
        .map(|(k, v)| {
            if v.is_empty() {
                k.into_owned()
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// RFC 4648 base32, case-insensitive, padding and spaces ignored
pub fn decode_base32(value: &str) -> Result<Vec<u8>, OathError> {
    let mut out = Vec::with_capacity(value.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for c in value.chars().filter(|c| !c.is_whitespace() && *c != '=') {
        let v = match c.to_ascii_uppercase() {
            c @ 'A'..='Z' => c as u32 - 'A' as u32,
            c @ '2'..='7' => c as u32 - '2' as u32 + 26,
            _ => return Err(OathError::InvalidSecret),
        };
        buffer = (buffer << 5) | v;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Ok(out)
}

/// A credential stored on the key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OathCredential {
    pub device_id: String,
    #[serde(serialize_with = "serialize_id")]
    pub id: Vec<u8>,
    pub issuer: Option<String>,
    pub name: String,
    pub oath_type: OathType,
    pub period: u32,
    pub touch_required: Option<bool>,
}

impl OathCredential {
    /// Tree identifier for the credential
    pub fn key(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }
}

fn serialize_id<S: Serializer>(id: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(id))
}

/// A calculated one-time code and its validity window (unix seconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OathCode {
    pub value: String,
    pub valid_from: u64,
    pub valid_to: u64,
}

/// State of the OATH application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OathInfo {
    pub version: Version,
    pub device_id: String,
    pub locked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base32_decode() {
        // RFC 4648 test vector
        assert_eq!(decode_base32("MZXW6YTBOI======").unwrap(), b"foobar");
        assert_eq!(decode_base32("mzxw 6ytb oi").unwrap(), b"foobar");
        assert_eq!(decode_base32("MZ1"), Err(OathError::InvalidSecret));
    }

    #[test]
    fn test_credential_id() {
        let mut data = CredentialData::new("alice", OathType::Totp, HashAlgorithm::Sha1, vec![0; 10]);
        assert_eq!(data.id(), b"alice");

        data.issuer = Some("Example".to_string());
        assert_eq!(data.id(), b"Example:alice");

        data.period = 60;
        assert_eq!(data.id(), b"60/Example:alice");

        data.oath_type = OathType::Hotp;
        assert_eq!(data.id(), b"Example:alice");
    }

    #[test]
    fn test_parse_uri() {
        let data = CredentialData::parse_uri(
            "otpauth://totp/Example:alice%40example.com?secret=JBSWY3DPEHPK3PXP&issuer=Example&digits=8&algorithm=SHA256",
        )
        .unwrap();
        assert_eq!(data.name, "alice@example.com");
        assert_eq!(data.issuer.as_deref(), Some("Example"));
        assert_eq!(data.oath_type, OathType::Totp);
        assert_eq!(data.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(data.digits, 8);
        assert_eq!(data.period, DEFAULT_PERIOD);
        assert_eq!(data.secret, b"Hello!\xde\xad\xbe\xef");
    }

    #[test]
    fn test_parse_uri_rejects_missing_secret() {
        let err = CredentialData::parse_uri("otpauth://hotp/alice?counter=3").unwrap_err();
        assert!(matches!(err, OathError::InvalidUri { .. }));
    }

    #[test]
    fn test_parse_uri_rejects_other_scheme() {
        assert!(CredentialData::parse_uri("https://example.com/?secret=AA").is_err());
    }

    #[test]
    fn test_secret_redacted_in_debug() {
        let data = CredentialData::new("bob", OathType::Hotp, HashAlgorithm::Sha1, b"secret".to_vec());
        assert!(!format!("{:?}", data).contains("secret\""));
        assert!(format!("{:?}", data).contains("REDACTED"));
    }
}
