use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{always, available_actions, create_gated, defines_action, gated_children};
use super::{parse_params, to_data, ActionGate, ChildGate, Children, Data, Node, Params};
use crate::data;
use crate::error::{RpcError, RpcResult};
use crate::model::{CredentialData, HashAlgorithm, OathCredential};
use crate::ports::OathSession;
use crate::signal::ActionContext;

/// Session plus the credential listing shared by the OATH subtree
struct OathState {
    session: Box<dyn OathSession>,
    credentials: BTreeMap<String, OathCredential>,
}

type SharedOath = Arc<Mutex<OathState>>;

#[derive(Debug, Deserialize)]
struct DeriveParams {
    password: String,
}

#[derive(Debug, Deserialize)]
struct ValidateParams {
    password: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CalculateParams {
    credential: String,
    challenge: String,
}

#[derive(Debug, Deserialize)]
struct ChallengeParams {
    challenge: String,
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    credential: String,
}

#[derive(Debug, Deserialize)]
struct PutDataParams {
    name: String,
    oath_type: String,
    hash: Option<String>,
    secret: String,
    issuer: Option<String>,
    digits: Option<u8>,
    period: Option<u32>,
    counter: Option<u32>,
    #[serde(default)]
    require_touch: bool,
}

impl PutDataParams {
    fn into_credential(self) -> RpcResult<(CredentialData, bool)> {
        let hash = match self.hash {
            Some(hash) => hash.parse()?,
            None => HashAlgorithm::Sha1,
        };
        let mut data =
            CredentialData::new(self.name, self.oath_type.parse()?, hash, hex::decode(self.secret)?);
        data.issuer = self.issuer;
        if let Some(digits) = self.digits {
            data.digits = digits;
        }
        if let Some(period) = self.period {
            data.period = period;
        }
        if let Some(counter) = self.counter {
            data.counter = counter;
        }
        Ok((data, self.require_touch))
    }
}

#[derive(Debug, Deserialize)]
struct PutUriParams {
    uri: String,
    #[serde(default)]
    require_touch: bool,
}

#[derive(Debug, Deserialize)]
struct CodeParams {
    timestamp: Option<u64>,
}

/// OATH application (`oath`)
pub struct OathNode {
    state: SharedOath,
}

impl OathNode {
    const ACTIONS: &'static [ActionGate<OathNode>] = &[
        ActionGate {
            name: "derive",
            available: always,
        },
        ActionGate {
            name: "validate",
            available: always,
        },
        ActionGate {
            name: "calculate",
            available: always,
        },
    ];

    const CHILDREN: &'static [ChildGate<OathNode>] = &[ChildGate {
        name: "accounts",
        visible: always,
        create: |node| Ok(Box::new(AccountsNode::new(node.state.clone())?)),
    }];

    pub fn new(session: Box<dyn OathSession>) -> Self {
        Self {
            state: Arc::new(Mutex::new(OathState {
                session,
                credentials: BTreeMap::new(),
            })),
        }
    }
}

impl Node for OathNode {
    fn data(&mut self) -> RpcResult<Data> {
        to_data(&self.state.lock().session.info())
    }

    fn actions(&self) -> Vec<&'static str> {
        available_actions(self, Self::ACTIONS)
    }

    fn knows_action(&self, action: &str) -> bool {
        defines_action(Self::ACTIONS, action)
    }

    fn invoke(&mut self, action: &str, params: Params, _ctx: &ActionContext) -> RpcResult<Data> {
        let mut state = self.state.lock();
        match action {
            "derive" => {
                let params: DeriveParams = parse_params(params)?;
                let key = state.session.derive_key(&params.password);
                Ok(data! { "key" => hex::encode(key) })
            }
            "validate" => {
                let params: ValidateParams = parse_params(params)?;
                let key = match (params.password, params.key) {
                    (Some(password), _) => state.session.derive_key(&password),
                    (None, Some(key)) => hex::decode(key)?,
                    (None, None) => return Err(RpcError::invalid_params("password or key required")),
                };
                state.session.validate(&key)?;
                Ok(data!())
            }
            "calculate" => {
                let params: CalculateParams = parse_params(params)?;
                let credential_id = hex::decode(params.credential)?;
                let challenge = hex::decode(params.challenge)?;
                let response = state.session.calculate(&credential_id, &challenge)?;
                Ok(data! { "response" => hex::encode(response) })
            }
            _ => Err(RpcError::no_such_action(action)),
        }
    }

    fn children(&mut self) -> RpcResult<Children> {
        Ok(gated_children(self, Self::CHILDREN))
    }

    fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        create_gated(self, Self::CHILDREN, name)
    }
}

/// Stored credentials (`accounts`)
pub struct AccountsNode {
    state: SharedOath,
}

impl AccountsNode {
    fn new(state: SharedOath) -> RpcResult<Self> {
        {
            let mut guard = state.lock();
            let credentials = guard.session.list_credentials()?;
            guard.credentials = credentials
                .into_iter()
                .map(|credential| (credential.key(), credential))
                .collect();
        }
        Ok(Self { state })
    }

    fn put(&mut self, data: CredentialData, require_touch: bool) -> RpcResult<Data> {
        let mut state = self.state.lock();
        let key = String::from_utf8_lossy(&data.id()).into_owned();
        if state.credentials.contains_key(&key) {
            return Err(RpcError::invalid_params("Credential already exists"));
        }
        let credential = state.session.put_credential(&data, require_touch)?;
        info!("Added OATH credential {}", credential.key());
        let result = to_data(&credential)?;
        state.credentials.insert(credential.key(), credential);
        Ok(result)
    }
}

impl Node for AccountsNode {
    fn data(&mut self) -> RpcResult<Data> {
        let state = self.state.lock();
        let mut credentials: Vec<&OathCredential> = state.credentials.values().collect();
        credentials.sort_by_key(|c| {
            (
                c.issuer.as_deref().unwrap_or(c.name.as_str()).to_lowercase(),
                c.name.to_lowercase(),
            )
        });
        let credentials = credentials
            .into_iter()
            .map(|c| to_data(c).map(Value::Object))
            .collect::<RpcResult<Vec<_>>>()?;
        Ok(data! { "credentials" => credentials })
    }

    fn actions(&self) -> Vec<&'static str> {
        vec!["delete", "put_data", "put_uri"]
    }

    fn invoke(&mut self, action: &str, params: Params, _ctx: &ActionContext) -> RpcResult<Data> {
        match action {
            "delete" => {
                let params: DeleteParams = parse_params(params)?;
                let mut state = self.state.lock();
                state.session.delete_credential(params.credential.as_bytes())?;
                state.credentials.remove(&params.credential);
                Ok(data!())
            }
            "put_data" => {
                let params: PutDataParams = parse_params(params)?;
                let (data, require_touch) = params.into_credential()?;
                self.put(data, require_touch)
            }
            "put_uri" => {
                let params: PutUriParams = parse_params(params)?;
                let data = CredentialData::parse_uri(&params.uri)?;
                self.put(data, params.require_touch)
            }
            _ => Err(RpcError::no_such_action(action)),
        }
    }

    fn children(&mut self) -> RpcResult<Children> {
        self.state
            .lock()
            .credentials
            .iter()
            .map(|(key, credential)| Ok((key.clone(), to_data(credential)?)))
            .collect()
    }

    fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        let credential = self
            .state
            .lock()
            .credentials
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::no_such_node(name))?;
        Ok(Box::new(AccountNode {
            state: self.state.clone(),
            credential,
        }))
    }
}

/// One stored credential
struct AccountNode {
    state: SharedOath,
    credential: OathCredential,
}

impl Node for AccountNode {
    fn data(&mut self) -> RpcResult<Data> {
        to_data(&self.credential)
    }

    fn actions(&self) -> Vec<&'static str> {
        vec!["calculate", "code", "delete"]
    }

    fn invoke(&mut self, action: &str, params: Params, _ctx: &ActionContext) -> RpcResult<Data> {
        let mut state = self.state.lock();
        match action {
            "code" => {
                let params: CodeParams = parse_params(params)?;
                let code = state.session.calculate_code(&self.credential, params.timestamp)?;
                to_data(&code)
            }
            "calculate" => {
                let params: ChallengeParams = parse_params(params)?;
                let challenge = hex::decode(params.challenge)?;
                let response = state.session.calculate(&self.credential.id, &challenge)?;
                Ok(data! { "response" => hex::encode(response) })
            }
            "delete" => {
                state.session.delete_credential(&self.credential.id)?;
                state.credentials.remove(&self.credential.key());
                Ok(data!())
            }
            _ => Err(RpcError::no_such_action(action)),
        }
    }
}
