use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::info;

use super::{available_actions, defines_action, parse_params, to_data, ActionGate, Data, Node, Params};
use crate::data;
use crate::error::{RpcError, RpcResult};
use crate::model::{Capabilities, DeviceConfig, Transport, Version};
use crate::ports::ManagementSession;
use crate::signal::ActionContext;

const CONFIGURE_SINCE: Version = Version::new(5, 0, 0);

#[derive(Debug, Deserialize)]
struct ConfigureParams {
    #[serde(default)]
    reboot: bool,
    #[serde(default)]
    cur_lock_code: String,
    #[serde(default)]
    new_lock_code: String,
    #[serde(default)]
    enabled_capabilities: BTreeMap<Transport, u16>,
    auto_eject_timeout: Option<u16>,
    challenge_response_timeout: Option<u8>,
    device_flags: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct SetModeParams {
    mode: u8,
    #[serde(default)]
    challenge_response_timeout: u8,
    #[serde(default)]
    auto_eject_timeout: u16,
}

/// Empty hex means "no lock code"
fn lock_code(value: &str) -> RpcResult<Option<Vec<u8>>> {
    let code = hex::decode(value)?;
    Ok((!code.is_empty()).then_some(code))
}

/// Device configuration (`management`)
pub struct ManagementNode {
    session: Box<dyn ManagementSession>,
}

impl ManagementNode {
    const ACTIONS: &'static [ActionGate<ManagementNode>] = &[
        ActionGate {
            name: "configure",
            available: |node| node.session.version() >= CONFIGURE_SINCE,
        },
        ActionGate {
            name: "set_mode",
            available: |node| node.session.version() < CONFIGURE_SINCE,
        },
    ];

    pub fn new(session: Box<dyn ManagementSession>) -> Self {
        Self { session }
    }

    fn configure(&mut self, params: ConfigureParams) -> RpcResult<Data> {
        let config = DeviceConfig {
            enabled_capabilities: params
                .enabled_capabilities
                .into_iter()
                .map(|(transport, bits)| (transport, Capabilities::from_bits(bits)))
                .collect(),
            auto_eject_timeout: params.auto_eject_timeout,
            challenge_response_timeout: params.challenge_response_timeout,
            device_flags: params.device_flags,
        };
        let cur_lock_code = lock_code(&params.cur_lock_code)?;
        let new_lock_code = lock_code(&params.new_lock_code)?;

        self.session.write_device_config(
            &config,
            params.reboot,
            cur_lock_code.as_deref(),
            new_lock_code.as_deref(),
        )?;
        info!("Device configuration written");
        Ok(data!())
    }
}

impl Node for ManagementNode {
    fn data(&mut self) -> RpcResult<Data> {
        to_data(&self.session.read_device_info()?)
    }

    fn actions(&self) -> Vec<&'static str> {
        available_actions(self, Self::ACTIONS)
    }

    fn knows_action(&self, action: &str) -> bool {
        defines_action(Self::ACTIONS, action)
    }

    fn invoke(&mut self, action: &str, params: Params, _ctx: &ActionContext) -> RpcResult<Data> {
        match action {
            "configure" => self.configure(parse_params(params)?),
            "set_mode" => {
                let params: SetModeParams = parse_params(params)?;
                self.session.set_mode(
                    params.mode,
                    params.challenge_response_timeout,
                    params.auto_eject_timeout,
                )?;
                Ok(data!())
            }
            _ => Err(RpcError::no_such_action(action)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_code_parsing() {
        assert_eq!(lock_code("").unwrap(), None);
        assert_eq!(lock_code("00ff").unwrap(), Some(vec![0x00, 0xff]));
        assert!(lock_code("zz").is_err());
    }

    #[test]
    fn test_configure_params_defaults() {
        let params: ConfigureParams = parse_params(data! {
            "enabled_capabilities" => serde_json::json!({ "usb": 0x20 })
        })
        .unwrap();
        assert!(!params.reboot);
        assert_eq!(params.enabled_capabilities[&Transport::Usb], 0x20);
        assert_eq!(params.device_flags, None);
    }
}
