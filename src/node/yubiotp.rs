use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::info;

use super::{always, available_actions, create_gated, defines_action, gated_children, parse_params};
use super::{ActionGate, ChildGate, Children, Data, Node, Params};
use crate::data;
use crate::error::{RpcError, RpcResult};
use crate::model::{ConfigState, Slot, Version};
use crate::ports::YubiOtpSession;
use crate::signal::ActionContext;

/// Firmware from which the touch flags in the config state are meaningful
const TOUCH_FLAGS_SINCE: Version = Version::new(3, 0, 0);

type SharedOtp = Arc<Mutex<Box<dyn YubiOtpSession>>>;

#[derive(Debug, Deserialize)]
struct DeleteParams {
    #[serde(default)]
    acc_code: String,
}

#[derive(Debug, Deserialize)]
struct CalculateParams {
    challenge: String,
}

/// YubiOTP application (`yubiotp`)
pub struct YubiOtpNode {
    session: SharedOtp,
}

impl YubiOtpNode {
    const ACTIONS: &'static [ActionGate<YubiOtpNode>] = &[ActionGate {
        name: "swap",
        available: always,
    }];

    const CHILDREN: &'static [ChildGate<YubiOtpNode>] = &[
        ChildGate {
            name: "one",
            visible: always,
            create: |node| Ok(Box::new(SlotNode::new(node.session.clone(), Slot::One)?)),
        },
        ChildGate {
            name: "two",
            visible: always,
            create: |node| Ok(Box::new(SlotNode::new(node.session.clone(), Slot::Two)?)),
        },
    ];

    pub fn new(session: Box<dyn YubiOtpSession>) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
        }
    }
}

impl Node for YubiOtpNode {
    fn data(&mut self) -> RpcResult<Data> {
        let mut session = self.session.lock();
        let state = session.config_state()?;
        let mut data = data! {
            "is_led_inverted" => state.is_led_inverted(),
            "slot1_configured" => state.is_configured(Slot::One),
            "slot2_configured" => state.is_configured(Slot::Two),
        };
        if session.version() >= TOUCH_FLAGS_SINCE {
            data.insert(
                "slot1_touch_triggered".to_string(),
                state.is_touch_triggered(Slot::One).into(),
            );
            data.insert(
                "slot2_touch_triggered".to_string(),
                state.is_touch_triggered(Slot::Two).into(),
            );
        }
        Ok(data)
    }

    fn actions(&self) -> Vec<&'static str> {
        available_actions(self, Self::ACTIONS)
    }

    fn knows_action(&self, action: &str) -> bool {
        defines_action(Self::ACTIONS, action)
    }

    fn invoke(&mut self, action: &str, _params: Params, _ctx: &ActionContext) -> RpcResult<Data> {
        match action {
            "swap" => {
                self.session.lock().swap_slots()?;
                info!("Swapped OTP slots");
                Ok(data!())
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

/// One OTP configuration slot
///
/// Action availability follows the config state read when the node was
/// created, refreshed on every `get` and after `delete`.
pub struct SlotNode {
    session: SharedOtp,
    slot: Slot,
    state: ConfigState,
}

impl SlotNode {
    const ACTIONS: &'static [ActionGate<SlotNode>] = &[
        ActionGate {
            name: "delete",
            available: |node| node.state.is_configured(node.slot),
        },
        ActionGate {
            name: "calculate",
            available: |node| {
                node.state.is_configured(node.slot) && !node.state.is_touch_triggered(node.slot)
            },
        },
    ];

    fn new(session: SharedOtp, slot: Slot) -> RpcResult<Self> {
        let state = session.lock().config_state()?;
        Ok(Self {
            session,
            slot,
            state,
        })
    }

    fn refresh(&mut self) -> RpcResult<()> {
        self.state = self.session.lock().config_state()?;
        Ok(())
    }
}

impl Node for SlotNode {
    fn data(&mut self) -> RpcResult<Data> {
        self.refresh()?;
        let mut data = data! {
            "slot" => self.slot.number(),
            "is_configured" => self.state.is_configured(self.slot),
        };
        if self.session.lock().version() >= TOUCH_FLAGS_SINCE {
            data.insert(
                "is_touch_triggered".to_string(),
                self.state.is_touch_triggered(self.slot).into(),
            );
        }
        Ok(data)
    }

    fn actions(&self) -> Vec<&'static str> {
        available_actions(self, Self::ACTIONS)
    }

    fn knows_action(&self, action: &str) -> bool {
        defines_action(Self::ACTIONS, action)
    }

    fn invoke(&mut self, action: &str, params: Params, ctx: &ActionContext) -> RpcResult<Data> {
        match action {
            "delete" => {
                let params: DeleteParams = parse_params(params)?;
                let acc_code = hex::decode(&params.acc_code)?;
                let acc_code = (!acc_code.is_empty()).then_some(acc_code);
                self.session
                    .lock()
                    .delete_slot(self.slot, acc_code.as_deref())?;
                info!("Deleted OTP slot {}", self.slot.number());
                self.refresh()?;
                Ok(data!())
            }
            "calculate" => {
                let params: CalculateParams = parse_params(params)?;
                let challenge = hex::decode(&params.challenge)?;
                let response =
                    self.session
                        .lock()
                        .calculate_hmac_sha1(self.slot, &challenge, &ctx.cancel)?;
                Ok(data! { "response" => hex::encode(response) })
            }
            _ => Err(RpcError::no_such_action(action)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::virtual_key::{OtpSlotConfig, VirtualBackend, VirtualKey};
    use crate::model::ConnectionKind;
    use crate::ports::UsbScanner;

    fn yubiotp(key: VirtualKey) -> YubiOtpNode {
        let backend = VirtualBackend::new();
        backend.plug_usb(key);
        let mut connection = backend
            .connect_to_device(None, &[ConnectionKind::Otp])
            .unwrap();
        YubiOtpNode::new(connection.yubiotp().unwrap())
    }

    #[test]
    fn test_slot_actions_follow_config_state() {
        let key = VirtualKey::yubikey5(Some(20))
            .with_otp_slot(Slot::One, OtpSlotConfig::challenge_response(b"secret", false))
            .with_otp_slot(Slot::Two, OtpSlotConfig::challenge_response(b"secret", true));
        let mut node = yubiotp(key);

        let data = node.data().unwrap();
        assert_eq!(data["slot1_configured"], true);
        assert_eq!(data["slot2_touch_triggered"], true);

        let one = node.create_child("one").unwrap();
        assert_eq!(one.actions(), vec!["delete", "calculate"]);
        let two = node.create_child("two").unwrap();
        assert_eq!(two.actions(), vec!["delete"]);
        assert!(two.knows_action("calculate"));
    }

    #[test]
    fn test_empty_slot_has_no_actions() {
        let mut node = yubiotp(VirtualKey::yubikey5(Some(21)));
        let mut one = node.create_child("one").unwrap();
        assert!(one.actions().is_empty());
        assert_eq!(one.data().unwrap()["is_configured"], false);
    }

    #[test]
    fn test_calculate_and_delete() {
        let key = VirtualKey::yubikey5(Some(22))
            .with_otp_slot(Slot::Two, OtpSlotConfig::challenge_response(b"Jefe", false));
        let mut node = yubiotp(key);
        let mut two = node.create_child("two").unwrap();
        let ctx = ActionContext::detached();

        // RFC 2202 test case 2
        let result = two
            .invoke(
                "calculate",
                data! { "challenge" => hex::encode("what do ya want for nothing?") },
                &ctx,
            )
            .unwrap();
        assert_eq!(result["response"], "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");

        two.invoke("delete", Params::new(), &ctx).unwrap();
        assert!(two.actions().is_empty());
    }

    #[test]
    fn test_swap_exchanges_slots() {
        let key = VirtualKey::yubikey5(Some(23))
            .with_otp_slot(Slot::One, OtpSlotConfig::challenge_response(b"k", false));
        let mut node = yubiotp(key);
        node.invoke("swap", Params::new(), &ActionContext::detached())
            .unwrap();

        let data = node.data().unwrap();
        assert_eq!(data["slot1_configured"], false);
        assert_eq!(data["slot2_configured"], true);
    }
}
