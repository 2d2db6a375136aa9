use std::sync::Arc;

use serde_json::json;

use super::{always, create_gated, gated_children, ActionGate, ChildGate, Children, Data, Node};
use super::{available_actions, defines_action, DevicesNode, Params, ReadersNode};
use crate::data;
use crate::enumerate::{ReaderEnumerator, UsbEnumerator};
use crate::error::{RpcError, RpcResult};
use crate::signal::ActionContext;

/// Top of the tree: `usb` and `nfc` subtrees plus diagnostics
pub struct RootNode {
    usb: Arc<UsbEnumerator>,
    readers: Arc<ReaderEnumerator>,
}

impl RootNode {
    const CHILDREN: &'static [ChildGate<RootNode>] = &[
        ChildGate {
            name: "usb",
            visible: always,
            create: |root| Ok(Box::new(DevicesNode::new(root.usb.clone()))),
        },
        ChildGate {
            name: "nfc",
            visible: always,
            create: |root| Ok(Box::new(ReadersNode::new(root.readers.clone()))),
        },
    ];

    const ACTIONS: &'static [ActionGate<RootNode>] = &[ActionGate {
        name: "diagnose",
        available: always,
    }];

    pub fn new(usb: Arc<UsbEnumerator>, readers: Arc<ReaderEnumerator>) -> Self {
        Self { usb, readers }
    }

    fn diagnose(&self) -> Data {
        let (state, devices) = self
            .usb
            .with_caching(|| (self.usb.token(), self.usb.list()));
        data! {
            "diagnostics" => json!({
                "version": env!("CARGO_PKG_VERSION"),
                "usb": { "state": state, "devices": devices },
                "nfc": { "readers": self.readers.list() },
            })
        }
    }
}

impl Node for RootNode {
    fn data(&mut self) -> RpcResult<Data> {
        Ok(data! { "version" => env!("CARGO_PKG_VERSION") })
    }

    fn actions(&self) -> Vec<&'static str> {
        available_actions(self, Self::ACTIONS)
    }

    fn knows_action(&self, action: &str) -> bool {
        defines_action(Self::ACTIONS, action)
    }

    fn invoke(&mut self, action: &str, _params: Params, _ctx: &ActionContext) -> RpcResult<Data> {
        match action {
            "diagnose" => Ok(self.diagnose()),
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
