use std::sync::Arc;

use super::{to_data, Children, Data, Node, Params, ReaderDeviceNode, UsbDeviceNode};
use crate::data;
use crate::enumerate::{ReaderEnumerator, UsbEnumerator};
use crate::error::{RpcError, RpcResult};
use crate::signal::ActionContext;

/// `usb`: YubiKeys attached over USB
///
/// Every request routed through this node runs inside one caching scope of
/// the enumerator, so a compound request probes the bus once.
pub struct DevicesNode {
    usb: Arc<UsbEnumerator>,
}

impl DevicesNode {
    pub fn new(usb: Arc<UsbEnumerator>) -> Self {
        Self { usb }
    }
}

impl Node for DevicesNode {
    fn enter(&mut self) {
        self.usb.begin_caching();
    }

    fn leave(&mut self) {
        self.usb.end_caching();
    }

    fn data(&mut self) -> RpcResult<Data> {
        Ok(data! { "state" => self.usb.token() })
    }

    fn actions(&self) -> Vec<&'static str> {
        vec!["scan"]
    }

    fn keeps_child(&self, action: &str) -> bool {
        action == "scan"
    }

    fn invoke(&mut self, action: &str, _params: Params, _ctx: &ActionContext) -> RpcResult<Data> {
        match action {
            "scan" => Ok(data! { "state" => self.usb.token() }),
            _ => Err(RpcError::no_such_action(action)),
        }
    }

    fn children(&mut self) -> RpcResult<Children> {
        self.usb
            .list()
            .iter()
            .map(|(id, summary)| Ok((id.clone(), to_data(summary)?)))
            .collect()
    }

    fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        // identifiers from an earlier generation must not resolve
        self.usb.list();
        let entry = self
            .usb
            .resolve(name)
            .ok_or_else(|| RpcError::no_such_node(name))?;
        Ok(Box::new(UsbDeviceNode::new(entry, self.usb.clone())))
    }
}

/// `nfc`: external smartcard readers
pub struct ReadersNode {
    readers: Arc<ReaderEnumerator>,
}

impl ReadersNode {
    pub fn new(readers: Arc<ReaderEnumerator>) -> Self {
        Self { readers }
    }
}

impl Node for ReadersNode {
    fn children(&mut self) -> RpcResult<Children> {
        self.readers
            .list()
            .iter()
            .map(|(id, summary)| Ok((id.clone(), to_data(summary)?)))
            .collect()
    }

    fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        self.readers.list();
        let entry = self
            .readers
            .resolve(name)
            .ok_or_else(|| RpcError::no_such_node(name))?;
        Ok(Box::new(ReaderDeviceNode::new(entry.device)))
    }
}
