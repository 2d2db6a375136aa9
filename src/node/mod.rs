//! The resource tree
//!
//! Every element of the tree implements [`Node`]. Nodes are created lazily
//! by their parent when a path segment names them, and each parent keeps at
//! most one open child (see [`tree::NodeCell`]).
//!
//! Children and actions whose visibility depends on live device state are
//! declared as gate tables ([`ChildGate`], [`ActionGate`]); the predicates are
//! evaluated on every listing and lookup, never cached.

mod connection;
mod device;
mod devices;
mod fido;
mod management;
mod oath;
mod root;
mod tree;
mod yubiotp;

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{DeviceError, RpcError, RpcResult};
use crate::signal::ActionContext;

pub use connection::ConnectionNode;
pub use device::{ReaderDeviceNode, UsbDeviceNode};
pub use devices::{DevicesNode, ReadersNode};
pub use fido::{CredentialsNode, Ctap2Node, FingerprintsNode};
pub use management::ManagementNode;
pub use oath::{AccountsNode, OathNode};
pub use root::RootNode;
pub use tree::{DeviceTree, NodeCell};
pub use yubiotp::{SlotNode, YubiOtpNode};

/// JSON object used for snapshots, params and results
pub type Data = serde_json::Map<String, Value>;

/// Action parameters
pub type Params = Data;

/// Child identifier to child summary
pub type Children = BTreeMap<String, Data>;

/// Uniform interface of every tree element
///
/// Each node implements the subset meaningful to its role; the defaults
/// describe a node with no data, no actions and no children.
pub trait Node: Send {
    /// Current snapshot
    fn data(&mut self) -> RpcResult<Data> {
        Ok(Data::new())
    }

    /// Actions available right now, `get` excluded
    fn actions(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Whether `action` is defined at all, available or not
    fn knows_action(&self, action: &str) -> bool {
        self.actions().contains(&action)
    }

    fn invoke(&mut self, action: &str, _params: Params, _ctx: &ActionContext) -> RpcResult<Data> {
        Err(RpcError::no_such_action(action))
    }

    /// Whether invoking `action` leaves the open child alone
    fn keeps_child(&self, _action: &str) -> bool {
        false
    }

    fn children(&mut self) -> RpcResult<Children> {
        Ok(Children::new())
    }

    fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        Err(RpcError::no_such_node(name))
    }

    /// Called before any request is routed through this node
    fn enter(&mut self) {}

    /// Called after the request routed through this node completed
    fn leave(&mut self) {}

    /// Transport faults below a boundary turn into removal of its open child
    fn is_fault_boundary(&self) -> bool {
        false
    }

    /// Release owned resources; the node is not used afterwards
    fn close(&mut self) {}
}

/// A child whose visibility depends on the parent's current state
pub struct ChildGate<N> {
    pub name: &'static str,
    pub visible: fn(&N) -> bool,
    pub create: fn(&mut N) -> RpcResult<Box<dyn Node>>,
}

/// An action whose availability depends on the node's current state
pub struct ActionGate<N> {
    pub name: &'static str,
    pub available: fn(&N) -> bool,
}

pub(crate) fn always<N>(_: &N) -> bool {
    true
}

/// Names of the currently visible gated children
pub(crate) fn gated_children<N>(node: &N, gates: &[ChildGate<N>]) -> Children {
    gates
        .iter()
        .filter(|gate| (gate.visible)(node))
        .map(|gate| (gate.name.to_string(), Data::new()))
        .collect()
}

/// Construct a gated child, refusing names that are not currently visible
pub(crate) fn create_gated<N>(
    node: &mut N,
    gates: &[ChildGate<N>],
    name: &str,
) -> RpcResult<Box<dyn Node>> {
    match gates.iter().find(|gate| gate.name == name) {
        Some(gate) if (gate.visible)(node) => (gate.create)(node),
        _ => Err(RpcError::no_such_node(name)),
    }
}

pub(crate) fn available_actions<N>(node: &N, gates: &[ActionGate<N>]) -> Vec<&'static str> {
    gates
        .iter()
        .filter(|gate| (gate.available)(node))
        .map(|gate| gate.name)
        .collect()
}

pub(crate) fn defines_action<N>(gates: &[ActionGate<N>], action: &str) -> bool {
    gates.iter().any(|gate| gate.name == action)
}

/// Serialise a value into a snapshot object
pub(crate) fn to_data<T: Serialize>(value: &T) -> RpcResult<Data> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(RpcError::Device(DeviceError::protocol(format!(
            "expected an object, got {}",
            other
        )))),
        Err(e) => Err(RpcError::Device(DeviceError::protocol(e.to_string()))),
    }
}

/// Deserialise action params into a typed struct
pub(crate) fn parse_params<T: DeserializeOwned>(params: Params) -> RpcResult<T> {
    Ok(serde_json::from_value(Value::Object(params))?)
}

/// Build a data object from key/value pairs
#[macro_export]
macro_rules! data {
    () => { $crate::node::Data::new() };
    ($($key:literal => $value:expr),+ $(,)?) => {{
        let mut map = $crate::node::Data::new();
        $( map.insert($key.to_string(), ::serde_json::json!($value)); )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    struct Lamp {
        on: bool,
    }

    impl Lamp {
        const CHILDREN: &'static [ChildGate<Lamp>] = &[
            ChildGate {
                name: "bulb",
                visible: always,
                create: |_| Err(RpcError::not_supported("bulb")),
            },
            ChildGate {
                name: "glow",
                visible: |lamp| lamp.on,
                create: |_| Err(RpcError::not_supported("glow")),
            },
        ];

        const ACTIONS: &'static [ActionGate<Lamp>] = &[
            ActionGate {
                name: "toggle",
                available: always,
            },
            ActionGate {
                name: "dim",
                available: |lamp| lamp.on,
            },
        ];
    }

    #[test]
    fn test_gates_follow_state() {
        let mut lamp = Lamp { on: false };
        assert_eq!(gated_children(&lamp, Lamp::CHILDREN).len(), 1);
        assert_eq!(available_actions(&lamp, Lamp::ACTIONS), vec!["toggle"]);
        assert!(defines_action(Lamp::ACTIONS, "dim"));
        assert!(!defines_action(Lamp::ACTIONS, "explode"));

        let err = create_gated(&mut lamp, Lamp::CHILDREN, "glow").err().unwrap();
        assert!(matches!(err, RpcError::NoSuchNode { .. }));

        lamp.on = true;
        assert!(gated_children(&lamp, Lamp::CHILDREN).contains_key("glow"));
        assert_eq!(available_actions(&lamp, Lamp::ACTIONS), vec!["toggle", "dim"]);
        let err = create_gated(&mut lamp, Lamp::CHILDREN, "glow").err().unwrap();
        assert!(matches!(err, RpcError::NotSupported { .. }));
    }

    #[derive(Debug, Deserialize)]
    struct Brightness {
        level: u8,
    }

    #[test]
    fn test_parse_params() {
        let params = data! { "level" => 3 };
        let parsed: Brightness = parse_params(params).unwrap();
        assert_eq!(parsed.level, 3);

        let err = parse_params::<Brightness>(data! { "level" => "high" }).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParams);
    }

    #[test]
    fn test_to_data_requires_object() {
        assert!(to_data(&Reading { level: 1 }).is_ok());
        assert!(to_data(&5).is_err());
    }

    #[derive(Serialize)]
    struct Reading {
        level: u8,
    }
}
