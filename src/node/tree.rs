use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use super::{Data, Node, Params, RootNode};
use crate::enumerate::{ReaderEnumerator, UsbEnumerator};
use crate::error::{RpcError, RpcResult};
use crate::ports::{ReaderScanner, UsbScanner};
use crate::signal::ActionContext;

/// A node together with its (at most one) open child
pub struct NodeCell {
    name: String,
    node: Box<dyn Node>,
    child: Option<Box<NodeCell>>,
}

impl NodeCell {
    pub fn new(name: impl Into<String>, node: Box<dyn Node>) -> Self {
        Self {
            name: name.into(),
            node,
            child: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the currently open child, if any
    pub fn open_child(&self) -> Option<&str> {
        self.child.as_ref().map(|child| child.name.as_str())
    }

    /// Route `action` to the node at `target` (relative to this one)
    pub fn call(
        &mut self,
        action: &str,
        target: &[String],
        params: Params,
        ctx: &ActionContext,
    ) -> RpcResult<Data> {
        self.node.enter();
        let result = self.dispatch(action, target, params, ctx);
        self.node.leave();

        match result {
            Err(e) if e.is_transport() && self.node.is_fault_boundary() => {
                error!("Device error under {}: {}", self.name, e);
                let name = match self.child.take() {
                    Some(mut child) => {
                        child.close();
                        child.name
                    }
                    None => self.name.clone(),
                };
                Err(RpcError::no_such_node(name))
            }
            other => other,
        }
    }

    fn dispatch(
        &mut self,
        action: &str,
        target: &[String],
        params: Params,
        ctx: &ActionContext,
    ) -> RpcResult<Data> {
        if let Some((first, rest)) = target.split_first() {
            return self.child_cell(first)?.call(action, rest, params, ctx);
        }

        if action == "get" || self.node.actions().contains(&action) {
            if !self.node.keeps_child(action) {
                self.close_child();
            }
            if action == "get" {
                return self.get();
            }
            debug!("invoke {} on {}", action, self.name);
            return self.node.invoke(action, params, ctx);
        }

        if self.node.children()?.contains_key(action) {
            return self.child_cell(action)?.call("get", &[], Params::new(), ctx);
        }

        if self.node.knows_action(action) {
            Err(RpcError::ActionNotApplicable {
                name: action.to_string(),
            })
        } else {
            Err(RpcError::no_such_action(action))
        }
    }

    fn get(&mut self) -> RpcResult<Data> {
        let data = self.node.data()?;
        let mut actions = self.node.actions();
        actions.push("get");
        actions.sort_unstable();
        let children = self.node.children()?;

        let mut result = Data::new();
        result.insert("data".to_string(), Value::Object(data));
        result.insert("actions".to_string(), actions.into());
        result.insert(
            "children".to_string(),
            Value::Object(
                children
                    .into_iter()
                    .map(|(name, summary)| (name, Value::Object(summary)))
                    .collect(),
            ),
        );
        Ok(result)
    }

    fn child_cell(&mut self, name: &str) -> RpcResult<&mut NodeCell> {
        let reuse = self.child.as_ref().is_some_and(|child| child.name == name);
        if !reuse {
            self.close_child();
            let node = self.node.create_child(name)?;
            debug!("created child: {}", name);
            self.child = Some(Box::new(NodeCell::new(name, node)));
        }
        self.child
            .as_deref_mut()
            .ok_or_else(|| RpcError::no_such_node(name))
    }

    fn close_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!("close existing child: {}", child.name);
            child.close();
        }
    }

    /// Close the open child chain, then this node
    pub fn close(&mut self) {
        self.close_child();
        self.node.close();
    }

    /// Close the node at `target` if it is currently open
    pub fn close_path(&mut self, target: &[String]) {
        match target.split_first() {
            None => self.close_child(),
            Some((first, rest)) => {
                if let Some(child) = self.child.as_deref_mut() {
                    if &child.name == first {
                        if rest.is_empty() {
                            self.close_child();
                        } else {
                            child.close_path(rest);
                        }
                    }
                }
            }
        }
    }
}

/// The whole tree, rooted at a [`RootNode`]
pub struct DeviceTree {
    root: NodeCell,
}

impl DeviceTree {
    pub fn new(usb: Arc<dyn UsbScanner>, readers: Arc<dyn ReaderScanner>) -> Self {
        let root = RootNode::new(
            Arc::new(UsbEnumerator::new(usb)),
            Arc::new(ReaderEnumerator::new(readers)),
        );
        Self {
            root: NodeCell::new("", Box::new(root)),
        }
    }

    /// Route one request through the tree
    pub fn call(
        &mut self,
        action: &str,
        target: &[String],
        params: Params,
        ctx: &ActionContext,
    ) -> RpcResult<Data> {
        debug!("request {} on /{}", action, target.join("/"));
        self.root.call(action, target, params, ctx)
    }

    /// `{data, actions, children}` of the node at `path`
    pub fn get(&mut self, path: &[&str]) -> RpcResult<Data> {
        self.call("get", &owned(path), Params::new(), &ActionContext::detached())
    }

    /// Snapshot of the node at `path`
    pub fn data(&mut self, path: &[&str]) -> RpcResult<Data> {
        section(self.get(path)?, "data")
    }

    /// Child summaries of the node at `path`
    pub fn list(&mut self, path: &[&str]) -> RpcResult<Data> {
        section(self.get(path)?, "children")
    }

    pub fn invoke(
        &mut self,
        path: &[&str],
        action: &str,
        params: Params,
        ctx: &ActionContext,
    ) -> RpcResult<Data> {
        self.call(action, &owned(path), params, ctx)
    }

    /// Release the resources owned by the node at `path` and below
    pub fn close(&mut self, path: &[&str]) {
        self.root.close_path(&owned(path));
    }

    /// Names of the open node chain, root excluded
    pub fn open_path(&self) -> Vec<String> {
        let mut path = Vec::new();
        let mut cell = &self.root;
        while let Some(child) = cell.child.as_deref() {
            path.push(child.name.clone());
            cell = child;
        }
        path
    }
}

impl Drop for DeviceTree {
    fn drop(&mut self) {
        self.root.close();
    }
}

fn owned(path: &[&str]) -> Vec<String> {
    path.iter().map(|segment| segment.to_string()).collect()
}

fn section(mut response: Data, key: &str) -> RpcResult<Data> {
    match response.remove(key) {
        Some(Value::Object(map)) => Ok(map),
        _ => Ok(Data::new()),
    }
}
