use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use super::{create_gated, gated_children, to_data, ChildGate, Children, ConnectionNode, Data, Node};
use crate::enumerate::{UsbEntry, UsbEnumerator};
use crate::error::{DeviceError, RpcError, RpcResult};
use crate::model::{ConnectionKind, DeviceInfo, UsbInterfaces, UsbPid};
use crate::ports::{Connection, DeviceHandle};

/// Read identity over the first connection kind the device supports
fn read_identity(device: &dyn DeviceHandle) -> RpcResult<(DeviceInfo, Data)> {
    let kind = ConnectionKind::ALL
        .into_iter()
        .find(|kind| device.supports_connection(*kind))
        .ok_or_else(|| DeviceError::protocol("No supported connections"))?;

    let pid = device.pid();
    let mut connection = device.open_connection(kind)?;
    let info = connection.read_info(pid);
    connection.close();
    let info = info?;

    let name = info.display_name(pid.and_then(UsbPid::key_type));
    let mut data = Data::new();
    data.insert("pid".to_string(), json!(pid));
    data.insert("name".to_string(), json!(name));
    data.insert("transport".to_string(), json!(device.transport()));
    data.insert("info".to_string(), to_data(&info)?.into());
    Ok((info, data))
}

/// A YubiKey attached over USB
///
/// Which connection children exist follows from the product id alone; no
/// I/O is needed to decide visibility.
pub struct UsbDeviceNode {
    device: Arc<dyn DeviceHandle>,
    info: DeviceInfo,
    interfaces: UsbInterfaces,
    usb: Arc<UsbEnumerator>,
}

impl UsbDeviceNode {
    const CHILDREN: &'static [ChildGate<UsbDeviceNode>] = &[
        ChildGate {
            name: "ccid",
            visible: |node| node.interfaces.supports_connection(ConnectionKind::SmartCard),
            create: |node| node.connection_node(ConnectionKind::SmartCard),
        },
        ChildGate {
            name: "otp",
            visible: |node| node.interfaces.supports_connection(ConnectionKind::Otp),
            create: |node| node.connection_node(ConnectionKind::Otp),
        },
        ChildGate {
            name: "fido",
            visible: |node| node.interfaces.supports_connection(ConnectionKind::Fido),
            create: |node| node.connection_node(ConnectionKind::Fido),
        },
    ];

    pub fn new(entry: UsbEntry, usb: Arc<UsbEnumerator>) -> Self {
        let interfaces = entry
            .device
            .pid()
            .map(UsbPid::interfaces)
            .unwrap_or_default();
        Self {
            device: entry.device,
            info: entry.info,
            interfaces,
            usb,
        }
    }

    /// Open `kind`, falling back to resolution by serial, then by uniqueness
    fn open(&self, kind: ConnectionKind) -> RpcResult<Box<dyn Connection>> {
        if self.device.supports_connection(kind) {
            return Ok(self.device.open_connection(kind)?);
        }

        let scanner = self.usb.scanner();
        if let Some(serial) = self.info.serial {
            debug!("Connecting to {} over {} by serial", serial, kind);
            return scanner
                .connect_to_device(Some(serial), &[kind])
                .map_err(|e| match e {
                    DeviceError::NotFound => {
                        DeviceError::transport(format!("Device {} is no longer attached", serial))
                    }
                    other => other,
                })
                .map_err(RpcError::from);
        }

        if scanner.scan_devices()?.count_supporting(kind) != 1 {
            return Err(RpcError::AmbiguousDevice {
                connection: kind.to_string(),
            });
        }
        Ok(scanner.connect_to_device(None, &[kind])?)
    }

    fn connection_node(&mut self, kind: ConnectionKind) -> RpcResult<Box<dyn Node>> {
        let connection = self.open(kind)?;
        let node = ConnectionNode::new(self.device.transport(), connection, Some(self.info.clone()))?;
        Ok(Box::new(node))
    }
}

impl Node for UsbDeviceNode {
    fn data(&mut self) -> RpcResult<Data> {
        let (info, data) = read_identity(self.device.as_ref())?;
        self.info = info;
        Ok(data)
    }

    fn children(&mut self) -> RpcResult<Children> {
        Ok(gated_children(self, Self::CHILDREN))
    }

    fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        create_gated(self, Self::CHILDREN, name)
    }

    fn is_fault_boundary(&self) -> bool {
        true
    }
}

/// A key presented through an external reader (NFC or contact)
pub struct ReaderDeviceNode {
    device: Arc<dyn DeviceHandle>,
}

impl ReaderDeviceNode {
    const CHILDREN: &'static [ChildGate<ReaderDeviceNode>] = &[
        ChildGate {
            name: "ccid",
            visible: |node| node.device.supports_connection(ConnectionKind::SmartCard),
            create: ReaderDeviceNode::ccid,
        },
        ChildGate {
            name: "fido",
            visible: |node| node.device.supports_connection(ConnectionKind::Fido),
            create: ReaderDeviceNode::fido,
        },
    ];

    pub fn new(device: Arc<dyn DeviceHandle>) -> Self {
        Self { device }
    }

    fn ccid(&mut self) -> RpcResult<Box<dyn Node>> {
        let mut connection = self.device.open_connection(ConnectionKind::SmartCard)?;
        let info = match connection.read_info(None) {
            Ok(info) => info,
            Err(e) => {
                connection.close();
                return Err(e.into());
            }
        };
        let node = ConnectionNode::new(self.device.transport(), connection, Some(info))?;
        Ok(Box::new(node))
    }

    /// FIDO over the reader, after probing the key over smartcard
    fn fido(&mut self) -> RpcResult<Box<dyn Node>> {
        let mut probe = self.device.open_connection(ConnectionKind::SmartCard)?;
        let info = probe.read_info(None);
        probe.close();
        let info = info?;

        let connection = self.device.open_connection(ConnectionKind::Fido)?;
        let node = ConnectionNode::new(self.device.transport(), connection, Some(info))?;
        Ok(Box::new(node))
    }
}

impl Node for ReaderDeviceNode {
    fn data(&mut self) -> RpcResult<Data> {
        match read_identity(self.device.as_ref()) {
            Ok((_, mut data)) => {
                data.insert("present".to_string(), true.into());
                Ok(data)
            }
            Err(e) => {
                debug!("No key in reader: {}", e);
                let mut data = Data::new();
                data.insert("present".to_string(), false.into());
                Ok(data)
            }
        }
    }

    fn children(&mut self) -> RpcResult<Children> {
        Ok(gated_children(self, Self::CHILDREN))
    }

    fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        create_gated(self, Self::CHILDREN, name)
    }

    fn is_fault_boundary(&self) -> bool {
        true
    }
}
