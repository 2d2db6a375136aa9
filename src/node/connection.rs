use tracing::debug;

use super::{create_gated, gated_children, ChildGate, Children, Data, Node};
use super::{Ctap2Node, ManagementNode, OathNode, YubiOtpNode};
use crate::data;
use crate::error::RpcResult;
use crate::model::{Capabilities, ConnectionKind, DeviceInfo, Transport, Version};
use crate::ports::Connection;

/// Firmware from which OTP commands can be tunnelled over USB smartcard
const OTP_OVER_CCID: Version = Version::new(5, 3, 0);

/// One open transport connection and the protocol applications behind it
pub struct ConnectionNode {
    transport: Transport,
    connection: Box<dyn Connection>,
    info: DeviceInfo,
}

impl ConnectionNode {
    const CHILDREN: &'static [ChildGate<ConnectionNode>] = &[
        ChildGate {
            name: "management",
            visible: |node| node.transport == Transport::Usb || node.is_smartcard(),
            create: |node| Ok(Box::new(ManagementNode::new(node.connection.management()?))),
        },
        ChildGate {
            name: "oath",
            visible: |node| node.is_smartcard() && node.capabilities().contains(Capabilities::OATH),
            create: |node| Ok(Box::new(OathNode::new(node.connection.oath()?))),
        },
        ChildGate {
            name: "ctap2",
            visible: |node| {
                node.connection.kind() == ConnectionKind::Fido
                    && node.capabilities().contains(Capabilities::FIDO2)
            },
            create: |node| Ok(Box::new(Ctap2Node::new(node.connection.ctap2()?)?)),
        },
        ChildGate {
            name: "yubiotp",
            visible: ConnectionNode::yubiotp_visible,
            create: |node| Ok(Box::new(YubiOtpNode::new(node.connection.yubiotp()?))),
        },
    ];

    /// Takes ownership of `connection`; reads device info over it when none is given
    pub fn new(
        transport: Transport,
        mut connection: Box<dyn Connection>,
        info: Option<DeviceInfo>,
    ) -> RpcResult<Self> {
        let info = match info {
            Some(info) => info,
            None => match connection.read_info(None) {
                Ok(info) => info,
                Err(e) => {
                    connection.close();
                    return Err(e.into());
                }
            },
        };
        debug!("Opened {} connection over {}", connection.kind(), transport);
        Ok(Self {
            transport,
            connection,
            info,
        })
    }

    fn is_smartcard(&self) -> bool {
        self.connection.kind() == ConnectionKind::SmartCard
    }

    /// Enabled capabilities for this connection's transport
    pub fn capabilities(&self) -> Capabilities {
        self.info.enabled(self.transport)
    }

    /// Re-read info for smartcard and USB connections, whose capability
    /// state can change while the connection is open
    fn refresh_info(&mut self) -> RpcResult<()> {
        if self.is_smartcard() || self.transport == Transport::Usb {
            self.info = self.connection.read_info(None)?;
        }
        Ok(())
    }

    fn yubiotp_visible(&self) -> bool {
        if !self.capabilities().contains(Capabilities::OTP) {
            return false;
        }
        match self.connection.kind() {
            ConnectionKind::Otp => true,
            ConnectionKind::SmartCard => {
                self.transport == Transport::Nfc || self.info.version >= OTP_OVER_CCID
            }
            ConnectionKind::Fido => false,
        }
    }
}

impl Node for ConnectionNode {
    fn data(&mut self) -> RpcResult<Data> {
        self.refresh_info()?;
        Ok(data! {
            "version" => self.info.version,
            "serial" => self.info.serial,
        })
    }

    fn children(&mut self) -> RpcResult<Children> {
        Ok(gated_children(self, Self::CHILDREN))
    }

    fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        self.refresh_info()?;
        create_gated(self, Self::CHILDREN, name)
    }

    fn close(&mut self) {
        debug!("Closing {} connection", self.connection.kind());
        self.connection.close();
    }
}
