use super::{Ctap2Session, ManagementSession, OathSession, YubiOtpSession};
use crate::error::DeviceResult;
use crate::model::{ConnectionKind, DeviceInfo, Transport, UsbPid};

/// One physical device reachable over one transport
///
/// Owned by the enumerator that discovered it. Opening a connection hands
/// the live I/O resource to the returned [`Connection`].
pub trait DeviceHandle: Send + Sync {
    fn transport(&self) -> Transport;

    /// USB product id, `None` for devices behind a reader
    fn pid(&self) -> Option<UsbPid>;

    /// Name of the reader the device sits in, `None` for direct USB devices
    fn reader_name(&self) -> Option<&str> {
        None
    }

    fn supports_connection(&self, kind: ConnectionKind) -> bool;

    fn open_connection(&self, kind: ConnectionKind) -> DeviceResult<Box<dyn Connection>>;
}

/// An open transport-level channel to a device
///
/// Sessions returned from it talk over this channel and become unusable
/// once it is closed.
pub trait Connection: Send {
    fn kind(&self) -> ConnectionKind;

    fn read_info(&mut self, pid: Option<UsbPid>) -> DeviceResult<DeviceInfo>;

    fn management(&mut self) -> DeviceResult<Box<dyn ManagementSession>>;

    fn oath(&mut self) -> DeviceResult<Box<dyn OathSession>>;

    fn ctap2(&mut self) -> DeviceResult<Box<dyn Ctap2Session>>;

    fn yubiotp(&mut self) -> DeviceResult<Box<dyn YubiOtpSession>>;

    /// Release the underlying resource; idempotent
    fn close(&mut self);
}
