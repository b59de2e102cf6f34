//! Client for the lockdownd control channel of iOS devices.
//!
//! A [`LockdownSession`] connects to the lockdown daemon of one device, runs the
//! handshake (optionally pairing and upgrading to TLS), answers value queries and
//! asks the daemon to start services. A started service is returned as a
//! [`ServiceDescriptor`], which can be pinged or turned into a live connection for a
//! service client.
// Jackson Coxson

pub mod lockdownd;
pub mod pairing;
pub mod pairing_file;
pub mod provider;
pub mod service;
mod ssl;
#[cfg(test)]
mod test_util;
pub mod usbmuxd;
mod util;

pub use lockdownd::{LockdownConfig, LockdownSession, SessionState, TrustState};
pub use service::ServiceDescriptor;
pub use util::{pretty_print_dictionary, pretty_print_plist};

use log::{debug, trace};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's TcpStream and UnixStream implement this trait, as does a TLS stream
/// wrapping either of them.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

// Blanket implementation for any compatible type
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Type alias for boxed device connection sockets
pub type IdeviceSocket = Box<dyn ReadWrite>;

/// Largest plist frame accepted from a device
const MAX_PLIST_LEN: u32 = 16 * 1024 * 1024;

/// An exclusively owned connection to one port on a device
///
/// Frames plist records as a 4 byte big endian length followed by an XML plist.
/// Dropping the value closes the connection.
#[derive(Debug)]
pub struct Idevice {
    /// The underlying connection socket, boxed for dynamic dispatch
    socket: Option<IdeviceSocket>,
    /// Label sent with every lockdown request
    label: String,
}

impl Idevice {
    /// Creates a new device connection handle
    ///
    /// # Arguments
    /// * `socket` - The established connection socket
    /// * `label` - Identifies this client to the daemon
    pub fn new(socket: IdeviceSocket, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the socket is still held
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Queries the type of the daemon on the other end
    ///
    /// Lockdownd answers `com.apple.mobile.lockdown`.
    pub async fn get_type(&mut self) -> Result<String, LockdownError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("Request".into(), "QueryType".into());
        self.send_plist(plist::Value::Dictionary(req)).await?;
        let message = self.read_plist().await?;
        match message.get("Type").and_then(|t| t.as_string()) {
            Some(t) => Ok(t.to_string()),
            None => Err(LockdownError::ProtocolError(
                "QueryType reply has no Type".into(),
            )),
        }
    }

    /// Sends a plist-formatted message to the device
    pub(crate) async fn send_plist(&mut self, message: plist::Value) -> Result<(), LockdownError> {
        let socket = self.socket.as_mut().ok_or(LockdownError::InvalidState)?;
        debug!("Sending plist: {}", pretty_print_plist(&message));

        let message = util::plist_to_xml_bytes(&message)?;
        let len = message.len() as u32;
        socket.write_all(&len.to_be_bytes()).await?;
        socket.write_all(&message).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Reads a plist without interpreting an `Error` key
    pub(crate) async fn read_raw_plist(&mut self) -> Result<plist::Dictionary, LockdownError> {
        let socket = self.socket.as_mut().ok_or(LockdownError::InvalidState)?;
        trace!("Reading response size");
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await?;
        let len = u32::from_be_bytes(buf);
        if len > MAX_PLIST_LEN {
            // the body is left unread, so the stream can't be resynchronized
            self.close();
            return Err(LockdownError::ProtocolError(format!(
                "plist frame of {len} bytes is too large"
            )));
        }
        let mut buf = vec![0; len as usize];
        socket.read_exact(&mut buf).await?;
        let res: plist::Dictionary = plist::from_bytes(&buf)?;
        debug!("Received plist: {}", pretty_print_dictionary(&res));
        Ok(res)
    }

    /// Reads a plist-formatted message from the device
    ///
    /// A reply carrying an `Error` key is translated into a [`LockdownError`].
    pub(crate) async fn read_plist(&mut self) -> Result<plist::Dictionary, LockdownError> {
        let res = self.read_raw_plist().await?;
        match res.get("Error") {
            Some(plist::Value::String(e)) => Err(LockdownError::from_device_error(e)),
            Some(_) => Err(LockdownError::ProtocolError(
                "Error key is not a string".into(),
            )),
            None => Ok(res),
        }
    }

    /// Sends raw bytes to the device
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), LockdownError> {
        let socket = self.socket.as_mut().ok_or(LockdownError::InvalidState)?;
        socket.write_all(message).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Reads up to `max_size` bytes from the device
    ///
    /// An empty result means the peer closed the connection.
    pub async fn read_any(&mut self, max_size: u32) -> Result<Vec<u8>, LockdownError> {
        let socket = self.socket.as_mut().ok_or(LockdownError::InvalidState)?;
        let mut buf = vec![0; max_size as usize];
        let len = socket.read(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Upgrades the connection to TLS using the host's pairing credentials
    ///
    /// The socket is consumed by the handshake; on failure the connection is gone.
    pub async fn start_session(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), LockdownError> {
        let socket = self.socket.take().ok_or(LockdownError::InvalidState)?;
        let stream = ssl::upgrade(socket, pairing_file).await?;
        self.socket = Some(Box::new(stream));
        Ok(())
    }

    /// Drops the socket. Safe to call more than once.
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            trace!("Closed connection {}", self.label);
        }
    }
}

/// Every failure the lockdown client reports
///
/// Errors sent by the daemon are translated into this set; raw daemon codes never
/// reach the caller.
#[derive(Error, Debug)]
#[repr(i32)]
#[non_exhaustive]
pub enum LockdownError {
    #[error("device not found")]
    DeviceNotFound = -1,
    #[error("connection to the device failed")]
    ConnectionFailed(#[source] io::Error) = -2,
    #[error("device disconnected")]
    DeviceDisconnected = -3,
    #[error("device refused the connection")]
    DeviceBusy = -4,
    #[error("operation is not valid in the current session state")]
    InvalidState = -5,
    #[error("host is not paired with the device")]
    PairingRequired = -6,
    #[error("service not found")]
    ServiceNotFound = -7,
    #[error("device refused to start the service")]
    InvalidService = -8,
    #[error("device is passcode protected")]
    PasswordProtected = -9,
    #[error("service is unreachable")]
    ServiceUnreachable = -10,
    #[error("value not found")]
    NotFound = -11,
    #[error("protocol error: {0}")]
    ProtocolError(String) = -12,
    #[error("operation timed out")]
    Timeout = -13,
}

impl LockdownError {
    /// Converts an error string reported by lockdownd to a typed error
    pub(crate) fn from_device_error(e: &str) -> Self {
        match e {
            "InvalidService" | "MissingService" => Self::ServiceNotFound,
            "ServiceProhibited" | "EscrowLocked" | "FMiPProtected" | "MCProtected"
            | "MCChallengeRequired" => Self::InvalidService,
            "ServiceLimit" => Self::DeviceBusy,
            "PasswordProtected" | "DeviceLocked" => Self::PasswordProtected,
            "InvalidHostID"
            | "MissingHostID"
            | "SessionInactive"
            | "InvalidSessionID"
            | "MissingSessionID"
            | "UserDeniedPairing"
            | "PairingDialogResponsePending"
            | "MissingPairRecord"
            | "InvalidPairRecord"
            | "PairingProhibitedOverThisConnection" => Self::PairingRequired,
            "MissingValue" | "MissingKey" | "GetProhibited" => Self::NotFound,
            _ => Self::ProtocolError(format!("daemon reported {e}")),
        }
    }

    /// Stable numeric code of the error
    pub fn code(&self) -> i32 {
        match self {
            LockdownError::DeviceNotFound => -1,
            LockdownError::ConnectionFailed(_) => -2,
            LockdownError::DeviceDisconnected => -3,
            LockdownError::DeviceBusy => -4,
            LockdownError::InvalidState => -5,
            LockdownError::PairingRequired => -6,
            LockdownError::ServiceNotFound => -7,
            LockdownError::InvalidService => -8,
            LockdownError::PasswordProtected => -9,
            LockdownError::ServiceUnreachable => -10,
            LockdownError::NotFound => -11,
            LockdownError::ProtocolError(_) => -12,
            LockdownError::Timeout => -13,
        }
    }
}

impl From<io::Error> for LockdownError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Self::DeviceDisconnected,
            _ => Self::ConnectionFailed(e),
        }
    }
}

impl From<plist::Error> for LockdownError {
    fn from(e: plist::Error) -> Self {
        Self::ProtocolError(format!("malformed plist: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for LockdownError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

impl From<openssl::error::ErrorStack> for LockdownError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Self::ConnectionFailed(io::Error::other(e))
    }
}

impl From<openssl::ssl::Error> for LockdownError {
    fn from(e: openssl::ssl::Error) -> Self {
        Self::ConnectionFailed(io::Error::other(e))
    }
}
