//! USB Multiplexing Daemon (usbmuxd) Client
//!
//! usbmuxd owns the connections to iOS devices over USB and the network, and stores
//! the host's pair records. This module supplies the device handles a lockdown
//! session runs on.

use std::{
    net::{AddrParseError, IpAddr, SocketAddr},
    str::FromStr,
    sync::Arc,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    pairing_file::PairingFile,
    provider::{DeviceSource, IdeviceProvider, ProviderFuture},
    Idevice, LockdownError, ReadWrite,
};

mod des;
mod raw_packet;

use raw_packet::{RawHeader, RawPacket, HEADER_LEN};

/// Represents the connection type of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// Connected via USB
    Usb,
    /// Connected via network with specific IP address
    Network(IpAddr),
    /// Unknown connection type with description
    Unknown(String),
}

/// Represents a device connected through usbmuxd
#[derive(Debug, Clone)]
pub struct UsbmuxdDevice {
    /// How the device is connected
    pub connection_type: Connection,
    /// Unique Device Identifier
    pub udid: String,
    /// usbmuxd-assigned device ID
    pub device_id: u32,
}

/// Active connection to the usbmuxd service
pub struct UsbmuxdConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
}

/// Address of the usbmuxd service
#[derive(Clone, Debug)]
pub enum UsbmuxdAddr {
    /// Unix domain socket path (Unix systems only)
    #[cfg(unix)]
    UnixSocket(String),
    /// TCP socket address
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    /// Default TCP port for usbmuxd
    pub const DEFAULT_PORT: u16 = 27015;
    /// Default Unix socket path for usbmuxd
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";

    /// Connects to the usbmuxd service
    pub async fn to_socket(&self) -> Result<Box<dyn ReadWrite>, LockdownError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    /// Creates a new usbmuxd connection
    ///
    /// # Arguments
    /// * `tag` - Connection tag/identifier
    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, LockdownError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxdConnection::new(socket, tag))
    }

    /// Creates a UsbmuxdAddr from environment variable
    ///
    /// Checks `USBMUXD_SOCKET_ADDRESS`, falls back to the platform default
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        Ok(match std::env::var("USBMUXD_SOCKET_ADDRESS") {
            Ok(var) => Self::parse(&var)?,
            Err(_) => Self::default(),
        })
    }

    /// `host:port` selects TCP, anything else is a unix socket path
    fn parse(var: &str) -> Result<Self, AddrParseError> {
        #[cfg(unix)]
        if !var.contains(':') {
            return Ok(Self::UnixSocket(var.to_string()));
        }
        Ok(Self::TcpSocket(SocketAddr::from_str(var)?))
    }
}

impl Default for UsbmuxdAddr {
    /// Creates default usbmuxd address based on platform:
    /// - Unix: Uses default socket path
    /// - Non-Unix: Uses localhost TCP port
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

impl DeviceSource for UsbmuxdAddr {
    fn devices<'a>(&'a self, label: &'a str) -> ProviderFuture<'a, Vec<Arc<dyn IdeviceProvider>>> {
        Box::pin(async move {
            let mut usbmuxd = self.connect(0).await?;
            let devices = usbmuxd.get_devices().await?;
            Ok(devices
                .iter()
                .map(|d| Arc::new(d.to_provider(self.clone(), label)) as Arc<dyn IdeviceProvider>)
                .collect())
        })
    }
}

impl UsbmuxdConnection {
    /// Binary PLIST protocol version
    pub const BINARY_PLIST_VERSION: u32 = 0;
    /// XML PLIST protocol version
    pub const XML_PLIST_VERSION: u32 = 1;

    /// Result message type
    pub const RESULT_MESSAGE_TYPE: u32 = 1;
    /// PLIST message type
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    /// Creates a new usbmuxd connection
    ///
    /// # Arguments
    /// * `socket` - The transport stream
    /// * `tag` - Connection tag/identifier
    pub fn new(socket: Box<dyn ReadWrite>, tag: u32) -> Self {
        Self { socket, tag }
    }

    /// Lists all connected devices
    ///
    /// Entries usbmuxd describes incompletely are skipped.
    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, LockdownError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        req.insert("ClientVersionString".into(), "idevice-lockdown".into());
        req.insert("kLibUSBMuxVersion".into(), 3.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        let res = plist::from_value::<des::ListDevicesResponse>(&plist::Value::Dictionary(res))?;

        let devs = res
            .device_list
            .into_iter()
            .flat_map(UsbmuxdDevice::try_from)
            .collect::<Vec<UsbmuxdDevice>>();

        Ok(devs)
    }

    /// Gets a specific device by UDID
    pub async fn get_device(&mut self, udid: &str) -> Result<UsbmuxdDevice, LockdownError> {
        let devices = self.get_devices().await?;
        match devices.into_iter().find(|x| x.udid == udid) {
            Some(d) => Ok(d),
            None => Err(LockdownError::DeviceNotFound),
        }
    }

    /// Gets the pairing record for a device, `None` if usbmuxd has none stored
    pub async fn get_pair_record(
        &mut self,
        udid: &str,
    ) -> Result<Option<PairingFile>, LockdownError> {
        debug!("Getting pair record for {udid}");
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadPairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => Ok(Some(PairingFile::from_bytes(d)?)),
            _ => match res.get("Number").and_then(|n| n.as_unsigned_integer()) {
                Some(n) if n != 0 => {
                    debug!("usbmuxd has no pair record for {udid} ({n})");
                    Ok(None)
                }
                _ => Err(LockdownError::ProtocolError(
                    "ReadPairRecord reply has no record".into(),
                )),
            },
        }
    }

    /// Gets the BUID
    pub async fn get_buid(&mut self) -> Result<String, LockdownError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadBUID".into());
        self.write_plist(req).await?;
        let mut res = self.read_plist().await?;

        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(LockdownError::ProtocolError(
                "ReadBUID reply has no BUID".into(),
            )),
        }
    }

    /// Connects to a port on the device, consuming the muxer connection
    ///
    /// # Arguments
    /// * `device_id` - usbmuxd device ID
    /// * `port` - TCP port to connect to (host byte order)
    /// * `label` - Connection label
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<Idevice, LockdownError> {
        debug!("Connecting to device {device_id} on port {port}");
        let port = port.to_be();

        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PortNumber".into(), port.into());
        self.write_plist(req).await?;
        match self
            .read_plist()
            .await?
            .get("Number")
            .and_then(|n| n.as_unsigned_integer())
        {
            Some(0) => Ok(Idevice::new(self.socket, label)),
            Some(2) => Err(LockdownError::DeviceNotFound),
            Some(3) => Err(LockdownError::DeviceBusy),
            Some(n) => Err(LockdownError::ProtocolError(format!(
                "usbmuxd refused Connect with result {n}"
            ))),
            None => Err(LockdownError::ProtocolError(
                "Connect reply has no result".into(),
            )),
        }
    }

    /// Tells usbmuxd to save the pairing record in its storage
    ///
    /// # Arguments
    /// * `device_id` - usbmuxd device ID
    /// * `udid` - the device UDID/serial
    /// * `pair_record` - a serialized plist of the pair record
    pub async fn save_pair_record(
        &mut self,
        device_id: u32,
        udid: &str,
        pair_record: Vec<u8>,
    ) -> Result<(), LockdownError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "SavePairRecord".into());
        req.insert("PairRecordData".into(), plist::Value::Data(pair_record));
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        match res.get("Number").and_then(|x| x.as_unsigned_integer()) {
            Some(0) => Ok(()),
            _ => Err(LockdownError::ProtocolError(
                "usbmuxd failed to save the pair record".into(),
            )),
        }
    }

    /// Writes a PLIST message to usbmuxd
    async fn write_plist(&mut self, req: plist::Dictionary) -> Result<(), LockdownError> {
        let raw = RawPacket::new(
            req,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
            self.tag,
        );

        self.socket.write_all(&raw.encode()?).await?;
        self.socket.flush().await?;
        Ok(())
    }

    /// Reads a PLIST message from usbmuxd
    async fn read_plist(&mut self) -> Result<plist::Dictionary, LockdownError> {
        let mut header_buffer = [0; HEADER_LEN as usize];
        self.socket.read_exact(&mut header_buffer).await?;
        let header = RawHeader::parse(&header_buffer)?;
        debug!("Reading {} bytes from muxer", header.body_len());

        let mut body_buffer = vec![0; header.body_len() as usize];
        self.socket.read_exact(&mut body_buffer).await?;

        let res = plist::from_bytes(&body_buffer)?;
        debug!("Read from muxer: {}", crate::pretty_print_dictionary(&res));

        Ok(res)
    }
}

impl UsbmuxdDevice {
    /// Creates a provider for this device
    ///
    /// # Arguments
    /// * `addr` - usbmuxd address
    /// * `label` - Connection label
    pub fn to_provider(&self, addr: UsbmuxdAddr, label: impl Into<String>) -> UsbmuxdProvider {
        UsbmuxdProvider {
            addr,
            tag: self.device_id,
            udid: self.udid.clone(),
            device_id: self.device_id,
            label: label.into(),
        }
    }
}

/// A device reached through usbmuxd
#[derive(Debug)]
pub struct UsbmuxdProvider {
    pub addr: UsbmuxdAddr,
    pub tag: u32,
    pub udid: String,
    pub device_id: u32,
    pub label: String,
}

impl IdeviceProvider for UsbmuxdProvider {
    fn connect(&self, port: u16) -> ProviderFuture<'static, Idevice> {
        let addr = self.addr.clone();
        let tag = self.tag;
        let device_id = self.device_id;
        let label = self.label.clone();

        Box::pin(async move {
            let usbmuxd = addr.connect(tag).await?;
            usbmuxd.connect_to_device(device_id, port, &label).await
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn udid(&self) -> &str {
        &self.udid
    }

    fn get_pairing_file(&self) -> ProviderFuture<'static, Option<PairingFile>> {
        let addr = self.addr.clone();
        let tag = self.tag;
        let udid = self.udid.clone();

        Box::pin(async move {
            let mut usbmuxd = addr.connect(tag).await?;
            usbmuxd.get_pair_record(&udid).await
        })
    }

    fn save_pairing_file(&self, pairing_file: PairingFile) -> ProviderFuture<'static, ()> {
        let addr = self.addr.clone();
        let tag = self.tag;
        let udid = self.udid.clone();
        let device_id = self.device_id;

        Box::pin(async move {
            let record = pairing_file.serialize()?;
            let mut usbmuxd = addr.connect(tag).await?;
            usbmuxd.save_pair_record(device_id, &udid, record).await
        })
    }

    fn get_system_buid(&self) -> ProviderFuture<'static, String> {
        let addr = self.addr.clone();
        let tag = self.tag;

        Box::pin(async move {
            let mut usbmuxd = addr.connect(tag).await?;
            usbmuxd.get_buid().await
        })
    }
}
