// Jackson Coxson

use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::{Arc, Mutex},
};

use log::debug;
use tokio::net::TcpStream;

use crate::{pairing_file::PairingFile, Idevice, LockdownError};

/// Boxed future returned by providers
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LockdownError>> + Send + 'a>>;

/// A handle to one connected device
/// This is an ugly trait until async traits are stabilized
///
/// Handles are shared between sessions and only read; every `connect` opens an
/// independent channel owned by the caller.
pub trait IdeviceProvider: Unpin + Send + Sync + std::fmt::Debug {
    /// Opens a new connection to `port` on the device
    fn connect(&self, port: u16) -> ProviderFuture<'static, Idevice>;

    fn label(&self) -> &str;

    /// Unique Device Identifier
    fn udid(&self) -> &str;

    /// The host's pair record for this device, `None` if the host never paired
    fn get_pairing_file(&self) -> ProviderFuture<'static, Option<PairingFile>>;

    /// Persists a pair record produced by a successful pairing
    fn save_pairing_file(&self, pairing_file: PairingFile) -> ProviderFuture<'static, ()>;

    /// Identifier of this host sent along with pairing requests
    fn get_system_buid(&self) -> ProviderFuture<'static, String> {
        Box::pin(async { Ok(uuid::Uuid::new_v4().to_string().to_uppercase()) })
    }
}

/// Enumerates device handles
pub trait DeviceSource: Send + Sync {
    /// Lists the currently available devices; connections they open carry `label`
    fn devices<'a>(&'a self, label: &'a str) -> ProviderFuture<'a, Vec<Arc<dyn IdeviceProvider>>>;
}

impl DeviceSource for Vec<Arc<dyn IdeviceProvider>> {
    fn devices<'a>(&'a self, _label: &'a str) -> ProviderFuture<'a, Vec<Arc<dyn IdeviceProvider>>> {
        let devices = self.clone();
        Box::pin(async move { Ok(devices) })
    }
}

/// A device reachable over the network at a known address
#[derive(Debug)]
pub struct TcpProvider {
    pub addr: IpAddr,
    pub udid: String,
    pub label: String,
    pairing_file: Mutex<Option<PairingFile>>,
}

impl TcpProvider {
    pub fn new(
        addr: IpAddr,
        udid: impl Into<String>,
        pairing_file: Option<PairingFile>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            addr,
            udid: udid.into(),
            label: label.into(),
            pairing_file: Mutex::new(pairing_file),
        }
    }

    fn stored_pairing_file(&self) -> Option<PairingFile> {
        match self.pairing_file.lock() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl IdeviceProvider for TcpProvider {
    fn connect(&self, port: u16) -> ProviderFuture<'static, Idevice> {
        let addr = self.addr;
        let label = self.label.clone();
        Box::pin(async move {
            let socket_addr = SocketAddr::new(addr, port);
            debug!("Connecting to {socket_addr}");
            let stream = TcpStream::connect(socket_addr).await?;
            Ok(Idevice::new(Box::new(stream), label))
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn udid(&self) -> &str {
        &self.udid
    }

    fn get_pairing_file(&self) -> ProviderFuture<'static, Option<PairingFile>> {
        let pairing_file = self.stored_pairing_file();
        Box::pin(async move { Ok(pairing_file) })
    }

    fn save_pairing_file(&self, pairing_file: PairingFile) -> ProviderFuture<'static, ()> {
        match self.pairing_file.lock() {
            Ok(mut p) => *p = Some(pairing_file),
            Err(poisoned) => *poisoned.into_inner() = Some(pairing_file),
        }
        Box::pin(async { Ok(()) })
    }
}
