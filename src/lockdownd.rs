//! iOS Lockdown Session
//!
//! Lockdownd is the daemon every host conversation with a device starts with. It
//! reports device values, establishes trust with the host, and starts the other
//! services on request.
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), idevice_lockdown::LockdownError> {
//! use std::sync::Arc;
//! use idevice_lockdown::{usbmuxd::UsbmuxdAddr, LockdownConfig, LockdownSession};
//!
//! let source = Arc::new(UsbmuxdAddr::default());
//! let mut session = LockdownSession::connect(source, None, LockdownConfig::default()).await?;
//! println!("{}", session.device_name().await?);
//! let relay = session.start_service("com.apple.mobile.diagnostics_relay").await?;
//! relay.ping().await?;
//! session.close().await;
//! # Ok(())
//! # }
//! ```

use std::{io, sync::Arc, time::Duration};

use log::{debug, info, warn};

use crate::{
    pairing::{CertificateAuthority, OpensslAuthority},
    pairing_file::PairingFile,
    provider::{DeviceSource, IdeviceProvider},
    service::ServiceDescriptor,
    Idevice, LockdownError,
};

/// The TCP port lockdownd listens on
pub const LOCKDOWND_PORT: u16 = 62078;

/// What lockdownd answers to `QueryType`
const LOCKDOWN_TYPE: &str = "com.apple.mobile.lockdown";

/// Settings for a [`LockdownSession`]
#[derive(Debug, Clone)]
pub struct LockdownConfig {
    /// Sent as `Label` with every request
    pub label: String,
    /// Deadline applied to each blocking step
    pub timeout: Duration,
    /// Pair during `open` when the host is not trusted yet
    pub auto_pair: bool,
    /// Wait between `Pair` retries while the trust dialog is showing
    pub pairing_poll_interval: Duration,
    /// `Pair` attempts before giving up on the trust dialog
    pub pairing_attempts: u32,
}

impl Default for LockdownConfig {
    fn default() -> Self {
        Self {
            label: "idevice-lockdown".to_string(),
            timeout: Duration::from_secs(10),
            auto_pair: false,
            pairing_poll_interval: Duration::from_secs(1),
            pairing_attempts: 30,
        }
    }
}

impl LockdownConfig {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_auto_pair(mut self, auto_pair: bool) -> Self {
        self.auto_pair = auto_pair;
        self
    }

    pub fn with_pairing_poll(mut self, interval: Duration, attempts: u32) -> Self {
        self.pairing_poll_interval = interval;
        self.pairing_attempts = attempts;
        self
    }
}

/// Lifecycle of a session. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Opened,
    Closed,
}

/// Whether the daemon accepted this host's pair record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    /// No trusted session; privileged requests fail with `PairingRequired`
    Untrusted,
    /// A session was started with a valid pair record
    Trusted,
}

/// A control connection to the lockdown daemon of one device
///
/// The session exclusively owns its connection and requires `&mut self` for every
/// request, so requests on one session are strictly sequential. Independent
/// sessions share nothing.
pub struct LockdownSession {
    source: Arc<dyn DeviceSource>,
    config: LockdownConfig,
    authority: Arc<dyn CertificateAuthority>,
    state: SessionState,
    open_failed: bool,
    device: Option<Arc<dyn IdeviceProvider>>,
    idevice: Option<Idevice>,
    trust: TrustState,
    session_id: Option<String>,
    pairing_file: Option<Arc<PairingFile>>,
    device_name: Option<String>,
    device_id: Option<String>,
}

impl std::fmt::Debug for LockdownSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockdownSession")
            .field("udid", &self.udid())
            .field("state", &self.state)
            .field("trust", &self.trust)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl LockdownSession {
    /// Creates an unopened session over `source`
    pub fn new(source: Arc<dyn DeviceSource>, config: LockdownConfig) -> Self {
        Self {
            source,
            config,
            authority: Arc::new(OpensslAuthority),
            state: SessionState::Unopened,
            open_failed: false,
            device: None,
            idevice: None,
            trust: TrustState::Untrusted,
            session_id: None,
            pairing_file: None,
            device_name: None,
            device_id: None,
        }
    }

    /// Creates and opens a session in one step
    pub async fn connect(
        source: Arc<dyn DeviceSource>,
        udid: Option<&str>,
        config: LockdownConfig,
    ) -> Result<Self, LockdownError> {
        let mut session = Self::new(source, config);
        session.open(udid).await?;
        Ok(session)
    }

    /// Replaces the crypto used to generate pairing certificates
    pub fn set_certificate_authority(&mut self, authority: Arc<dyn CertificateAuthority>) {
        self.authority = authority;
    }

    /// Changes the deadline applied to subsequent operations
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn trust(&self) -> TrustState {
        self.trust
    }

    pub fn config(&self) -> &LockdownConfig {
        &self.config
    }

    /// UDID of the device, once a device has been chosen
    pub fn udid(&self) -> Option<&str> {
        self.device.as_ref().map(|d| d.udid())
    }

    /// Identifier of the active lockdown session, if any
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Connects to the device and runs the handshake
    ///
    /// Picks the device with `udid`, or the first one the source lists. If the host
    /// has a pair record the session is upgraded to a trusted (possibly TLS)
    /// session. Without a usable record the session still opens, untrusted, after
    /// pairing was attempted (when `auto_pair` is set) and rejected.
    ///
    /// # Errors
    /// - `DeviceNotFound` if no device matches
    /// - `ConnectionFailed` / `DeviceBusy` if the channel cannot be opened
    /// - `ProtocolError` if the peer is not lockdownd
    /// - `InvalidState` if the session was opened before, successfully or not
    pub async fn open(&mut self, udid: Option<&str>) -> Result<(), LockdownError> {
        if self.state != SessionState::Unopened || self.open_failed {
            return Err(LockdownError::InvalidState);
        }

        match self.handshake(udid).await {
            Ok(()) => {
                info!(
                    "Lockdown session opened with {} ({:?})",
                    self.udid().unwrap_or_default(),
                    self.trust
                );
                Ok(())
            }
            Err(e) => {
                warn!("Failed to open lockdown session: {e}");
                self.release();
                self.device = None;
                self.state = SessionState::Unopened;
                self.open_failed = true;
                Err(match e {
                    LockdownError::DeviceDisconnected => LockdownError::ConnectionFailed(
                        io::Error::from(io::ErrorKind::ConnectionAborted),
                    ),
                    e => e,
                })
            }
        }
    }

    async fn handshake(&mut self, udid: Option<&str>) -> Result<(), LockdownError> {
        let timeout = self.config.timeout;
        let devices = tokio::time::timeout(timeout, self.source.devices(&self.config.label)).await??;
        debug!("Device source listed {} device(s)", devices.len());
        let device = match udid {
            Some(udid) => devices.into_iter().find(|d| d.udid() == udid),
            None => devices.into_iter().next(),
        }
        .ok_or(LockdownError::DeviceNotFound)?;

        let mut idevice = tokio::time::timeout(timeout, device.connect(LOCKDOWND_PORT)).await??;
        let kind = tokio::time::timeout(timeout, idevice.get_type()).await??;
        if kind != LOCKDOWN_TYPE {
            return Err(LockdownError::ProtocolError(format!(
                "expected lockdownd, found {kind}"
            )));
        }

        self.device = Some(device.clone());
        self.idevice = Some(idevice);
        self.state = SessionState::Opened;

        let pairing_file = match tokio::time::timeout(timeout, device.get_pairing_file()).await? {
            Ok(p) => p,
            Err(LockdownError::ProtocolError(e)) => {
                warn!("Unable to use the stored pair record: {e}");
                None
            }
            Err(e) => return Err(e),
        };
        match pairing_file {
            Some(p) => match self.start_trusted_session(Arc::new(p)).await {
                Ok(()) => return Ok(()),
                Err(LockdownError::PairingRequired) => {
                    warn!("Device rejected the stored pair record")
                }
                Err(e) => return Err(e),
            },
            None => debug!("No pair record for {}", device.udid()),
        }

        if self.config.auto_pair {
            match self.pair().await {
                Ok(()) => {}
                Err(LockdownError::PairingRequired) | Err(LockdownError::PasswordProtected) => {
                    warn!("Pairing was not accepted, continuing untrusted")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Sends `StartSession` with the record and upgrades to TLS when asked to
    async fn start_trusted_session(
        &mut self,
        pairing_file: Arc<PairingFile>,
    ) -> Result<(), LockdownError> {
        let mut req = self.request_base("StartSession");
        req.insert("HostID".into(), pairing_file.host_id.clone().into());
        req.insert(
            "SystemBUID".into(),
            pairing_file.system_buid.clone().into(),
        );
        let res = self.request(req).await?;

        let ssl = match res.get("EnableSessionSSL") {
            Some(plist::Value::Boolean(ssl)) => *ssl,
            Some(_) => {
                return Err(LockdownError::ProtocolError(
                    "EnableSessionSSL is not a boolean".into(),
                ))
            }
            None => false,
        };
        let session_id = res
            .get("SessionID")
            .and_then(|s| s.as_string())
            .map(ToString::to_string);

        if ssl {
            let timeout = self.config.timeout;
            let idevice = self.idevice.as_mut().ok_or(LockdownError::InvalidState)?;
            let res = tokio::time::timeout(timeout, idevice.start_session(&pairing_file)).await;
            self.settle(res)?;
        }

        debug!("Lockdown session {session_id:?} started, ssl: {ssl}");
        self.session_id = session_id;
        self.pairing_file = Some(pairing_file);
        self.trust = TrustState::Trusted;
        Ok(())
    }

    /// Pairs this host with the device, then starts a trusted session
    ///
    /// The device shows a trust dialog; while it is pending the request is retried
    /// every `pairing_poll_interval`, at most `pairing_attempts` times. The new pair
    /// record is saved through the device handle before the session starts.
    ///
    /// # Errors
    /// - `PairingRequired` if the user declined or never answered
    /// - `PasswordProtected` if the device must be unlocked first
    pub async fn pair(&mut self) -> Result<(), LockdownError> {
        self.ensure_opened()?;
        if self.trust == TrustState::Trusted {
            return Ok(());
        }
        let device = self.device.clone().ok_or(LockdownError::InvalidState)?;

        let pub_key = match self.get_value(None, Some("DevicePublicKey")).await? {
            plist::Value::Data(d) => d,
            _ => {
                warn!("Did not get public key data response");
                return Err(LockdownError::ProtocolError(
                    "DevicePublicKey is not data".into(),
                ));
            }
        };
        let wifi_mac = match self.get_value(None, Some("WiFiAddress")).await? {
            plist::Value::String(s) => s,
            _ => {
                warn!("Did not get WiFiAddress string");
                return Err(LockdownError::ProtocolError(
                    "WiFiAddress is not a string".into(),
                ));
            }
        };

        let authority = self.authority.clone();
        let certs = tokio::task::spawn_blocking(move || authority.generate(&pub_key))
            .await
            .map_err(|e| LockdownError::ProtocolError(format!("certificate generation failed: {e}")))??;

        let host_id = uuid::Uuid::new_v4().to_string().to_uppercase();
        let system_buid =
            tokio::time::timeout(self.config.timeout, device.get_system_buid()).await??;

        let mut record = plist::Dictionary::new();
        record.insert(
            "DeviceCertificate".into(),
            plist::Value::Data(certs.device_certificate.clone()),
        );
        record.insert(
            "HostCertificate".into(),
            plist::Value::Data(certs.host_certificate.clone()),
        );
        record.insert("HostID".into(), host_id.clone().into());
        record.insert(
            "RootCertificate".into(),
            plist::Value::Data(certs.root_certificate.clone()),
        );
        record.insert("SystemBUID".into(), system_buid.clone().into());

        let mut options = plist::Dictionary::new();
        options.insert("ExtendedPairingErrors".into(), true.into());

        let mut req = self.request_base("Pair");
        req.insert("PairRecord".into(), plist::Value::Dictionary(record));
        req.insert("ProtocolVersion".into(), "2".into());
        req.insert("PairingOptions".into(), plist::Value::Dictionary(options));

        let mut attempts = 0;
        let escrow_bag = loop {
            let res = self.raw_request(req.clone()).await?;
            match res.get("Error") {
                None => {
                    break res
                        .get("EscrowBag")
                        .and_then(|e| e.as_data())
                        .map(|e| e.to_vec())
                        .unwrap_or_default()
                }
                Some(plist::Value::String(e)) if e == "PairingDialogResponsePending" => {
                    attempts += 1;
                    if attempts >= self.config.pairing_attempts {
                        warn!("Trust dialog was not answered after {attempts} attempts");
                        return Err(LockdownError::PairingRequired);
                    }
                    info!("Waiting for the user to trust this host");
                    tokio::time::sleep(self.config.pairing_poll_interval).await;
                }
                Some(plist::Value::String(e)) => return Err(LockdownError::from_device_error(e)),
                Some(_) => {
                    return Err(LockdownError::ProtocolError(
                        "Error key is not a string".into(),
                    ))
                }
            }
        };

        let pairing_file = PairingFile {
            device_certificate: certs.device_certificate,
            host_private_key: certs.host_private_key,
            host_certificate: certs.host_certificate,
            root_private_key: certs.root_private_key,
            root_certificate: certs.root_certificate,
            system_buid,
            host_id,
            escrow_bag,
            wifi_mac_address: wifi_mac,
            udid: Some(device.udid().to_string()),
        };
        tokio::time::timeout(
            self.config.timeout,
            device.save_pairing_file(pairing_file.clone()),
        )
        .await??;
        info!("Paired with {}", device.udid());

        self.start_trusted_session(Arc::new(pairing_file)).await
    }

    /// Retrieves a value from the device
    ///
    /// # Arguments
    /// * `domain` - Optional domain, e.g. `com.apple.disk_usage`
    /// * `key` - The key to read; `None` returns the whole domain as a dictionary
    ///
    /// # Errors
    /// `NotFound` if the daemon has no such value or refuses to reveal it
    pub async fn get_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
    ) -> Result<plist::Value, LockdownError> {
        let mut req = self.request_base("GetValue");
        if let Some(key) = key {
            req.insert("Key".into(), key.into());
        }
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        let mut res = self.request(req).await?;
        res.remove("Value").ok_or(LockdownError::NotFound)
    }

    /// Retrieves every value of a domain
    pub async fn get_all_values(
        &mut self,
        domain: Option<&str>,
    ) -> Result<plist::Dictionary, LockdownError> {
        match self.get_value(domain, None).await? {
            plist::Value::Dictionary(d) => Ok(d),
            _ => Err(LockdownError::ProtocolError(
                "GetValue without a key did not return a dictionary".into(),
            )),
        }
    }

    /// Sets a value on the device
    pub async fn set_value(
        &mut self,
        domain: Option<&str>,
        key: &str,
        value: plist::Value,
    ) -> Result<(), LockdownError> {
        let mut req = self.request_base("SetValue");
        req.insert("Key".into(), key.into());
        req.insert("Value".into(), value);
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.request(req).await?;
        Ok(())
    }

    async fn get_string_value(&mut self, key: &str) -> Result<String, LockdownError> {
        match self.get_value(None, Some(key)).await? {
            plist::Value::String(s) => Ok(s),
            _ => Err(LockdownError::ProtocolError(format!("{key} is not a string"))),
        }
    }

    /// The user-visible name of the device, cached after the first read
    pub async fn device_name(&mut self) -> Result<&str, LockdownError> {
        if self.device_name.is_none() {
            self.device_name = Some(self.get_string_value("DeviceName").await?);
        }
        self.device_name.as_deref().ok_or(LockdownError::InvalidState)
    }

    /// The UDID as reported by the device, cached after the first read
    pub async fn device_id(&mut self) -> Result<&str, LockdownError> {
        if self.device_id.is_none() {
            self.device_id = Some(self.get_string_value("UniqueDeviceID").await?);
        }
        self.device_id.as_deref().ok_or(LockdownError::InvalidState)
    }

    /// Asks lockdownd to start a service
    ///
    /// # Arguments
    /// * `identifier` - The service identifier, e.g. `com.apple.mobile.diagnostics_relay`
    ///
    /// # Errors
    /// - `PairingRequired` if the session is not trusted
    /// - `ServiceNotFound` if the device does not know the service
    /// - `InvalidService` if the device refuses to start it
    /// - `PasswordProtected` if the device must be unlocked first
    ///
    /// The session stays usable after any of these.
    pub async fn start_service(
        &mut self,
        identifier: impl Into<String>,
    ) -> Result<ServiceDescriptor, LockdownError> {
        self.start_service_inner(identifier.into(), false).await
    }

    /// Like [`Self::start_service`], also sending the pair record's escrow bag so the
    /// service can start while the device is locked
    pub async fn start_service_with_escrow_bag(
        &mut self,
        identifier: impl Into<String>,
    ) -> Result<ServiceDescriptor, LockdownError> {
        self.start_service_inner(identifier.into(), true).await
    }

    async fn start_service_inner(
        &mut self,
        identifier: String,
        escrow: bool,
    ) -> Result<ServiceDescriptor, LockdownError> {
        self.ensure_opened()?;
        if self.trust != TrustState::Trusted {
            return Err(LockdownError::PairingRequired);
        }
        let device = self.device.clone().ok_or(LockdownError::InvalidState)?;

        let mut req = self.request_base("StartService");
        req.insert("Service".into(), identifier.clone().into());
        if escrow {
            match self.pairing_file.as_ref().map(|p| &p.escrow_bag) {
                Some(bag) if !bag.is_empty() => {
                    req.insert("EscrowBag".into(), plist::Value::Data(bag.clone()));
                }
                _ => warn!("Pair record has no escrow bag, starting {identifier} without it"),
            }
        }
        let res = self.request(req).await?;

        let ssl = match res.get("EnableServiceSSL") {
            Some(plist::Value::Boolean(ssl)) => *ssl,
            Some(_) => {
                return Err(LockdownError::ProtocolError(
                    "EnableServiceSSL is not a boolean".into(),
                ))
            }
            None => false, // over USB, this option won't exist
        };
        let port = match res.get("Port").and_then(|p| p.as_unsigned_integer()) {
            Some(port) => u16::try_from(port).map_err(|_| {
                LockdownError::ProtocolError(format!("port {port} is out of range"))
            })?,
            None => {
                warn!("Response didn't contain an integer port");
                return Err(LockdownError::ProtocolError(
                    "StartService reply has no port".into(),
                ));
            }
        };
        debug!("{identifier} started on port {port}, ssl: {ssl}");

        Ok(ServiceDescriptor::new(
            identifier,
            port,
            ssl,
            device,
            self.pairing_file.clone(),
            self.config.timeout,
        ))
    }

    /// Ends the session and releases the connection
    ///
    /// An active lockdown session is stopped first, best effort. Calling this on a
    /// closed or unopened session does nothing.
    pub async fn close(&mut self) {
        if self.state != SessionState::Opened {
            return;
        }
        if let Some(session_id) = self.session_id.clone() {
            let mut req = self.request_base("StopSession");
            req.insert("SessionID".into(), session_id.into());
            if let Err(e) = self.request(req).await {
                debug!("StopSession failed while closing: {e}");
            }
        }
        self.release();
        info!("Lockdown session closed");
    }

    fn ensure_opened(&self) -> Result<(), LockdownError> {
        match self.state {
            SessionState::Opened => Ok(()),
            _ => Err(LockdownError::InvalidState),
        }
    }

    fn request_base(&self, request: &str) -> plist::Dictionary {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.config.label.clone().into());
        req.insert("Request".into(), request.into());
        req
    }

    /// Sends one request and reads its reply, translating daemon errors
    async fn request(
        &mut self,
        req: plist::Dictionary,
    ) -> Result<plist::Dictionary, LockdownError> {
        self.exchange(req, false).await
    }

    /// Sends one request and returns the reply as is, `Error` key included
    async fn raw_request(
        &mut self,
        req: plist::Dictionary,
    ) -> Result<plist::Dictionary, LockdownError> {
        self.exchange(req, true).await
    }

    async fn exchange(
        &mut self,
        req: plist::Dictionary,
        raw: bool,
    ) -> Result<plist::Dictionary, LockdownError> {
        self.ensure_opened()?;
        let timeout = self.config.timeout;
        let idevice = self.idevice.as_mut().ok_or(LockdownError::InvalidState)?;
        let res = tokio::time::timeout(timeout, async {
            idevice.send_plist(plist::Value::Dictionary(req)).await?;
            if raw {
                idevice.read_raw_plist().await
            } else {
                idevice.read_plist().await
            }
        })
        .await;
        self.settle(res)
    }

    /// Closes the session when the channel can no longer be trusted
    fn settle<T>(
        &mut self,
        res: Result<Result<T, LockdownError>, tokio::time::error::Elapsed>,
    ) -> Result<T, LockdownError> {
        match res {
            Ok(Ok(t)) => Ok(t),
            Ok(Err(e)) => {
                let dropped = !self.idevice.as_ref().is_some_and(|i| i.is_connected());
                if dropped
                    || matches!(
                        e,
                        LockdownError::DeviceDisconnected | LockdownError::ConnectionFailed(_)
                    )
                {
                    warn!("Lockdown channel failed ({e}), closing session");
                    self.release();
                }
                Err(e)
            }
            Err(_) => {
                warn!(
                    "Lockdown request timed out after {:?}, closing session",
                    self.config.timeout
                );
                self.release();
                Err(LockdownError::Timeout)
            }
        }
    }

    /// Drops the channel and everything cached from it
    fn release(&mut self) {
        if let Some(mut idevice) = self.idevice.take() {
            idevice.close();
        }
        self.state = SessionState::Closed;
        self.trust = TrustState::Untrusted;
        self.session_id = None;
        self.pairing_file = None;
        self.device_name = None;
        self.device_id = None;
    }
}
