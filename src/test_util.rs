// Jackson Coxson
// A lockdownd stand-in on loopback, plus echo services, for the session tests.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::Pin,
    sync::{Arc, Mutex},
};

use openssl::{
    pkey::{PKey, Private},
    rsa::Rsa,
    ssl::{Ssl, SslAcceptor, SslMethod},
    x509::X509,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::{JoinHandle, JoinSet},
};
use tokio_openssl::SslStream;

use crate::{
    lockdownd::LOCKDOWND_PORT,
    pairing::{CertificateAuthority, OpensslAuthority},
    pairing_file::PairingFile,
    provider::{DeviceSource, IdeviceProvider, ProviderFuture},
    Idevice, LockdownError,
};

pub(crate) const DIAGNOSTICS: &str = "com.apple.mobile.diagnostics_relay";
pub(crate) const ESCROW_BAG: &[u8] = b"simulated escrow bag";
const DEVICE_UDID: &str = "00008030-000A";

/// A generated pair record together with the device key it was made for
pub(crate) struct TestIdentity {
    pub device_key: PKey<Private>,
    pub pairing_file: PairingFile,
}

pub(crate) fn identity() -> TestIdentity {
    let device_key = Rsa::generate(2048).unwrap();
    let certs = OpensslAuthority
        .generate(&device_key.public_key_to_pem_pkcs1().unwrap())
        .unwrap();
    let pairing_file = PairingFile {
        device_certificate: certs.device_certificate,
        host_private_key: certs.host_private_key,
        host_certificate: certs.host_certificate,
        root_private_key: certs.root_private_key,
        root_certificate: certs.root_certificate,
        system_buid: uuid::Uuid::new_v4().to_string().to_uppercase(),
        host_id: uuid::Uuid::new_v4().to_string().to_uppercase(),
        escrow_bag: Vec::new(),
        wifi_mac_address: "aa:bb:cc:dd:ee:ff".into(),
        udid: Some(DEVICE_UDID.into()),
    };
    TestIdentity {
        device_key: PKey::from_rsa(device_key).unwrap(),
        pairing_file,
    }
}

/// A valid pair record no simulated daemon trusts yet
pub(crate) fn pairing_file() -> PairingFile {
    identity().pairing_file
}

/// Values a freshly reset device reports
pub(crate) fn daemon_values(device_name: &str) -> plist::Dictionary {
    let device_key = Rsa::generate(2048).unwrap();
    let mut values = plist::Dictionary::new();
    values.insert("DeviceName".into(), device_name.into());
    values.insert("UniqueDeviceID".into(), DEVICE_UDID.into());
    values.insert("ProductType".into(), "iPhone12,1".into());
    values.insert(
        "DevicePublicKey".into(),
        plist::Value::Data(device_key.public_key_to_pem_pkcs1().unwrap()),
    );
    values.insert("WiFiAddress".into(), "aa:bb:cc:dd:ee:ff".into());
    values
}

pub(crate) fn source(device: &Arc<TestDevice>) -> Arc<dyn DeviceSource> {
    let devices: Vec<Arc<dyn IdeviceProvider>> = vec![device.clone()];
    Arc::new(devices)
}

/// A loopback listener whose connections are served until shutdown
pub(crate) struct TestServer {
    port: u16,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TestServer {
    async fn spawn<F, Fut>(handler: F) -> Self
    where
        F: Fn(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            // dropping the set with this task tears down live connections too
            let mut connections = JoinSet::new();
            while let Ok((stream, _)) = listener.accept().await {
                connections.spawn(handler(stream));
            }
        });
        Self {
            port,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stops listening and drops every open connection
    pub async fn shutdown(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            tokio::task::yield_now().await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Writes back whatever it reads
pub(crate) struct EchoService;

impl EchoService {
    pub async fn start() -> TestServer {
        TestServer::spawn(|mut stream: TcpStream| async move {
            let (mut r, mut w) = stream.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        })
        .await
    }
}

/// Accepts connections and never answers
pub(crate) struct SilentService;

impl SilentService {
    pub async fn start() -> TestServer {
        TestServer::spawn(|mut stream: TcpStream| async move {
            let mut buf = [0u8; 64];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        })
        .await
    }
}

/// Server side TLS context presenting the device certificate of `identity`
fn device_acceptor(identity: &TestIdentity) -> Arc<SslAcceptor> {
    let certificate = X509::from_pem(&identity.pairing_file.device_certificate).unwrap();
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
    acceptor.set_certificate(&certificate).unwrap();
    acceptor.set_private_key(&identity.device_key).unwrap();
    acceptor.check_private_key().unwrap();
    Arc::new(acceptor.build())
}

/// An echo service behind TLS, presenting the device certificate of its record
pub(crate) struct TlsEchoService {
    server: TestServer,
    pairing_file: PairingFile,
}

impl TlsEchoService {
    pub async fn start() -> Self {
        let identity = identity();
        let acceptor = device_acceptor(&identity);

        let server = TestServer::spawn(move |stream: TcpStream| {
            let acceptor = acceptor.clone();
            async move {
                let Ok(ssl) = Ssl::new(acceptor.context()) else {
                    return;
                };
                let Ok(mut stream) = SslStream::new(ssl, stream) else {
                    return;
                };
                if Pin::new(&mut stream).accept().await.is_err() {
                    return;
                }
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        })
        .await;

        Self {
            server,
            pairing_file: identity.pairing_file,
        }
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn pairing_file(&self) -> PairingFile {
        self.pairing_file.clone()
    }
}

/// How the simulated daemon answers `Pair`
#[derive(Debug, Clone, Copy, Default)]
pub(crate) enum PairingBehavior {
    #[default]
    Accept,
    Deny,
    /// Report the trust dialog as pending this many times, then accept
    PendingThenAccept(u32),
}

#[derive(Default)]
struct DaemonState {
    values: plist::Dictionary,
    domains: HashMap<String, plist::Dictionary>,
    services: HashMap<String, u16>,
    refusals: HashMap<String, String>,
    trusted_hosts: HashSet<String>,
    pairing: PairingBehavior,
    pair_attempts: u32,
    silent: HashSet<String>,
    requests: HashMap<String, usize>,
    last_start_had_escrow_bag: bool,
    garbled: HashSet<String>,
    session_tls: Option<Arc<SslAcceptor>>,
    service_ssl: Option<plist::Value>,
}

fn error_reply(error: &str) -> plist::Dictionary {
    let mut reply = plist::Dictionary::new();
    reply.insert("Error".into(), error.into());
    reply
}

impl DaemonState {
    fn answer(
        &mut self,
        request: &str,
        req: &plist::Dictionary,
        session_active: &mut bool,
    ) -> plist::Dictionary {
        let mut reply = plist::Dictionary::new();
        reply.insert("Request".into(), request.into());
        let key = req.get("Key").and_then(|k| k.as_string());
        let domain = req.get("Domain").and_then(|d| d.as_string());

        match request {
            "QueryType" => {
                reply.insert("Type".into(), "com.apple.mobile.lockdown".into());
            }
            "GetValue" => {
                let values = match domain {
                    Some(domain) => self.domains.get(domain).cloned().unwrap_or_default(),
                    None => self.values.clone(),
                };
                match key {
                    Some(key) => match values.get(key) {
                        Some(v) => {
                            reply.insert("Key".into(), key.into());
                            reply.insert("Value".into(), v.clone());
                        }
                        None => return error_reply("MissingValue"),
                    },
                    None => {
                        reply.insert("Value".into(), plist::Value::Dictionary(values));
                    }
                }
            }
            "SetValue" => {
                let (Some(key), Some(value)) = (key, req.get("Value")) else {
                    return error_reply("MissingKey");
                };
                let values = match domain {
                    Some(domain) => self.domains.entry(domain.to_string()).or_default(),
                    None => &mut self.values,
                };
                values.insert(key.to_string(), value.clone());
            }
            "StartSession" => {
                let host_id = req.get("HostID").and_then(|h| h.as_string());
                if !host_id.is_some_and(|h| self.trusted_hosts.contains(h)) {
                    return error_reply("InvalidHostID");
                }
                *session_active = true;
                reply.insert("SessionID".into(), "SIMULATED-SESSION".into());
                reply.insert(
                    "EnableSessionSSL".into(),
                    self.session_tls.is_some().into(),
                );
            }
            "StopSession" => {
                *session_active = false;
            }
            "Pair" => {
                self.pair_attempts += 1;
                match self.pairing {
                    PairingBehavior::Deny => return error_reply("UserDeniedPairing"),
                    PairingBehavior::PendingThenAccept(n) if self.pair_attempts <= n => {
                        return error_reply("PairingDialogResponsePending")
                    }
                    _ => {}
                }
                let host_id = req
                    .get("PairRecord")
                    .and_then(|r| r.as_dictionary())
                    .and_then(|r| r.get("HostID"))
                    .and_then(|h| h.as_string());
                let Some(host_id) = host_id else {
                    return error_reply("InvalidPairRecord");
                };
                self.trusted_hosts.insert(host_id.to_string());
                reply.insert("EscrowBag".into(), plist::Value::Data(ESCROW_BAG.to_vec()));
            }
            "StartService" => {
                if !*session_active {
                    return error_reply("SessionInactive");
                }
                let service = req
                    .get("Service")
                    .and_then(|s| s.as_string())
                    .unwrap_or_default();
                self.last_start_had_escrow_bag = req.contains_key("EscrowBag");
                if let Some(error) = self.refusals.get(service) {
                    return error_reply(error);
                }
                let Some(port) = self.services.get(service) else {
                    return error_reply("InvalidService");
                };
                reply.insert("Service".into(), service.into());
                reply.insert("Port".into(), (*port).into());
                reply.insert(
                    "EnableServiceSSL".into(),
                    self.service_ssl.clone().unwrap_or(false.into()),
                );
            }
            _ => return error_reply("InvalidRequest"),
        }
        reply
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<DaemonState>>) {
    let mut conn = Idevice::new(Box::new(stream), "simulated-lockdownd");
    let mut session_active = false;
    loop {
        let Ok(req) = conn.read_raw_plist().await else {
            return;
        };
        let request = req
            .get("Request")
            .and_then(|r| r.as_string())
            .unwrap_or_default()
            .to_string();
        let (reply, garbled, tls) = {
            let mut state = state.lock().unwrap();
            *state.requests.entry(request.clone()).or_default() += 1;
            let reply = if state.silent.contains(&request) {
                None
            } else {
                Some(state.answer(&request, &req, &mut session_active))
            };
            (reply, state.garbled.contains(&request), state.session_tls.clone())
        };
        if garbled {
            // announces 32 MiB, sends 8 bytes
            let _ = conn.send_raw(&[0x02, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8]).await;
            continue;
        }
        let Some(reply) = reply else {
            continue;
        };
        let upgrade = request == "StartSession" && !reply.contains_key("Error");
        if conn
            .send_plist(plist::Value::Dictionary(reply))
            .await
            .is_err()
        {
            return;
        }
        if let (true, Some(acceptor)) = (upgrade, tls) {
            if accept_tls(&mut conn, &acceptor).await.is_none() {
                return;
            }
        }
    }
}

/// Server half of the in-place TLS upgrade done by `Idevice::start_session`
async fn accept_tls(conn: &mut Idevice, acceptor: &SslAcceptor) -> Option<()> {
    let socket = conn.socket.take()?;
    let ssl = Ssl::new(acceptor.context()).ok()?;
    let mut stream = SslStream::new(ssl, socket).ok()?;
    Pin::new(&mut stream).accept().await.ok()?;
    conn.socket = Some(Box::new(stream));
    Some(())
}

/// Speaks the lockdown protocol on a loopback port
pub(crate) struct SimulatedDaemon {
    server: TestServer,
    state: Arc<Mutex<DaemonState>>,
}

impl SimulatedDaemon {
    pub async fn start(values: plist::Dictionary) -> Self {
        let state = Arc::new(Mutex::new(DaemonState {
            values,
            ..Default::default()
        }));
        let shared = state.clone();
        let server = TestServer::spawn(move |stream| serve(stream, shared.clone())).await;
        Self { server, state }
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub async fn shutdown(&self) {
        self.server.shutdown().await
    }

    pub fn register_service(&self, service: &str, port: u16) {
        self.state
            .lock()
            .unwrap()
            .services
            .insert(service.into(), port);
    }

    /// Makes `StartService` for `service` fail with `error`
    pub fn refuse_service(&self, service: &str, error: &str) {
        self.state
            .lock()
            .unwrap()
            .refusals
            .insert(service.into(), error.into());
    }

    pub fn set_pairing(&self, pairing: PairingBehavior) {
        self.state.lock().unwrap().pairing = pairing;
    }

    /// Stops answering `request`, without closing the connection
    pub fn set_silent(&self, request: &str) {
        self.state.lock().unwrap().silent.insert(request.into());
    }

    /// How many `request` requests were received
    pub fn requests(&self, request: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .get(request)
            .copied()
            .unwrap_or_default()
    }

    /// Answers `request` with a frame header announcing more than the client accepts
    pub fn set_garbled(&self, request: &str) {
        self.state.lock().unwrap().garbled.insert(request.into());
    }

    /// Switches the control channel to TLS after a successful `StartSession`
    pub fn enable_session_ssl(&self) {
        let acceptor = device_acceptor(&identity());
        self.state.lock().unwrap().session_tls = Some(acceptor);
    }

    /// Value sent as `EnableServiceSSL` in `StartService` replies
    pub fn set_service_ssl(&self, value: plist::Value) {
        self.state.lock().unwrap().service_ssl = Some(value);
    }

    pub fn last_start_had_escrow_bag(&self) -> bool {
        self.state.lock().unwrap().last_start_had_escrow_bag
    }

    /// A pair record this daemon accepts
    pub fn trusted_record(&self) -> PairingFile {
        let record = pairing_file();
        self.state
            .lock()
            .unwrap()
            .trusted_hosts
            .insert(record.host_id.clone());
        record
    }
}

/// Device handle routing the lockdown port to a simulated daemon
#[derive(Debug)]
pub(crate) struct TestDevice {
    udid: String,
    lockdown_port: u16,
    pairing_file: Mutex<Option<PairingFile>>,
    unreadable_record: bool,
}

impl TestDevice {
    pub fn new(
        daemon: &SimulatedDaemon,
        udid: &str,
        pairing_file: Option<PairingFile>,
    ) -> Arc<Self> {
        Arc::new(Self {
            udid: udid.into(),
            lockdown_port: daemon.port(),
            pairing_file: Mutex::new(pairing_file),
            unreadable_record: false,
        })
    }

    /// A device whose stored pair record fails to parse
    pub fn with_unreadable_record(daemon: &SimulatedDaemon, udid: &str) -> Arc<Self> {
        Arc::new(Self {
            udid: udid.into(),
            lockdown_port: daemon.port(),
            pairing_file: Mutex::new(None),
            unreadable_record: true,
        })
    }

    /// A device without a daemon, for reaching services directly
    pub fn standalone(udid: &str) -> Arc<Self> {
        Arc::new(Self {
            udid: udid.into(),
            lockdown_port: 0,
            pairing_file: Mutex::new(None),
            unreadable_record: false,
        })
    }

    pub fn stored_pairing_file(&self) -> Option<PairingFile> {
        self.pairing_file.lock().unwrap().clone()
    }
}

impl IdeviceProvider for TestDevice {
    fn connect(&self, port: u16) -> ProviderFuture<'static, Idevice> {
        let port = match port {
            LOCKDOWND_PORT => self.lockdown_port,
            port => port,
        };
        Box::pin(async move {
            if port == 0 {
                return Err(LockdownError::ConnectionFailed(std::io::Error::from(
                    std::io::ErrorKind::ConnectionRefused,
                )));
            }
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
            let stream = TcpStream::connect(addr).await?;
            Ok(Idevice::new(Box::new(stream), "test-device"))
        })
    }

    fn label(&self) -> &str {
        "test-device"
    }

    fn udid(&self) -> &str {
        &self.udid
    }

    fn get_pairing_file(&self) -> ProviderFuture<'static, Option<PairingFile>> {
        if self.unreadable_record {
            return Box::pin(async {
                Err(LockdownError::ProtocolError("pairing file is malformed".into()))
            });
        }
        let pairing_file = self.stored_pairing_file();
        Box::pin(async move { Ok(pairing_file) })
    }

    fn save_pairing_file(&self, pairing_file: PairingFile) -> ProviderFuture<'static, ()> {
        *self.pairing_file.lock().unwrap() = Some(pairing_file);
        Box::pin(async { Ok(()) })
    }
}
