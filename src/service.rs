// Jackson Coxson

use std::{sync::Arc, time::Duration};

use log::{debug, warn};

use crate::{pairing_file::PairingFile, provider::IdeviceProvider, Idevice, LockdownError};

/// Sent to a service to check that it is alive
const PING_PROBE: &[u8] = b"ping";

/// Where lockdownd started a service, and how to reach it
///
/// Returned by [`crate::LockdownSession::start_service`]. The descriptor keeps the
/// device handle it was started on, not the session, so it stays valid after the
/// session is closed; whether the service still answers is for [`Self::ping`] to
/// find out.
#[derive(Clone)]
pub struct ServiceDescriptor {
    service: String,
    port: u16,
    requires_tls: bool,
    device: Arc<dyn IdeviceProvider>,
    pairing_file: Option<Arc<PairingFile>>,
    timeout: Duration,
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("service", &self.service)
            .field("port", &self.port)
            .field("requires_tls", &self.requires_tls)
            .field("udid", &self.device.udid())
            .finish_non_exhaustive()
    }
}

impl ServiceDescriptor {
    pub(crate) fn new(
        service: String,
        port: u16,
        requires_tls: bool,
        device: Arc<dyn IdeviceProvider>,
        pairing_file: Option<Arc<PairingFile>>,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            port,
            requires_tls,
            device,
            pairing_file,
            timeout,
        }
    }

    /// The identifier the service was started with
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the service channel must be wrapped in TLS
    pub fn requires_tls(&self) -> bool {
        self.requires_tls
    }

    /// UDID of the device the service runs on
    pub fn udid(&self) -> &str {
        self.device.udid()
    }

    /// Label of the device handle the service was started through
    pub fn label(&self) -> &str {
        self.device.label()
    }

    /// Deadline used by [`Self::connect`] and [`Self::ping`]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Opens a connection to the service, upgraded to TLS when required
    ///
    /// The connection belongs to the caller; service clients build on it.
    pub async fn connect(&self) -> Result<Idevice, LockdownError> {
        tokio::time::timeout(self.timeout, self.connect_inner()).await?
    }

    async fn connect_inner(&self) -> Result<Idevice, LockdownError> {
        let mut idevice = self.device.connect(self.port).await?;
        if self.requires_tls {
            let pairing_file = self
                .pairing_file
                .as_ref()
                .ok_or(LockdownError::PairingRequired)?;
            idevice.start_session(pairing_file).await?;
        }
        Ok(idevice)
    }

    /// Checks that the service answers
    ///
    /// Connects to the service, sends a short probe and waits for any reply.
    ///
    /// # Errors
    /// - `ServiceUnreachable` if the connection is refused, or closed without a reply
    /// - `Timeout` if nothing comes back before the deadline
    pub async fn ping(&self) -> Result<(), LockdownError> {
        let probe = async {
            let mut idevice = self.connect_inner().await.map_err(unreachable)?;
            idevice.send_raw(PING_PROBE).await.map_err(unreachable)?;
            let reply = idevice
                .read_any(PING_PROBE.len() as u32)
                .await
                .map_err(unreachable)?;
            if reply.is_empty() {
                warn!("{} closed the connection without answering", self.service);
                return Err(LockdownError::ServiceUnreachable);
            }
            debug!("{} answered the ping", self.service);
            Ok(())
        };

        match tokio::time::timeout(self.timeout, probe).await {
            Ok(res) => res,
            Err(_) => {
                warn!("{} did not answer within {:?}", self.service, self.timeout);
                Err(LockdownError::Timeout)
            }
        }
    }
}

fn unreachable(e: LockdownError) -> LockdownError {
    debug!("Service probe failed: {e}");
    LockdownError::ServiceUnreachable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{EchoService, SilentService, TestDevice, TlsEchoService};

    fn descriptor(
        device: Arc<TestDevice>,
        port: u16,
        requires_tls: bool,
        pairing_file: Option<PairingFile>,
    ) -> ServiceDescriptor {
        ServiceDescriptor::new(
            "com.apple.test".into(),
            port,
            requires_tls,
            device,
            pairing_file.map(Arc::new),
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn ping_answers_then_fails_after_teardown() {
        let echo = EchoService::start().await;
        let device = TestDevice::standalone("AAA");
        let desc = descriptor(device, echo.port(), false, None);
        assert_eq!(desc.udid(), "AAA");

        desc.ping().await.unwrap();
        echo.shutdown().await;
        assert!(matches!(
            desc.ping().await,
            Err(LockdownError::ServiceUnreachable)
        ));
    }

    #[tokio::test]
    async fn silent_service_times_out() {
        let silent = SilentService::start().await;
        let device = TestDevice::standalone("AAA");
        let desc = descriptor(device, silent.port(), false, None);
        assert!(matches!(desc.ping().await, Err(LockdownError::Timeout)));
    }

    #[tokio::test]
    async fn tls_service_is_reached_with_the_pair_record() {
        let tls = TlsEchoService::start().await;
        let device = TestDevice::standalone("AAA");
        let desc = descriptor(device.clone(), tls.port(), true, Some(tls.pairing_file()));
        desc.ping().await.unwrap();

        let mut conn = desc.connect().await.unwrap();
        conn.send_raw(b"hello").await.unwrap();
        assert_eq!(conn.read_any(5).await.unwrap(), b"hello");

        // without credentials the handshake cannot happen
        let desc = descriptor(device, tls.port(), true, None);
        assert!(matches!(
            desc.connect().await,
            Err(LockdownError::PairingRequired)
        ));
    }
}
