// Jackson Coxson
// Devices present self signed certificates made during pairing, and older iOS
// versions only speak legacy ciphers, so verification is off and the security
// level is dropped to 0.

use std::pin::Pin;

use log::debug;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio_openssl::SslStream;

use crate::{pairing_file::PairingFile, IdeviceSocket, LockdownError};

fn create_connector(pairing_file: &PairingFile) -> Result<SslConnector, LockdownError> {
    let host_certificate = pairing_file.host_certificate_x509()?;
    let host_private_key = pairing_file.host_private_key_pkey()?;

    let mut connector = SslConnector::builder(SslMethod::tls_client())?;
    connector.set_certificate(&host_certificate)?;
    connector.set_private_key(&host_private_key)?;
    connector.set_verify(SslVerifyMode::NONE);
    connector.set_cipher_list("ALL:!aNULL:!eNULL:@SECLEVEL=0")?;
    Ok(connector.build())
}

/// Runs a TLS client handshake over an established device socket
pub(crate) async fn upgrade(
    socket: IdeviceSocket,
    pairing_file: &PairingFile,
) -> Result<SslStream<IdeviceSocket>, LockdownError> {
    let ssl = create_connector(pairing_file)?
        .configure()?
        .use_server_name_indication(false)
        .verify_hostname(false)
        .into_ssl("Device")?;

    let mut stream = SslStream::new(ssl, socket)?;
    Pin::new(&mut stream).connect().await?;
    debug!("TLS session established");
    Ok(stream)
}
