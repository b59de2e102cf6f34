//! iOS Device Pairing File Handling
//!
//! A pairing file (pair record) holds the trust material a host uses to open an
//! encrypted lockdown session with a device it has paired with.

use std::path::Path;

use log::warn;
use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use plist::Data;
use serde::{Deserialize, Serialize};

use crate::LockdownError;

/// Represents a complete iOS device pairing record
///
/// Certificates and keys are kept PEM encoded, as they are stored on disk and sent
/// to the device. They are validated when the record is parsed.
#[derive(Clone, Debug)]
pub struct PairingFile {
    /// Device's certificate in PEM format
    pub device_certificate: Vec<u8>,
    /// Host's private key in PEM format
    pub host_private_key: Vec<u8>,
    /// Host's certificate in PEM format
    pub host_certificate: Vec<u8>,
    /// Root CA's private key in PEM format
    pub root_private_key: Vec<u8>,
    /// Root CA's certificate in PEM format
    pub root_certificate: Vec<u8>,
    /// System Build Unique Identifier
    pub system_buid: String,
    /// Host identifier
    pub host_id: String,
    /// Escrow bag allowing for access while locked. Empty until the device hands one out.
    pub escrow_bag: Vec<u8>,
    /// Device's WiFi MAC address
    pub wifi_mac_address: String,
    /// Device's Unique Device Identifier (optional)
    pub udid: Option<String>,
}

/// Internal representation of a pairing file for serialization/deserialization
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairingFile {
    device_certificate: Data,
    host_private_key: Data,
    host_certificate: Data,
    root_private_key: Data,
    root_certificate: Data,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    escrow_bag: Option<Data>,
    #[serde(rename = "WiFiMACAddress")]
    wifi_mac_address: String,
    #[serde(rename = "UDID", default, skip_serializing_if = "Option::is_none")]
    udid: Option<String>,
}

impl PairingFile {
    /// Reads a pairing file from disk
    ///
    /// # Arguments
    /// * `path` - Path to the pairing file (typically a .plist file)
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, LockdownError> {
        let f = std::fs::read(path).map_err(|e| {
            LockdownError::ProtocolError(format!("unable to read pairing file: {e}"))
        })?;
        Self::from_bytes(&f)
    }

    /// Parses a pairing file from raw plist bytes
    ///
    /// # Errors
    /// `ProtocolError` if the plist is malformed, a field is missing, or a
    /// certificate or key does not parse
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LockdownError> {
        let r = match plist::from_bytes::<RawPairingFile>(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("Unable to convert bytes to raw pairing file: {e:?}");
                return Err(LockdownError::ProtocolError(
                    "pairing file is malformed".into(),
                ));
            }
        };
        r.try_into()
    }

    /// Creates a pairing file from a plist value
    pub fn from_value(v: &plist::Value) -> Result<Self, LockdownError> {
        let raw: RawPairingFile = plist::from_value(v)?;
        raw.try_into()
    }

    /// Serializes the pairing file to a PLIST-formatted byte vector
    pub fn serialize(self) -> Result<Vec<u8>, LockdownError> {
        let raw = RawPairingFile::from(self);

        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &raw)?;
        Ok(buf)
    }

    /// The host certificate presented during the TLS handshake
    pub fn host_certificate_x509(&self) -> Result<X509, LockdownError> {
        X509::from_pem(&self.host_certificate).map_err(bad_material)
    }

    /// The key matching [`Self::host_certificate_x509`]
    pub fn host_private_key_pkey(&self) -> Result<PKey<Private>, LockdownError> {
        PKey::private_key_from_pem(&self.host_private_key).map_err(bad_material)
    }
}

fn bad_material(e: openssl::error::ErrorStack) -> LockdownError {
    warn!("Pairing file holds invalid key material: {e}");
    LockdownError::ProtocolError("pairing file holds invalid key material".into())
}

impl TryFrom<RawPairingFile> for PairingFile {
    type Error = LockdownError;

    /// Validates the certificates and keys while converting
    fn try_from(value: RawPairingFile) -> Result<Self, Self::Error> {
        let p = Self {
            device_certificate: value.device_certificate.into(),
            host_private_key: value.host_private_key.into(),
            host_certificate: value.host_certificate.into(),
            root_private_key: value.root_private_key.into(),
            root_certificate: value.root_certificate.into(),
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.map(Into::into).unwrap_or_default(),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        };

        for cert in [
            &p.device_certificate,
            &p.host_certificate,
            &p.root_certificate,
        ] {
            X509::from_pem(cert).map_err(bad_material)?;
        }
        p.host_private_key_pkey()?;
        PKey::private_key_from_pem(&p.root_private_key).map_err(bad_material)?;
        Ok(p)
    }
}

impl From<PairingFile> for RawPairingFile {
    fn from(value: PairingFile) -> Self {
        Self {
            device_certificate: Data::new(value.device_certificate),
            host_private_key: Data::new(value.host_private_key),
            host_certificate: Data::new(value.host_certificate),
            root_private_key: Data::new(value.root_private_key),
            root_certificate: Data::new(value.root_certificate),
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: (!value.escrow_bag.is_empty()).then(|| Data::new(value.escrow_bag)),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        }
    }
}
