//! Certificate generation for the pairing exchange
//!
//! Pairing hands the device three certificates: a self signed root, a host
//! certificate and a certificate over the device's own public key, both signed by
//! the root. The host keeps the private keys in its pairing file.
// Jackson Coxson

use log::debug;
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    pkey::{PKey, Private, Public},
    rsa::Rsa,
    x509::{
        extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier},
        X509Builder, X509NameBuilder, X509,
    },
};

use crate::LockdownError;

/// Validity of generated certificates, in days
const CERT_VALIDITY_DAYS: u32 = 365 * 10;
const RSA_BITS: u32 = 2048;

/// PEM encoded material produced for one pairing
#[derive(Clone, Debug)]
pub struct PairCertificates {
    pub root_certificate: Vec<u8>,
    pub root_private_key: Vec<u8>,
    pub host_certificate: Vec<u8>,
    pub host_private_key: Vec<u8>,
    pub device_certificate: Vec<u8>,
}

/// Crypto capability used by the pairing exchange
pub trait CertificateAuthority: Send + Sync + std::fmt::Debug {
    /// Builds the certificates for a device given its PEM encoded RSA public key
    fn generate(&self, device_public_key_pem: &[u8]) -> Result<PairCertificates, LockdownError>;
}

/// [`CertificateAuthority`] backed by OpenSSL, generating fresh RSA keys every time
#[derive(Debug, Default, Clone, Copy)]
pub struct OpensslAuthority;

impl CertificateAuthority for OpensslAuthority {
    fn generate(&self, device_public_key_pem: &[u8]) -> Result<PairCertificates, LockdownError> {
        generate_certificates(device_public_key_pem)
    }
}

fn parse_device_key(pem: &[u8]) -> Result<PKey<Public>, LockdownError> {
    // Devices report a PKCS#1 key; accept SubjectPublicKeyInfo as well
    let key = match Rsa::public_key_from_pem_pkcs1(pem) {
        Ok(rsa) => PKey::from_rsa(rsa),
        Err(_) => PKey::public_key_from_pem(pem),
    };
    key.map_err(|e| LockdownError::ProtocolError(format!("invalid DevicePublicKey: {e}")))
}

fn make_cert<T: openssl::pkey::HasPublic>(
    signing_key: &PKey<Private>,
    public_key: &PKey<T>,
    common_name: Option<&str>,
    is_ca: bool,
) -> Result<X509, LockdownError> {
    let mut name = X509NameBuilder::new()?;
    if let Some(cn) = common_name {
        name.append_entry_by_text("CN", cn)?;
    }
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;

    let serial = Asn1Integer::from_bn(&serial)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(CERT_VALIDITY_DAYS)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(public_key)?;

    if is_ca {
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    } else {
        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
    }
    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(ski)?;

    builder.sign(signing_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

pub(crate) fn generate_certificates(
    device_public_key_pem: &[u8],
) -> Result<PairCertificates, LockdownError> {
    let device_key = parse_device_key(device_public_key_pem)?;

    debug!("Generating {RSA_BITS} bit root and host keys");
    let root_key = PKey::from_rsa(Rsa::generate(RSA_BITS)?)?;
    let host_key = PKey::from_rsa(Rsa::generate(RSA_BITS)?)?;

    let root_cert = make_cert(&root_key, &root_key, None, true)?;
    let host_cert = make_cert(&root_key, &host_key, None, false)?;
    let dev_cert = make_cert(&root_key, &device_key, Some("Device"), false)?;

    Ok(PairCertificates {
        root_certificate: root_cert.to_pem()?,
        root_private_key: root_key.private_key_to_pem_pkcs8()?,
        host_certificate: host_cert.to_pem()?,
        host_private_key: host_key.private_key_to_pem_pkcs8()?,
        device_certificate: dev_cert.to_pem()?,
    })
}
