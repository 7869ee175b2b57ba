//! PEM, hashing and `rcgen` issuance helpers.
//!
//! Provides:
//! - [`certificate_hash`]: content hash used to key device certificates
//! - [`generate_key_pair`] / [`key_type_of`]: RSA-2048 and ECDSA P-256 keys
//! - [`issue_ca`] / [`issue_leaf`]: self-signed CA and CA-signed leaf issuance
//! - [`parse_certificate_chain`] / [`split_pem_chain`]: lenient PEM parsing
//! - [`is_issued_by`]: PKIX path validation against a single trust anchor
//! - [`write_bundle_to_dir`]: write an issued bundle as PEM files
//!
//! All certificate and key material crosses module boundaries as PEM text.

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, PKCS_RSA_SHA256,
    RsaKeySize, SanType, SerialNumber,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, UnixTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use super::generator::{CertificateType, CertificateUpdate};
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Hashing
// ─────────────────────────────────────────────────────────────────────────────

/// Lower-case hex SHA-256 of the PEM text.
#[must_use]
pub fn certificate_hash(certificate_pem: &str) -> String {
    hex::encode(Sha256::digest(certificate_pem.as_bytes()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Keys
// ─────────────────────────────────────────────────────────────────────────────

/// Supported key algorithms for the CA and for leaf certificates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    /// RSA with a 2048-bit modulus, signed with SHA-256.
    #[default]
    #[serde(rename = "RSA_2048", alias = "rsa_2048")]
    Rsa2048,
    /// ECDSA on NIST P-256, signed with SHA-256.
    #[serde(rename = "ECDSA_P256", alias = "ecdsa_p256")]
    EcdsaP256,
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa2048 => f.write_str("RSA_2048"),
            Self::EcdsaP256 => f.write_str("ECDSA_P256"),
        }
    }
}

/// Generate a fresh key pair of the given type.
///
/// # Errors
///
/// Returns `Error::CertificateGeneration` if the crypto provider fails.
pub fn generate_key_pair(key_type: KeyType) -> Result<KeyPair> {
    let generated = match key_type {
        KeyType::Rsa2048 => KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048),
        KeyType::EcdsaP256 => KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256),
    };
    generated.map_err(|e| {
        Error::CertificateGeneration(format!("Failed to generate {key_type} key: {e}"))
    })
}

/// Parse a PEM private key and report its algorithm, if supported.
///
/// # Errors
///
/// Returns `Error::KeyStore` if the PEM is not a usable private key.
pub fn key_type_of(private_key_pem: &str) -> Result<Option<KeyType>> {
    let key = KeyPair::from_pem(private_key_pem)
        .map_err(|e| Error::KeyStore(format!("Failed to parse private key: {e}")))?;
    Ok(if key.algorithm() == &PKCS_RSA_SHA256 {
        Some(KeyType::Rsa2048)
    } else if key.algorithm() == &PKCS_ECDSA_P256_SHA256 {
        Some(KeyType::EcdsaP256)
    } else {
        None
    })
}

/// Whether `private_key_pem` holds the key certified by the first
/// certificate of `certificate_pem`.
///
/// # Errors
///
/// Returns `Error::KeyStore` if either side cannot be parsed.
pub fn key_matches_certificate(private_key_pem: &str, certificate_pem: &str) -> Result<bool> {
    let key = KeyPair::from_pem(private_key_pem)
        .map_err(|e| Error::KeyStore(format!("Failed to parse private key: {e}")))?;
    let chain = parse_certificate_chain(certificate_pem).map_err(|e| Error::KeyStore(e.to_string()))?;
    let (_, cert) = X509Certificate::from_der(chain[0].as_ref())
        .map_err(|e| Error::KeyStore(format!("Failed to parse certificate: {e}")))?;
    Ok(cert.public_key().subject_public_key.data.as_ref() == key.public_key_raw())
}

// ─────────────────────────────────────────────────────────────────────────────
// Issuance
// ─────────────────────────────────────────────────────────────────────────────

/// A freshly issued CA.
#[derive(Debug)]
pub struct IssuedCa {
    /// PEM-encoded self-signed CA certificate.
    pub certificate_pem: String,
    /// PEM-encoded PKCS#8 CA private key.
    pub private_key_pem: String,
}

/// Subject and validity of a leaf certificate.
#[derive(Debug)]
pub struct LeafRequest<'a> {
    /// Subject common name.
    pub common_name: &'a str,
    /// Server or client usage.
    pub certificate_type: CertificateType,
    /// Host names and IP literals to embed as SANs.
    pub subject_alt_names: &'a [String],
    /// Validity starting now.
    pub validity: Duration,
}

/// Generate a self-signed CA certificate and its key.
///
/// # Errors
///
/// Returns `Error::CertificateGeneration` if key generation or signing fails.
pub fn issue_ca(common_name: &str, key_type: KeyType, validity: Duration) -> Result<IssuedCa> {
    let key_pair = generate_key_pair(key_type)?;
    let now = SystemTime::now();

    let mut params = CertificateParams::default();
    params.distinguished_name = subject(common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(random_serial());
    params.not_before = to_offset_date_time(now)?;
    params.not_after = to_offset_date_time(now + validity)?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::CertificateGeneration(format!("CA cert generation failed: {e}")))?;

    debug!(common_name, key_type = %key_type, "CA certificate generated");

    Ok(IssuedCa {
        certificate_pem: cert.pem(),
        private_key_pem: key_pair.serialize_pem(),
    })
}

/// Issue a leaf certificate for `leaf_key` signed by the CA.
///
/// # Errors
///
/// Returns `Error::CertificateGeneration` if the CA material cannot be
/// parsed, a SAN is not representable, or signing fails.
pub fn issue_leaf(
    request: &LeafRequest<'_>,
    leaf_key: &KeyPair,
    ca_certificate_pem: &str,
    ca_private_key_pem: &str,
) -> Result<String> {
    let ca_key = KeyPair::from_pem(ca_private_key_pem)
        .map_err(|e| Error::CertificateGeneration(format!("Failed to parse CA key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(ca_certificate_pem, ca_key)
        .map_err(|e| Error::CertificateGeneration(format!("Failed to parse CA cert: {e}")))?;

    let now = SystemTime::now();
    let mut params = CertificateParams::default();
    params.distinguished_name = subject(request.common_name);
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![match request.certificate_type {
        CertificateType::Server => ExtendedKeyUsagePurpose::ServerAuth,
        CertificateType::Client => ExtendedKeyUsagePurpose::ClientAuth,
    }];
    params.use_authority_key_identifier_extension = true;
    params.serial_number = Some(random_serial());
    params.not_before = to_offset_date_time(now)?;
    params.not_after = to_offset_date_time(now + request.validity)?;
    params.subject_alt_names = request
        .subject_alt_names
        .iter()
        .map(|name| san_for(name))
        .collect::<Result<_>>()?;

    let cert = params
        .signed_by(leaf_key, &issuer)
        .map_err(|e| Error::CertificateGeneration(format!("Leaf cert signing failed: {e}")))?;

    Ok(cert.pem())
}

fn subject(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "US");
    dn.push(DnType::OrganizationName, "Edge Trust");
    dn.push(DnType::CommonName, common_name);
    dn
}

/// IP literals become IP SANs, everything else a DNS SAN.
fn san_for(name: &str) -> Result<SanType> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(name)
        .map(SanType::DnsName)
        .map_err(|e| Error::CertificateGeneration(format!("Invalid SAN '{name}': {e}")))
}

fn random_serial() -> SerialNumber {
    let mut bytes = rand::random::<[u8; 16]>();
    // positive INTEGER
    bytes[0] &= 0x7F;
    SerialNumber::from(bytes.to_vec())
}

/// Convert a wall-clock instant into the `time` type rcgen expects.
fn to_offset_date_time(at: SystemTime) -> Result<OffsetDateTime> {
    let secs = at
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::CertificateGeneration(format!("Clock before epoch: {e}")))?
        .as_secs();
    let secs = i64::try_from(secs)
        .map_err(|_| Error::CertificateGeneration("Validity out of range".to_string()))?;
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| Error::CertificateGeneration(format!("Validity out of range: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// PEM parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Parse every `CERTIFICATE` block in `pem`.
///
/// Whitespace and non-certificate blocks around the chain are ignored.
///
/// # Errors
///
/// Returns `Error::Authentication` when a block is malformed or no
/// certificate is present.
pub fn parse_certificate_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let chain = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Authentication(format!("Failed to parse certificate chain: {e}")))?;
    if chain.is_empty() {
        return Err(Error::Authentication(
            "No certificate found in PEM".to_string(),
        ));
    }
    Ok(chain)
}

/// Split a PEM bundle into one PEM string per certificate.
///
/// # Errors
///
/// Same as [`parse_certificate_chain`].
pub fn split_pem_chain(pem: &str) -> Result<Vec<String>> {
    Ok(parse_certificate_chain(pem)?
        .iter()
        .map(|der| der_to_pem(der.as_ref()))
        .collect())
}

/// Encode DER bytes as a `CERTIFICATE` PEM block.
#[must_use]
pub fn der_to_pem(der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut pem = String::with_capacity(body.len() + body.len() / 64 + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

// ─────────────────────────────────────────────────────────────────────────────
// Path validation
// ─────────────────────────────────────────────────────────────────────────────

/// Whether the chain in `chain_pem` validates up to `ca_certificate_pem`.
///
/// Any extended key usage is accepted, so server and client leaves both
/// validate. Revocation is not checked. A chain that cannot be parsed is
/// reported as not issued by the CA.
#[must_use]
pub fn is_issued_by(chain_pem: &str, ca_certificate_pem: &str) -> bool {
    let chain = match parse_certificate_chain(chain_pem) {
        Ok(chain) => chain,
        Err(e) => {
            debug!(error = %e, "Presented chain is not parseable");
            return false;
        }
    };
    let anchor_ders = match parse_certificate_chain(ca_certificate_pem) {
        Ok(anchors) => anchors,
        Err(e) => {
            debug!(error = %e, "CA certificate is not parseable");
            return false;
        }
    };

    let anchors = match anchor_ders
        .iter()
        .map(|der| webpki::anchor_from_trusted_cert(der))
        .collect::<std::result::Result<Vec<_>, _>>()
    {
        Ok(anchors) => anchors,
        Err(e) => {
            debug!(error = %e, "CA certificate rejected as trust anchor");
            return false;
        }
    };

    let (end_entity, intermediates) = chain.split_at(1);
    let end_entity = match webpki::EndEntityCert::try_from(&end_entity[0]) {
        Ok(cert) => cert,
        Err(e) => {
            debug!(error = %e, "Presented certificate is malformed");
            return false;
        }
    };

    let algorithms = rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms;
    match end_entity.verify_for_usage(
        algorithms.all,
        &anchors,
        intermediates,
        UnixTime::now(),
        AnyExtendedKeyUsage,
        None,
        None,
    ) {
        Ok(_) => true,
        Err(e) => {
            debug!(error = %e, "Presented chain does not validate against the CA");
            false
        }
    }
}

/// Accepts every well-formed EKU extension, or none at all.
struct AnyExtendedKeyUsage;

impl webpki::ExtendedKeyUsageValidator for AnyExtendedKeyUsage {
    fn validate(
        &self,
        iter: webpki::KeyPurposeIdIter<'_, '_>,
    ) -> std::result::Result<(), webpki::Error> {
        for purpose in iter {
            purpose?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

/// Write `cert.pem`, `ca.pem` (full chain) and `key.pem` into `dir`.
///
/// # Errors
///
/// Returns an IO error if the directory or any file cannot be written.
pub fn write_bundle_to_dir(update: &CertificateUpdate, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join("cert.pem"), &update.certificate_pem)?;
    fs::write(dir.join("ca.pem"), update.ca_chain_pems.concat())?;
    write_private(&dir.join("key.pem"), &update.private_key_pem)?;
    debug!(dir = %dir.display(), "Certificate bundle written");
    Ok(())
}

/// Write a secret file readable only by the owner.
pub(crate) fn write_private(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
