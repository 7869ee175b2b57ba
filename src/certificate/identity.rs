//! X.509 inspection of issued certificates.
//!
//! Extracts the fields the rotation machinery and tests care about: subject
//! Common Name, SAN DNS names and IP addresses, and the expiry instant.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use super::helper::parse_certificate_chain;
use crate::{Error, Result};

/// Fields read from a leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject Common Name (CN).
    pub common_name: Option<String>,
    /// Subject Alternative Name: DNS entries.
    pub san_dns_names: Vec<String>,
    /// Subject Alternative Name: IP entries, formatted.
    pub san_ip_addresses: Vec<String>,
    /// End of the validity period.
    pub not_after: SystemTime,
}

impl CertificateInfo {
    /// Inspect the first certificate of a PEM bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM holds no parseable certificate.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let chain = parse_certificate_chain(pem)
            .map_err(|e| Error::CertificateGeneration(e.to_string()))?;
        Self::from_der(chain[0].as_ref())
    }

    /// Inspect a DER-encoded certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateGeneration` if the certificate cannot be
    /// parsed.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::CertificateGeneration(format!("Failed to parse certificate: {e}")))?;

        let (san_dns_names, san_ip_addresses) = extract_sans(&cert);

        Ok(Self {
            common_name: extract_cn(&cert),
            san_dns_names,
            san_ip_addresses,
            not_after: to_system_time(cert.validity().not_after.timestamp()),
        })
    }

    /// Every SAN, DNS names first.
    #[must_use]
    pub fn subject_alt_names(&self) -> Vec<&str> {
        self.san_dns_names
            .iter()
            .chain(&self.san_ip_addresses)
            .map(String::as_str)
            .collect()
    }
}

fn extract_cn(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn extract_sans(cert: &X509Certificate<'_>) -> (Vec<String>, Vec<String>) {
    let mut dns_names = Vec::new();
    let mut ips = Vec::new();

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push((*dns).to_owned()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = format_ip(bytes) {
                        ips.push(ip);
                    }
                }
                _ => {}
            }
        }
    }

    (dns_names, ips)
}

fn format_ip(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(|b| Ipv4Addr::from(b).to_string()),
        16 => <[u8; 16]>::try_from(bytes).ok().map(|b| Ipv6Addr::from(b).to_string()),
        _ => None,
    }
}

fn to_system_time(unix_secs: i64) -> SystemTime {
    u64::try_from(unix_secs)
        .map_or(UNIX_EPOCH, |secs| UNIX_EPOCH + Duration::from_secs(secs))
}
