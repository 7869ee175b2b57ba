//! Certificate authority and leaf certificate configuration.
//!
//! # Example YAML
//!
//! ```yaml
//! certificate_authority:
//!   ca_type: RSA_2048
//!   private_key_uri: "file:///var/lib/edge/ca.key"
//!   certificate_uri: "file:///var/lib/edge/ca.crt"
//! certificates:
//!   server_certificate_validity_secs: 604800
//!   client_certificate_validity_secs: 604800
//!   disable_certificate_rotation: false
//!   leaf_key_type: ECDSA_P256
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use super::helper::KeyType;
use crate::{Error, Result};

/// Shortest accepted leaf validity.
pub const MIN_CERTIFICATE_VALIDITY_SECS: u64 = 60;
/// Longest accepted leaf validity (10 days).
pub const MAX_CERTIFICATE_VALIDITY_SECS: u64 = 10 * 24 * 60 * 60;
/// Default leaf validity (7 days).
pub const DEFAULT_CERTIFICATE_VALIDITY_SECS: u64 = 7 * 24 * 60 * 60;

const SUPPORTED_URI_SCHEMES: [&str; 2] = ["file", "pkcs11"];

// ─────────────────────────────────────────────────────────────────────────────
// Leaf certificates
// ─────────────────────────────────────────────────────────────────────────────

/// Settings for issued leaf certificates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificatesConfig {
    /// Validity of server certificates, in seconds.
    pub server_certificate_validity_secs: u64,
    /// Validity of client certificates, in seconds.
    pub client_certificate_validity_secs: u64,
    /// When set, a generator that already holds a certificate never reissues.
    pub disable_certificate_rotation: bool,
    /// Key algorithm for per-subscription leaf key pairs.
    pub leaf_key_type: KeyType,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            server_certificate_validity_secs: DEFAULT_CERTIFICATE_VALIDITY_SECS,
            client_certificate_validity_secs: DEFAULT_CERTIFICATE_VALIDITY_SECS,
            disable_certificate_rotation: false,
            leaf_key_type: KeyType::EcdsaP256,
        }
    }
}

impl CertificatesConfig {
    /// Clamp both validity periods into the accepted range, warning when a
    /// value is adjusted.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.server_certificate_validity_secs =
            clamp_validity("server", self.server_certificate_validity_secs);
        self.client_certificate_validity_secs =
            clamp_validity("client", self.client_certificate_validity_secs);
        self
    }

    /// Server certificate validity.
    #[must_use]
    pub fn server_certificate_validity(&self) -> Duration {
        Duration::from_secs(self.server_certificate_validity_secs)
    }

    /// Client certificate validity.
    #[must_use]
    pub fn client_certificate_validity(&self) -> Duration {
        Duration::from_secs(self.client_certificate_validity_secs)
    }
}

fn clamp_validity(kind: &str, secs: u64) -> u64 {
    let clamped = secs.clamp(MIN_CERTIFICATE_VALIDITY_SECS, MAX_CERTIFICATE_VALIDITY_SECS);
    if clamped != secs {
        warn!(
            kind,
            configured_secs = secs,
            applied_secs = clamped,
            "Certificate validity out of range, clamped"
        );
    }
    clamped
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificate authority
// ─────────────────────────────────────────────────────────────────────────────

/// Where the CA comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfiguration {
    /// Key algorithm of a generated CA.
    pub ca_type: KeyType,
    /// URI of an externally managed CA private key.
    pub private_key_uri: Option<String>,
    /// URI of the externally managed CA certificate chain.
    pub certificate_uri: Option<String>,
}

/// Parsed URIs of a custom CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomCaUris {
    /// CA private key location.
    pub private_key_uri: Url,
    /// CA certificate chain location.
    pub certificate_uri: Url,
}

impl CaConfiguration {
    /// Whether the CA is imported rather than generated.
    #[must_use]
    pub fn is_using_custom_ca(&self) -> bool {
        self.private_key_uri.is_some() && self.certificate_uri.is_some()
    }

    /// Validate the URI pair without resolving it.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfiguration` when only one URI is set, a
    /// URI does not parse, or its scheme is not `file` or `pkcs11`.
    pub fn validate(&self) -> Result<()> {
        self.custom_ca_uris().map(|_| ())
    }

    /// The parsed URI pair, or `None` for a generated CA.
    ///
    /// # Errors
    ///
    /// Same as [`CaConfiguration::validate`].
    pub fn custom_ca_uris(&self) -> Result<Option<CustomCaUris>> {
        match (&self.private_key_uri, &self.certificate_uri) {
            (None, None) => Ok(None),
            (Some(key), Some(cert)) => Ok(Some(CustomCaUris {
                private_key_uri: parse_uri("private_key_uri", key)?,
                certificate_uri: parse_uri("certificate_uri", cert)?,
            })),
            _ => Err(Error::InvalidConfiguration(
                "Both private_key_uri and certificate_uri must be set for a custom CA".to_string(),
            )),
        }
    }
}

fn parse_uri(field: &str, raw: &str) -> Result<Url> {
    let uri = Url::parse(raw)
        .map_err(|e| Error::InvalidConfiguration(format!("Invalid {field} '{raw}': {e}")))?;
    if !SUPPORTED_URI_SCHEMES.contains(&uri.scheme()) {
        return Err(Error::InvalidConfiguration(format!(
            "Unsupported {field} scheme '{}', expected one of {SUPPORTED_URI_SCHEMES:?}",
            uri.scheme()
        )));
    }
    Ok(uri)
}
