//! Identity facets and the cloud identity collaborators.
//!
//! The cloud control plane is the source of truth for which device
//! certificates are active and which things they are attached to. It is
//! consumed through [`IotAuthClient`]; CA registration goes through
//! [`CaRegistrar`]. Both may fail with
//! [`Error::CloudServiceInteraction`](crate::Error::CloudServiceInteraction),
//! which callers must keep distinct from a verified negative answer.
//!
//! [`registry::InMemoryIotRegistry`] implements both traits for offline use
//! and tests.

pub mod registry;

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use registry::InMemoryIotRegistry;

// ─────────────────────────────────────────────────────────────────────────────
// Identity facets
// ─────────────────────────────────────────────────────────────────────────────

/// Cached activity status of a device certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertificateStatus {
    /// Verified active by the cloud.
    Active,
    /// Not verified (yet).
    Unknown,
}

/// Certificate identity facet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// SHA-256 hex digest of the certificate PEM.
    pub certificate_hash: String,
    /// Cloud-assigned certificate id.
    pub certificate_id: String,
    /// Last known status.
    pub status: CertificateStatus,
    /// When `status` was last confirmed.
    pub status_updated: SystemTime,
}

impl Certificate {
    /// Namespace under which this facet is exposed to selection rules.
    pub const NAMESPACE: &'static str = "Certificate";

    /// Build a facet for a certificate the cloud just reported active.
    pub fn active(certificate_hash: impl Into<String>, certificate_id: impl Into<String>) -> Self {
        Self {
            certificate_hash: certificate_hash.into(),
            certificate_id: certificate_id.into(),
            status: CertificateStatus::Active,
            status_updated: SystemTime::now(),
        }
    }

    /// Returns `true` if the last known status is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == CertificateStatus::Active
    }
}

/// Thing identity facet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Thing {
    thing_name: String,
}

impl Thing {
    /// Namespace under which this facet is exposed to selection rules.
    pub const NAMESPACE: &'static str = "Thing";

    /// Create a thing facet.
    ///
    /// # Errors
    ///
    /// Returns `Error::Authentication` if the name contains characters other
    /// than `[A-Za-z0-9_:-]` or is empty.
    pub fn of(thing_name: impl Into<String>) -> Result<Self> {
        let thing_name = thing_name.into();
        let valid = !thing_name.is_empty()
            && thing_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'));
        if !valid {
            return Err(Error::Authentication(format!(
                "Invalid thing name ({thing_name}). The thing name must match [a-zA-Z0-9-_:]+"
            )));
        }
        Ok(Self { thing_name })
    }

    /// The thing name.
    #[must_use]
    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }
}

/// Facet for the gateway's own components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component;

impl Component {
    /// Namespace under which this facet is exposed to selection rules.
    pub const NAMESPACE: &'static str = "Component";
}

// ─────────────────────────────────────────────────────────────────────────────
// Cloud collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// Identity source of truth.
#[async_trait]
pub trait IotAuthClient: Send + Sync + 'static {
    /// Resolve the id of the certificate if it is currently active.
    ///
    /// `Ok(None)` means the cloud answered and the certificate is not active.
    async fn get_active_certificate_id(&self, certificate_pem: &str) -> Result<Option<String>>;

    /// Whether `thing` is attached to `certificate`.
    async fn is_thing_attached_to_certificate(
        &self,
        thing: &Thing,
        certificate: &Certificate,
    ) -> Result<bool>;
}

/// Registers the gateway's CA certificates for a core device.
#[async_trait]
pub trait CaRegistrar: Send + Sync + 'static {
    /// Replace the CA certificates registered for `thing_name`.
    async fn put_certificate_authorities(&self, thing_name: &str, ca_pems: &[String])
    -> Result<()>;
}
