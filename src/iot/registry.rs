//! In-memory identity registry.
//!
//! Implements [`IotAuthClient`] and [`CaRegistrar`] from locally known
//! records. Used by the binary when it runs without a cloud connection and by
//! tests to script cloud answers, including outages via
//! [`InMemoryIotRegistry::set_offline`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{CaRegistrar, Certificate, IotAuthClient, Thing};
use crate::certificate::helper::certificate_hash;
use crate::error::CloudErrorKind;
use crate::{Error, Result};

/// DashMap-backed registry of active certificates and thing attachments.
#[derive(Debug, Default)]
pub struct InMemoryIotRegistry {
    /// certificate hash → certificate id
    active_certificates: DashMap<String, String>,
    /// thing name → attached certificate ids
    attachments: DashMap<String, HashSet<String>>,
    /// core device name → registered CA PEMs
    registered_cas: DashMap<String, Vec<String>>,
    offline: AtomicBool,
    certificate_lookups: AtomicUsize,
    attachment_lookups: AtomicUsize,
}

impl InMemoryIotRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `certificate_pem` active under `certificate_id`.
    pub fn register_certificate(&self, certificate_pem: &str, certificate_id: impl Into<String>) {
        self.active_certificates
            .insert(certificate_hash(certificate_pem), certificate_id.into());
    }

    /// Forget a certificate; it is reported inactive afterwards.
    pub fn deactivate_certificate(&self, certificate_pem: &str) {
        self.active_certificates
            .remove(&certificate_hash(certificate_pem));
    }

    /// Attach `thing_name` to `certificate_id`.
    pub fn attach_thing(&self, thing_name: &str, certificate_id: &str) {
        self.attachments
            .entry(thing_name.to_string())
            .or_default()
            .insert(certificate_id.to_string());
    }

    /// Detach `thing_name` from `certificate_id`.
    pub fn detach_thing(&self, thing_name: &str, certificate_id: &str) {
        if let Some(mut ids) = self.attachments.get_mut(thing_name) {
            ids.remove(certificate_id);
        }
    }

    /// Simulate the cloud being unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// CA PEMs last registered for `thing_name`.
    #[must_use]
    pub fn registered_cas(&self, thing_name: &str) -> Option<Vec<String>> {
        self.registered_cas.get(thing_name).map(|e| e.clone())
    }

    /// Number of `get_active_certificate_id` calls served.
    #[must_use]
    pub fn certificate_lookups(&self) -> usize {
        self.certificate_lookups.load(Ordering::Relaxed)
    }

    /// Number of `is_thing_attached_to_certificate` calls served.
    #[must_use]
    pub fn attachment_lookups(&self) -> usize {
        self.attachment_lookups.load(Ordering::Relaxed)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::cloud(
                CloudErrorKind::Unavailable,
                "identity registry is offline",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl IotAuthClient for InMemoryIotRegistry {
    async fn get_active_certificate_id(&self, certificate_pem: &str) -> Result<Option<String>> {
        self.certificate_lookups.fetch_add(1, Ordering::Relaxed);
        self.ensure_online()?;
        let hash = certificate_hash(certificate_pem);
        let id = self.active_certificates.get(&hash).map(|e| e.clone());
        debug!(certificate_hash = %hash, active = id.is_some(), "Certificate lookup");
        Ok(id)
    }

    async fn is_thing_attached_to_certificate(
        &self,
        thing: &Thing,
        certificate: &Certificate,
    ) -> Result<bool> {
        self.attachment_lookups.fetch_add(1, Ordering::Relaxed);
        self.ensure_online()?;
        Ok(self
            .attachments
            .get(thing.thing_name())
            .is_some_and(|ids| ids.contains(&certificate.certificate_id)))
    }
}

#[async_trait]
impl CaRegistrar for InMemoryIotRegistry {
    async fn put_certificate_authorities(
        &self,
        thing_name: &str,
        ca_pems: &[String],
    ) -> Result<()> {
        self.ensure_online()?;
        self.registered_cas
            .insert(thing_name.to_string(), ca_pems.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEM: &str = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";

    #[tokio::test]
    async fn registered_certificate_is_active() {
        // GIVEN
        let registry = InMemoryIotRegistry::new();
        registry.register_certificate(PEM, "cert-1");

        // WHEN
        let id = registry.get_active_certificate_id(PEM).await.unwrap();

        // THEN
        assert_eq!(id.as_deref(), Some("cert-1"));
        assert_eq!(registry.certificate_lookups(), 1);
    }

    #[tokio::test]
    async fn deactivated_certificate_is_not_active() {
        let registry = InMemoryIotRegistry::new();
        registry.register_certificate(PEM, "cert-1");
        registry.deactivate_certificate(PEM);

        assert_eq!(registry.get_active_certificate_id(PEM).await.unwrap(), None);
    }

    #[tokio::test]
    async fn offline_registry_returns_cloud_error() {
        let registry = InMemoryIotRegistry::new();
        registry.set_offline(true);

        let err = registry.get_active_certificate_id(PEM).await.unwrap_err();
        assert!(matches!(
            err,
            Error::CloudServiceInteraction {
                kind: CloudErrorKind::Unavailable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn thing_attachment_follows_attach_and_detach() {
        let registry = InMemoryIotRegistry::new();
        let thing = Thing::of("b").unwrap();
        let cert = Certificate::active("hash", "cert-1");

        registry.attach_thing("b", "cert-1");
        assert!(registry.is_thing_attached_to_certificate(&thing, &cert).await.unwrap());

        registry.detach_thing("b", "cert-1");
        assert!(!registry.is_thing_attached_to_certificate(&thing, &cert).await.unwrap());
    }

    #[tokio::test]
    async fn put_certificate_authorities_records_pems() {
        let registry = InMemoryIotRegistry::new();
        registry
            .put_certificate_authorities("core", &["ca".to_string()])
            .await
            .unwrap();
        assert_eq!(registry.registered_cas("core"), Some(vec!["ca".to_string()]));
    }
}
