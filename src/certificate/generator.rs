//! Leaf certificate generators.
//!
//! One [`CertificateGenerator`] exists per subscription. It owns the
//! subscription's key pair and callback, remembers the expiry of the last
//! certificate it issued, and is the single code path used for initial
//! issuance, CA rotation, connectivity changes and expiry renewal.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rcgen::KeyPair;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::config::CertificatesConfig;
use super::helper::{self, LeafRequest};
use super::identity::CertificateInfo;
use super::store::CertificateStore;
use crate::{Error, Result};

/// Remaining lifetime below which a certificate is renewed.
pub const RENEWAL_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Certificates configuration shared with every generator.
pub type SharedCertificatesConfig = Arc<RwLock<CertificatesConfig>>;

/// Receives every newly issued certificate bundle.
pub type CertificateCallback = Arc<dyn Fn(CertificateUpdate) + Send + Sync>;

/// Role of an issued leaf certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateType {
    /// TLS server certificate, carries connectivity SANs.
    Server,
    /// TLS client certificate, no network SANs.
    Client,
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// An issued certificate, ready to load into a key store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateUpdate {
    /// Leaf certificate PEM.
    pub certificate_pem: String,
    /// CA chain PEMs, signing CA first.
    pub ca_chain_pems: Vec<String>,
    /// Leaf private key PEM (PKCS#8).
    pub private_key_pem: String,
}

#[derive(Debug, Clone, Copy)]
struct Issued {
    not_after: SystemTime,
}

/// Issues and re-issues the certificate of one subscription.
pub struct CertificateGenerator {
    service_name: String,
    certificate_type: CertificateType,
    key_pair: KeyPair,
    callback: CertificateCallback,
    store: Arc<CertificateStore>,
    config: SharedCertificatesConfig,
    /// Held for the whole issuance so updates reach the callback in order.
    issued: Mutex<Option<Issued>>,
}

impl fmt::Debug for CertificateGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateGenerator")
            .field("service_name", &self.service_name)
            .field("certificate_type", &self.certificate_type)
            .field("expiry", &self.expiry_time())
            .finish_non_exhaustive()
    }
}

impl CertificateGenerator {
    /// Create a generator with a fresh key pair of the configured type.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateGeneration` if the key cannot be generated.
    pub fn new(
        service_name: impl Into<String>,
        certificate_type: CertificateType,
        callback: CertificateCallback,
        store: Arc<CertificateStore>,
        config: SharedCertificatesConfig,
    ) -> Result<Self> {
        let key_type = config.read().leaf_key_type;
        Ok(Self {
            service_name: service_name.into(),
            certificate_type,
            key_pair: helper::generate_key_pair(key_type)?,
            callback,
            store,
            config,
            issued: Mutex::new(None),
        })
    }

    /// Subscribing service.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Role of the issued certificates.
    #[must_use]
    pub fn certificate_type(&self) -> CertificateType {
        self.certificate_type
    }

    /// Expiry of the last issued certificate.
    #[must_use]
    pub fn expiry_time(&self) -> Option<SystemTime> {
        self.issued.lock().map(|i| i.not_after)
    }

    /// Issue a certificate and hand it to the callback.
    ///
    /// `host_addresses` become SANs (plus `localhost`) for server
    /// certificates and are ignored for client certificates.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateGeneration` if no CA is configured or
    /// signing fails. The callback is not invoked in that case.
    pub fn generate_certificate(&self, host_addresses: &[String], reason: &str) -> Result<()> {
        let mut issued = self.issued.lock();
        let config = self.config.read().clone();

        if config.disable_certificate_rotation && issued.is_some() {
            warn!(
                service = %self.service_name,
                certificate_type = %self.certificate_type,
                reason,
                "Certificate rotation is disabled, keeping the current certificate"
            );
            return Ok(());
        }

        let ca = self
            .store
            .ca_material()
            .map_err(|e| Error::CertificateGeneration(e.to_string()))?;

        let (validity, sans) = match self.certificate_type {
            CertificateType::Server => (
                config.server_certificate_validity(),
                server_subject_alt_names(host_addresses),
            ),
            CertificateType::Client => (config.client_certificate_validity(), Vec::new()),
        };

        let certificate_pem = helper::issue_leaf(
            &LeafRequest {
                common_name: &self.service_name,
                certificate_type: self.certificate_type,
                subject_alt_names: &sans,
                validity,
            },
            &self.key_pair,
            ca.certificate_pem(),
            ca.private_key_pem(),
        )?;
        let not_after = CertificateInfo::from_pem(&certificate_pem)?.not_after;

        info!(
            service = %self.service_name,
            certificate_type = %self.certificate_type,
            reason,
            subject_alt_names = ?sans,
            expiry = %DateTime::<Utc>::from(not_after).to_rfc3339(),
            "Issued certificate"
        );

        *issued = Some(Issued { not_after });
        (self.callback)(CertificateUpdate {
            certificate_pem,
            ca_chain_pems: ca.chain_pems().to_vec(),
            private_key_pem: self.key_pair.serialize_pem(),
        });
        Ok(())
    }

    /// Why the current certificate needs renewing at `now`, if it does.
    ///
    /// A generator that never issued has nothing to renew.
    #[must_use]
    pub fn renewal_reason(&self, now: SystemTime) -> Option<String> {
        let expiry = self.expiry_time()?;
        let at = DateTime::<Utc>::from(expiry).to_rfc3339();
        match expiry.duration_since(now) {
            Err(_) => Some(format!("certificate expired at {at}")),
            Ok(remaining) if remaining.is_zero() => Some(format!("certificate expired at {at}")),
            Ok(remaining) if remaining <= RENEWAL_WINDOW => Some(format!(
                "certificate is approaching expiration at {at} with {} seconds remaining",
                remaining.as_secs()
            )),
            Ok(_) => None,
        }
    }
}

/// Connectivity addresses plus `localhost`, first occurrence wins.
fn server_subject_alt_names(host_addresses: &[String]) -> Vec<String> {
    let mut sans: Vec<String> = Vec::with_capacity(host_addresses.len() + 1);
    for name in host_addresses.iter().map(String::as_str).chain(["localhost"]) {
        if !name.is_empty() && !sans.iter().any(|s| s == name) {
            sans.push(name.to_string());
        }
    }
    sans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::helper::{KeyType, is_issued_by};
    use pretty_assertions::assert_eq;

    fn ready_store(dir: &std::path::Path) -> Arc<CertificateStore> {
        let store = Arc::new(CertificateStore::new(dir));
        store.update(KeyType::EcdsaP256).unwrap();
        store
    }

    fn capture() -> (CertificateCallback, Arc<Mutex<Vec<CertificateUpdate>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (Arc::new(move |u| sink.lock().push(u)), seen)
    }

    fn generator(
        store: Arc<CertificateStore>,
        certificate_type: CertificateType,
        config: CertificatesConfig,
    ) -> (CertificateGenerator, Arc<Mutex<Vec<CertificateUpdate>>>) {
        let (callback, seen) = capture();
        let generator = CertificateGenerator::new(
            "broker",
            certificate_type,
            callback,
            store,
            Arc::new(RwLock::new(config)),
        )
        .unwrap();
        (generator, seen)
    }

    #[test]
    fn server_certificate_carries_addresses_and_localhost() {
        // GIVEN
        let dir = tempfile::tempdir().unwrap();
        let store = ready_store(dir.path());
        let (generator, seen) =
            generator(store.clone(), CertificateType::Server, CertificatesConfig::default());

        // WHEN
        generator
            .generate_certificate(&["192.168.1.1".into(), "gateway.local".into()], "test")
            .unwrap();

        // THEN
        let updates = seen.lock();
        assert_eq!(updates.len(), 1);
        let info = CertificateInfo::from_pem(&updates[0].certificate_pem).unwrap();
        assert_eq!(info.san_dns_names, vec!["gateway.local", "localhost"]);
        assert_eq!(info.san_ip_addresses, vec!["192.168.1.1"]);
        assert_eq!(updates[0].ca_chain_pems, store.ca_chain_pems());
        assert!(updates[0].private_key_pem.contains("PRIVATE KEY"));
        assert!(generator.expiry_time().is_some());
    }

    #[test]
    fn client_certificate_has_no_network_sans() {
        let dir = tempfile::tempdir().unwrap();
        let store = ready_store(dir.path());
        let (generator, seen) =
            generator(store.clone(), CertificateType::Client, CertificatesConfig::default());

        generator.generate_certificate(&["10.0.0.1".into()], "test").unwrap();

        let pem = seen.lock()[0].certificate_pem.clone();
        assert!(CertificateInfo::from_pem(&pem).unwrap().subject_alt_names().is_empty());
        assert!(is_issued_by(&pem, &store.ca_certificate_pem().unwrap()));
    }

    #[test]
    fn missing_ca_fails_without_calling_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CertificateStore::new(dir.path()));
        let (generator, seen) =
            generator(store, CertificateType::Server, CertificatesConfig::default());

        let err = generator.generate_certificate(&[], "test").unwrap_err();

        assert!(matches!(err, Error::CertificateGeneration(_)));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn disabled_rotation_keeps_first_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let store = ready_store(dir.path());
        let config = CertificatesConfig {
            disable_certificate_rotation: true,
            ..CertificatesConfig::default()
        };
        let (generator, seen) = generator(store, CertificateType::Server, config);

        generator.generate_certificate(&[], "first").unwrap();
        generator.generate_certificate(&[], "second").unwrap();

        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn renewal_reason_follows_remaining_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let store = ready_store(dir.path());
        let (generator, _) =
            generator(store, CertificateType::Server, CertificatesConfig::default());
        let now = SystemTime::now();
        assert_eq!(generator.renewal_reason(now), None);

        generator.generate_certificate(&[], "test").unwrap();
        let expiry = generator.expiry_time().unwrap();

        assert_eq!(generator.renewal_reason(now), None);
        let soon = generator
            .renewal_reason(expiry - Duration::from_secs(3600))
            .unwrap();
        assert!(soon.contains("approaching expiration"));
        assert!(soon.ends_with("with 3600 seconds remaining"));
        let late = generator
            .renewal_reason(expiry + Duration::from_secs(1))
            .unwrap();
        assert!(late.starts_with("certificate expired at"));
    }

    #[test]
    fn server_sans_are_deduplicated() {
        assert_eq!(
            server_subject_alt_names(&["localhost".into(), "a".into(), "a".into()]),
            vec!["localhost", "a"]
        );
    }
}
