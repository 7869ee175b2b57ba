//! Certificate subscriptions, CA configuration and CA upload.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::config::{CaConfiguration, CertificatesConfig, CustomCaUris};
use super::generator::{
    CertificateCallback, CertificateGenerator, CertificateType, CertificateUpdate,
    SharedCertificatesConfig,
};
use super::key_provider::KeyProvider;
use super::monitor::CertificateExpiryMonitor;
use super::registry::{GeneratorRegistry, host_addresses_for};
use super::rotation::CertificateRotationHandler;
use super::store::{CaChainObserver, CertificateStore};
use crate::connectivity::{ConnectivityChanges, ConnectivityInformation, HostAddress};
use crate::iot::CaRegistrar;
use crate::retry::{RetryPolicy, with_retry};
use crate::{Error, Result};

/// Reason logged when connectivity drives re-issuance.
pub const CONNECTIVITY_CHANGED_REASON: &str = "connectivity information changed";
/// Reason logged for the first certificate of a subscription.
pub const SUBSCRIPTION_REASON: &str = "initialization of certificate subscription";

const CUSTOM_CA_ATTEMPTS: usize = 3;
const CUSTOM_CA_INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const CA_UPLOAD_INITIAL_BACKOFF: Duration = Duration::from_secs(3);
const CA_UPLOAD_MAX_BACKOFF: Duration = Duration::from_secs(120);

/// A request to keep a service supplied with certificates.
#[derive(Clone)]
pub struct GetCertificateRequest {
    /// Subscribing service; also the certificate CN.
    pub service_name: String,
    /// Server or client certificate.
    pub certificate_type: CertificateType,
    /// Receives every issued bundle.
    pub callback: CertificateCallback,
}

impl GetCertificateRequest {
    /// Build a request from a plain closure.
    pub fn new(
        service_name: impl Into<String>,
        certificate_type: CertificateType,
        callback: impl Fn(CertificateUpdate) + Send + Sync + 'static,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            certificate_type,
            callback: Arc::new(callback),
        }
    }
}

impl fmt::Debug for GetCertificateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetCertificateRequest")
            .field("service_name", &self.service_name)
            .field("certificate_type", &self.certificate_type)
            .finish_non_exhaustive()
    }
}

type SubscriptionKey = (String, CertificateType);

/// Issues certificates to subscribers and keeps them current.
pub struct CertificateManager {
    store: Arc<CertificateStore>,
    connectivity: Arc<ConnectivityInformation>,
    registry: Arc<GeneratorRegistry>,
    /// Strong owner of the observer the store only holds weakly.
    _rotation_handler: Arc<dyn CaChainObserver>,
    expiry_monitor: Arc<CertificateExpiryMonitor>,
    subscriptions: DashMap<SubscriptionKey, Arc<CertificateGenerator>>,
    config: SharedCertificatesConfig,
    key_provider: Arc<dyn KeyProvider>,
}

impl fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateManager")
            .field("store", &self.store)
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl CertificateManager {
    /// Wire a manager to the store and register its rotation handler.
    #[must_use]
    pub fn new(
        store: Arc<CertificateStore>,
        connectivity: Arc<ConnectivityInformation>,
        key_provider: Arc<dyn KeyProvider>,
        config: CertificatesConfig,
    ) -> Self {
        let registry = Arc::new(GeneratorRegistry::new());
        let rotation_handler: Arc<dyn CaChainObserver> = Arc::new(CertificateRotationHandler::new(
            Arc::clone(&registry),
            Arc::clone(&connectivity),
        ));
        store.add_observer(&rotation_handler);
        let expiry_monitor = Arc::new(CertificateExpiryMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&connectivity),
        ));

        Self {
            store,
            connectivity,
            registry,
            _rotation_handler: rotation_handler,
            expiry_monitor,
            subscriptions: DashMap::new(),
            config: Arc::new(RwLock::new(config.clamped())),
            key_provider,
        }
    }

    /// The CA store.
    #[must_use]
    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    /// The connectivity registry feeding server SANs.
    #[must_use]
    pub fn connectivity(&self) -> &Arc<ConnectivityInformation> {
        &self.connectivity
    }

    /// The expiry monitor over this manager's subscriptions.
    #[must_use]
    pub fn expiry_monitor(&self) -> &Arc<CertificateExpiryMonitor> {
        &self.expiry_monitor
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Current leaf certificate settings.
    #[must_use]
    pub fn certificates_config(&self) -> CertificatesConfig {
        self.config.read().clone()
    }

    /// Replace leaf certificate settings; applies to the next issuance.
    pub fn update_certificates_configuration(&self, config: CertificatesConfig) {
        *self.config.write() = config.clamped();
        info!("Certificates configuration updated");
    }

    // ── subscriptions ────────────────────────────────────────────────────────

    /// Subscribe to certificate updates.
    ///
    /// Issues immediately when a CA is configured; otherwise the first
    /// certificate follows once one is. Subscribing again with the same
    /// service name and type replaces the previous subscription and issues
    /// a fresh certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateGeneration` if the key pair or the initial
    /// certificate cannot be generated. The subscription is not kept then.
    pub fn subscribe_to_certificate_updates(&self, request: GetCertificateRequest) -> Result<()> {
        let generator = Arc::new(CertificateGenerator::new(
            request.service_name.clone(),
            request.certificate_type,
            request.callback,
            Arc::clone(&self.store),
            Arc::clone(&self.config),
        )?);
        self.registry.register(&generator);

        if self.store.is_ready() {
            let addresses = host_addresses_for(&generator, &self.connectivity);
            if let Err(e) = generator.generate_certificate(&addresses, SUBSCRIPTION_REASON) {
                self.registry.remove(&generator);
                return Err(e);
            }
        } else {
            info!(
                service = %request.service_name,
                certificate_type = %request.certificate_type,
                "No CA configured yet, certificate will be issued once available"
            );
        }

        let key = (request.service_name, request.certificate_type);
        if let Some(previous) = self.subscriptions.insert(key, generator) {
            self.registry.remove(&previous);
        }
        Ok(())
    }

    /// Drop a subscription; returns whether one existed.
    pub fn unsubscribe_from_certificate_updates(
        &self,
        service_name: &str,
        certificate_type: CertificateType,
    ) -> bool {
        let removed = self
            .subscriptions
            .remove(&(service_name.to_string(), certificate_type));
        if let Some((_, generator)) = &removed {
            self.registry.remove(generator);
            info!(service = %service_name, certificate_type = %certificate_type, "Unsubscribed");
        }
        removed.is_some()
    }

    // ── certificate authority ────────────────────────────────────────────────

    /// Apply a CA configuration: import a custom CA or generate one.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfiguration` for bad URIs, or the import or
    /// generation error.
    pub async fn configure_certificate_authority(&self, ca: &CaConfiguration) -> Result<()> {
        match ca.custom_ca_uris()? {
            Some(uris) => self.configure_custom_ca(&uris).await,
            None => self.store.update(ca.ca_type),
        }
    }

    /// Import a CA through the key provider, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the provider error after the last attempt, or
    /// `Error::KeyStore` if the material is unusable.
    pub async fn configure_custom_ca(&self, uris: &CustomCaUris) -> Result<()> {
        let policy = RetryPolicy::attempts(CUSTOM_CA_ATTEMPTS, CUSTOM_CA_INITIAL_BACKOFF);
        let provider = &self.key_provider;
        let material = with_retry(
            &policy,
            "load custom CA",
            || async { provider.load_key_material(&uris.private_key_uri, &uris.certificate_uri) },
            |e| matches!(e, Error::ServiceUnavailable(_)),
        )
        .await?;

        info!(certificate_uri = %uris.certificate_uri, "Using custom CA");
        self.store
            .set_ca_key_and_certificate_chain(material.private_key_pem, material.certificate_chain_pems)
    }

    /// CA certificate PEMs to publish to devices.
    #[must_use]
    pub fn ca_certificates(&self) -> Vec<String> {
        self.store.ca_chain_pems()
    }

    /// Register the CA certificates of core device `thing_name` with the
    /// cloud.
    ///
    /// Retryable cloud errors are retried without bound; a shutdown signal
    /// ends the loop.
    ///
    /// # Errors
    ///
    /// `Error::Shutdown` when interrupted, `Error::KeyStore` without a CA,
    /// or the non-retryable cloud error.
    pub async fn upload_core_device_cas(
        &self,
        registrar: &dyn CaRegistrar,
        thing_name: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let ca_pems = vec![self.store.ca_certificate_pem()?];
        let policy = RetryPolicy::unbounded(CA_UPLOAD_INITIAL_BACKOFF, CA_UPLOAD_MAX_BACKOFF);
        let upload = with_retry(
            &policy,
            "upload core device CAs",
            || registrar.put_certificate_authorities(thing_name, &ca_pems),
            Error::is_retryable_cloud_error,
        );

        tokio::select! {
            result = upload => match result {
                Ok(()) => {
                    info!(thing_name, "Uploaded core device CA certificates");
                    Ok(())
                }
                Err(Error::CloudServiceInteraction { kind, message }) => {
                    error!(thing_name, kind = %kind, error = %message, "CA upload failed");
                    Err(Error::cloud(
                        kind,
                        format!("Failed to put core CA certificates to cloud: {message}"),
                    ))
                }
                Err(e) => Err(e),
            },
            _ = shutdown.recv() => {
                warn!(thing_name, "CA upload interrupted by shutdown");
                Err(Error::Shutdown)
            }
        }
    }

    // ── connectivity ─────────────────────────────────────────────────────────

    /// Record the addresses of `source`; server certificates are re-issued
    /// when the aggregated set changes.
    pub fn record_connectivity(
        &self,
        source: &str,
        addresses: impl IntoIterator<Item = HostAddress>,
    ) -> ConnectivityChanges {
        let changes = self
            .connectivity
            .record_connectivity_information_for_source(source, addresses);
        if !changes.is_empty() {
            info!(
                source,
                added = ?changes.added,
                removed = ?changes.removed,
                "Connectivity changed"
            );
            self.regenerate_server_certificates(CONNECTIVITY_CHANGED_REASON);
        }
        changes
    }

    fn regenerate_server_certificates(&self, reason: &str) {
        if !self.store.is_ready() {
            return;
        }
        let addresses = self.connectivity.cached_host_addresses();
        for generator in self.registry.snapshot() {
            if generator.certificate_type() != CertificateType::Server {
                continue;
            }
            if let Err(e) = generator.generate_certificate(&addresses, reason) {
                error!(
                    service = %generator.service_name(),
                    error = %e,
                    "Failed to re-issue server certificate"
                );
            }
        }
    }

    #[cfg(test)]
    fn tracked_generators(&self) -> usize {
        self.registry.len()
    }
}
