//! Re-issue every tracked certificate when the CA chain changes.

use std::sync::Arc;

use tracing::{error, info};

use super::registry::{GeneratorRegistry, host_addresses_for};
use super::store::CaChainObserver;
use crate::connectivity::ConnectivityInformation;

/// Reason logged for CA-driven re-issuance.
pub const CA_CHANGED_REASON: &str = "Certificate Configuration Changed";

/// Registered on the [`CertificateStore`](super::store::CertificateStore)
/// as a CA chain observer.
#[derive(Debug)]
pub struct CertificateRotationHandler {
    registry: Arc<GeneratorRegistry>,
    connectivity: Arc<ConnectivityInformation>,
}

impl CertificateRotationHandler {
    /// Create a handler over the shared generator registry.
    #[must_use]
    pub fn new(registry: Arc<GeneratorRegistry>, connectivity: Arc<ConnectivityInformation>) -> Self {
        Self {
            registry,
            connectivity,
        }
    }
}

impl CaChainObserver for CertificateRotationHandler {
    fn on_ca_chain_changed(&self, ca_chain_pems: &[String]) {
        let generators = self.registry.snapshot();
        info!(
            generators = generators.len(),
            chain_length = ca_chain_pems.len(),
            "CA changed, re-issuing certificates"
        );
        for generator in generators {
            let addresses = host_addresses_for(&generator, &self.connectivity);
            if let Err(e) = generator.generate_certificate(&addresses, CA_CHANGED_REASON) {
                error!(
                    service = %generator.service_name(),
                    certificate_type = %generator.certificate_type(),
                    error = %e,
                    "Failed to re-issue certificate after CA change"
                );
            }
        }
    }
}
