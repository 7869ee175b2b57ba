//! Generators that are kept current by rotation and expiry monitoring.

use std::sync::Arc;

use parking_lot::RwLock;

use super::generator::{CertificateGenerator, CertificateType};
use crate::connectivity::ConnectivityInformation;

/// Live generators, shared by the manager, the rotation handler and the
/// expiry monitor.
#[derive(Debug, Default)]
pub struct GeneratorRegistry {
    generators: RwLock<Vec<Arc<CertificateGenerator>>>,
}

impl GeneratorRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `generator`. Registering twice is a no-op.
    pub fn register(&self, generator: &Arc<CertificateGenerator>) {
        let mut generators = self.generators.write();
        if !generators.iter().any(|g| Arc::ptr_eq(g, generator)) {
            generators.push(Arc::clone(generator));
        }
    }

    /// Stop tracking `generator`.
    pub fn remove(&self, generator: &Arc<CertificateGenerator>) -> bool {
        let mut generators = self.generators.write();
        let before = generators.len();
        generators.retain(|g| !Arc::ptr_eq(g, generator));
        generators.len() != before
    }

    /// Snapshot of tracked generators.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<CertificateGenerator>> {
        self.generators.read().clone()
    }

    /// Number of tracked generators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.generators.read().len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.generators.read().is_empty()
    }
}

/// SAN input for `generator`: current host addresses for server certificates.
pub(crate) fn host_addresses_for(
    generator: &CertificateGenerator,
    connectivity: &ConnectivityInformation,
) -> Vec<String> {
    match generator.certificate_type() {
        CertificateType::Server => connectivity.cached_host_addresses(),
        CertificateType::Client => Vec::new(),
    }
}
