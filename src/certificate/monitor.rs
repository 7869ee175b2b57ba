//! Periodic renewal of certificates nearing expiry.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::registry::{GeneratorRegistry, host_addresses_for};
use crate::connectivity::ConnectivityInformation;

/// How often certificates are checked.
pub const DEFAULT_EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Renews tracked certificates that are expired or within the renewal window.
#[derive(Debug)]
pub struct CertificateExpiryMonitor {
    registry: Arc<GeneratorRegistry>,
    connectivity: Arc<ConnectivityInformation>,
}

impl CertificateExpiryMonitor {
    /// Create a monitor over the shared generator registry.
    #[must_use]
    pub fn new(registry: Arc<GeneratorRegistry>, connectivity: Arc<ConnectivityInformation>) -> Self {
        Self {
            registry,
            connectivity,
        }
    }

    /// Check every tracked generator against `now`; returns how many were
    /// renewed.
    pub fn renew_expiring_certificates(&self, now: SystemTime) -> usize {
        let mut renewed = 0;
        for generator in self.registry.snapshot() {
            let Some(reason) = generator.renewal_reason(now) else {
                continue;
            };
            let addresses = host_addresses_for(&generator, &self.connectivity);
            match generator.generate_certificate(&addresses, &reason) {
                Ok(()) => renewed += 1,
                Err(e) => error!(
                    service = %generator.service_name(),
                    certificate_type = %generator.certificate_type(),
                    error = %e,
                    "Failed to renew certificate"
                ),
            }
        }
        renewed
    }

    /// Run [`Self::renew_expiring_certificates`] every `interval` until
    /// shutdown.
    pub fn spawn(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "Certificate expiry monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let renewed = monitor.renew_expiring_certificates(SystemTime::now());
                        if renewed > 0 {
                            debug!(renewed, "Renewed expiring certificates");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Certificate expiry monitor shutting down");
                        break;
                    }
                }
            }
        })
    }
}
