//! Config hot-reload with diff patching.
//!
//! This module watches the configuration file for changes, computes a
//! structural diff against the running config, and applies only the changed
//! sections to the running service.
//!
//! A new configuration is validated before anything is applied; if it fails
//! validation the running configuration stays in force.
//!
//! # Limitations
//!
//! `work_dir`, `thing_name`, `registry` and `env_files` are read once at
//! startup. When they change a `WARNING` is logged and the change is **not**
//! applied; the process must be restarted.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{CertificateOutput, Config};
use crate::connectivity::{HostAddress, SOURCE_CONFIGURATION};
use crate::service::ClientDevicesAuthService;
use crate::Result;

// ============================================================================
// Public types
// ============================================================================

/// Structural diff computed between two [`Config`] snapshots.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigPatch {
    /// `device_groups` changed.
    pub groups_changed: bool,
    /// `session` changed.
    pub session_changed: bool,
    /// `certificates` changed.
    pub certificates_changed: bool,
    /// `certificate_authority` changed.
    pub certificate_authority_changed: bool,
    /// `connectivity` changed.
    pub connectivity_changed: bool,
    /// Certificate outputs present in `new` but not in `old`.
    pub outputs_added: Vec<CertificateOutput>,
    /// Certificate outputs present in `old` but not in `new`.
    pub outputs_removed: Vec<CertificateOutput>,
    /// Settings that only take effect after a restart.
    pub restart_required: Vec<&'static str>,
}

impl ConfigPatch {
    /// Returns `true` when no changes were detected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.groups_changed
            && !self.session_changed
            && !self.certificates_changed
            && !self.certificate_authority_changed
            && !self.connectivity_changed
            && self.outputs_added.is_empty()
            && self.outputs_removed.is_empty()
            && self.restart_required.is_empty()
    }

    /// Human-readable summary of the patch.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        for (changed, section) in [
            (self.groups_changed, "groups"),
            (self.session_changed, "session"),
            (self.certificates_changed, "certificates"),
            (self.certificate_authority_changed, "certificate_authority"),
            (self.connectivity_changed, "connectivity"),
        ] {
            if changed {
                parts.push(section.to_string());
            }
        }
        if !self.outputs_added.is_empty() {
            parts.push(format!("added outputs: [{}]", output_names(&self.outputs_added)));
        }
        if !self.outputs_removed.is_empty() {
            parts.push(format!("removed outputs: [{}]", output_names(&self.outputs_removed)));
        }
        if !self.restart_required.is_empty() {
            parts.push(format!(
                "restart required for: [{}]",
                self.restart_required.join(", ")
            ));
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}

fn output_names(outputs: &[CertificateOutput]) -> String {
    outputs
        .iter()
        .map(|o| format!("{}/{}", o.service_name, o.certificate_type))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Live, atomically-swappable config snapshot.
///
/// Readers clone the inner `Arc`; writers swap the whole `Arc`.
#[derive(Debug)]
pub struct LiveConfig {
    inner: RwLock<Arc<Config>>,
}

impl LiveConfig {
    /// Create a new `LiveConfig` seeded with the startup configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    /// Clone the current active configuration snapshot.
    #[must_use]
    pub fn get(&self) -> Arc<Config> {
        Arc::clone(&self.inner.read())
    }

    /// Atomically replace the current config.
    pub fn set(&self, config: Config) {
        *self.inner.write() = Arc::new(config);
    }
}

// ============================================================================
// Diff computation (pure, synchronous)
// ============================================================================

/// Compute the structural diff between two config snapshots.
///
/// # Examples
///
/// ```
/// use edge_trust::config::Config;
/// use edge_trust::config_reload::compute_diff;
///
/// let old = Config::default();
/// let mut new = Config::default();
/// new.session.capacity = 10;
/// let patch = compute_diff(&old, &new);
/// assert!(patch.session_changed);
/// assert!(!patch.groups_changed);
/// ```
#[must_use]
pub fn compute_diff(old: &Config, new: &Config) -> ConfigPatch {
    let mut patch = ConfigPatch {
        groups_changed: old.device_groups != new.device_groups,
        session_changed: old.session != new.session,
        certificates_changed: old.certificates != new.certificates,
        certificate_authority_changed: old.certificate_authority != new.certificate_authority,
        connectivity_changed: old.connectivity != new.connectivity,
        ..ConfigPatch::default()
    };

    classify_outputs(old, new, &mut patch);

    for (changed, setting) in [
        (old.work_dir != new.work_dir, "work_dir"),
        (old.thing_name != new.thing_name, "thing_name"),
        (old.registry != new.registry, "registry"),
        (old.env_files != new.env_files, "env_files"),
    ] {
        if changed {
            patch.restart_required.push(setting);
        }
    }

    patch
}

/// Partition certificate outputs into added and removed. A changed output
/// is reported as both.
fn classify_outputs(old: &Config, new: &Config, patch: &mut ConfigPatch) {
    let old_set: HashSet<&CertificateOutput> = old.certificate_outputs.iter().collect();
    let new_set: HashSet<&CertificateOutput> = new.certificate_outputs.iter().collect();

    patch.outputs_added = new
        .certificate_outputs
        .iter()
        .filter(|o| !old_set.contains(o))
        .cloned()
        .collect();
    patch.outputs_removed = old
        .certificate_outputs
        .iter()
        .filter(|o| !new_set.contains(o))
        .cloned()
        .collect();
}

// ============================================================================
// Patch application
// ============================================================================

/// Apply a [`ConfigPatch`] to the running service.
///
/// - **groups**: the new group configuration replaces the old one.
/// - **session**: capacity is applied in place; the sweep tasks are
///   restarted with the new intervals.
/// - **certificates**: applies to the next issuance.
/// - **certificate_authority**: the CA is regenerated or re-imported, which
///   re-issues every subscribed certificate.
/// - **connectivity**: recorded under the `configuration` source; server
///   certificates are re-issued if the aggregate changed.
/// - **outputs**: removed outputs are unsubscribed before added ones
///   subscribe.
///
/// # Errors
///
/// Returns the first error from applying a section. Sections applied before
/// the error stay applied.
pub async fn apply_patch(
    patch: &ConfigPatch,
    new: &Config,
    service: &ClientDevicesAuthService,
) -> Result<()> {
    for setting in &patch.restart_required {
        warn!(setting, "Config reload: change requires restart and was not applied");
    }

    if patch.groups_changed {
        service.groups().apply(&new.device_groups)?;
        info!("Config reload: device groups updated");
    }

    if patch.session_changed {
        service
            .sessions()
            .set_session_capacity(new.session.capacity);
        service.restart_session_tasks(&new.session);
        info!(capacity = new.session.capacity, "Config reload: session settings updated");
    }

    if patch.certificates_changed {
        service
            .certificates()
            .update_certificates_configuration(new.certificates.clone());
    }

    if patch.certificate_authority_changed {
        service
            .certificates()
            .configure_certificate_authority(&new.certificate_authority)
            .await?;
        info!(ca_type = %new.certificate_authority.ca_type, "Config reload: certificate authority updated");
        service.spawn_ca_upload(new.thing_name.clone());
    }

    if patch.connectivity_changed {
        service.certificates().record_connectivity(
            SOURCE_CONFIGURATION,
            new.connectivity.host_addresses.iter().map(HostAddress::of),
        );
    }

    for output in &patch.outputs_removed {
        service
            .certificates()
            .unsubscribe_from_certificate_updates(&output.service_name, output.certificate_type);
    }
    for output in &patch.outputs_added {
        service.subscribe_output(output)?;
    }

    Ok(())
}

// ============================================================================
// File watcher
// ============================================================================

/// File watcher that triggers config hot-reload.
///
/// Holds the underlying `notify` watcher alive for the lifetime of the struct.
pub struct ConfigWatcher {
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ConfigWatcher {
    /// Start watching `config_path` for changes.
    ///
    /// Spawns a debounced background task that re-loads the file and applies
    /// it to `service` on each detected change.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `notify` watcher cannot be created.
    pub fn start(
        config_path: PathBuf,
        service: Arc<ClientDevicesAuthService>,
        shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<Self> {
        let (event_tx, event_rx) = tokio::sync::mpsc::channel(32);

        let watcher = Self::create_notify_watcher(event_tx, &config_path)?;
        Self::spawn_reload_task(config_path, service, event_rx, shutdown_rx);

        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }

    fn create_notify_watcher(
        event_tx: tokio::sync::mpsc::Sender<()>,
        config_path: &Path,
    ) -> Result<RecommendedWatcher> {
        let watch_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let path_for_closure = config_path.to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let is_relevant =
                    result.as_ref().is_ok_and(|e| is_config_event(e, &path_for_closure));
                if is_relevant {
                    let _ = event_tx.try_send(());
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| crate::Error::Internal(format!("Failed to create config watcher: {e}")))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| crate::Error::Internal(format!("Failed to watch config path: {e}")))?;

        Ok(watcher)
    }

    fn spawn_reload_task(
        config_path: PathBuf,
        service: Arc<ClientDevicesAuthService>,
        mut event_rx: tokio::sync::mpsc::Receiver<()>,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            const DEBOUNCE: Duration = Duration::from_millis(500);
            let mut last_event: Option<Instant> = None;
            let mut pending = false;
            let mut ticker = tokio::time::interval(Duration::from_millis(100));

            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        last_event = Some(Instant::now());
                        pending = true;
                    }
                    _ = ticker.tick() => {
                        if pending && last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                            pending = false;
                            last_event = None;
                            reload_once(&config_path, &service).await;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Config watcher shutting down");
                        break;
                    }
                }
            }
        });
    }
}

/// Returns `true` for create/modify events on the watched config file.
fn is_config_event(event: &Event, config_path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| p.ends_with(config_path) || p == config_path)
}

/// Load the config file and hand it to the service.
async fn reload_once(config_path: &Path, service: &ClientDevicesAuthService) {
    let new_config = match Config::load(Some(config_path)) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Config reload: failed to parse config file, keeping current config");
            return;
        }
    };

    match service.apply_config(new_config).await {
        Ok(patch) if patch.is_empty() => debug!("Config reload: no changes detected"),
        Ok(patch) => info!(changes = %patch.summary(), "Config reload: complete"),
        Err(e) => warn!(error = %e, "Config reload: rejected, keeping current config"),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::certificate::{CertificateType, KeyType};
    use crate::policy::GroupDefinition;
    use pretty_assertions::assert_eq;

    fn output(name: &str) -> CertificateOutput {
        CertificateOutput {
            service_name: name.to_string(),
            certificate_type: CertificateType::Server,
            directory: PathBuf::from(format!("/tmp/{name}")),
        }
    }

    #[test]
    fn diff_identical_configs_returns_empty_patch() {
        // GIVEN: two identical default configs
        let old = Config::default();
        let new = Config::default();
        // WHEN
        let patch = compute_diff(&old, &new);
        // THEN
        assert!(patch.is_empty(), "expected empty patch, got: {}", patch.summary());
        assert_eq!(patch.summary(), "no changes");
    }

    #[test]
    fn diff_reports_only_changed_sections() {
        // GIVEN: a new group and a new CA type
        let old = Config::default();
        let mut new = Config::default();
        new.device_groups.definitions.insert(
            "g".into(),
            GroupDefinition {
                selection_rule: "thingName: a".into(),
                policy_name: "p".into(),
            },
        );
        new.certificate_authority.ca_type = KeyType::EcdsaP256;

        // WHEN
        let patch = compute_diff(&old, &new);

        // THEN
        assert!(patch.groups_changed);
        assert!(patch.certificate_authority_changed);
        assert!(!patch.session_changed);
        assert!(!patch.certificates_changed);
        assert!(!patch.connectivity_changed);
        assert_eq!(patch.summary(), "groups; certificate_authority");
    }

    #[test]
    fn diff_classifies_outputs() {
        let old = Config {
            certificate_outputs: vec![output("a"), output("b")],
            ..Config::default()
        };
        let mut changed_b = output("b");
        changed_b.directory = PathBuf::from("/tmp/elsewhere");
        let new = Config {
            certificate_outputs: vec![output("a"), changed_b.clone(), output("c")],
            ..Config::default()
        };

        let patch = compute_diff(&old, &new);

        assert_eq!(patch.outputs_added, vec![changed_b, output("c")]);
        assert_eq!(patch.outputs_removed, vec![output("b")]);
    }

    #[test]
    fn diff_flags_restart_only_settings() {
        let old = Config::default();
        let new = Config {
            work_dir: PathBuf::from("/elsewhere"),
            thing_name: Some("core".into()),
            ..Config::default()
        };

        let patch = compute_diff(&old, &new);

        assert_eq!(patch.restart_required, vec!["work_dir", "thing_name"]);
        assert!(!patch.is_empty());
    }

    #[test]
    fn connectivity_change_is_detected() {
        let old = Config::default();
        let mut new = Config::default();
        new.connectivity.host_addresses.push("10.0.0.1".into());
        assert!(compute_diff(&old, &new).connectivity_changed);
    }

    #[test]
    fn live_config_swaps_atomically() {
        let live = LiveConfig::new(Config::default());
        let before = live.get();
        let mut next = Config::default();
        next.session.capacity = 7;
        live.set(next);
        assert_eq!(before.session.capacity, 1000);
        assert_eq!(live.get().session.capacity, 7);
    }
}
