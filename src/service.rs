//! The client devices auth service: wiring, background tasks and shutdown.
//!
//! ```text
//! Config ──validate──► GroupManager ─────┐
//!                      SessionManager ───┼──► DeviceAuthClient
//!                      CertificateStore ─┘
//!                      CertificateManager ◄── KeyProvider
//!                             │
//!                  outputs, expiry monitor, CA upload
//! ```
//!
//! Every background task listens on the service's shutdown channel and its
//! `JoinHandle` is kept so [`ClientDevicesAuthService::shutdown`] can wait
//! for it.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::certificate::helper::write_bundle_to_dir;
use crate::certificate::monitor::DEFAULT_EXPIRY_CHECK_INTERVAL;
use crate::certificate::{
    CertificateManager, CertificateStore, GetCertificateRequest, KeyProvider,
};
use crate::config::{CertificateOutput, Config, SessionConfig};
use crate::config_reload::{ConfigPatch, LiveConfig, apply_patch, compute_diff};
use crate::connectivity::{ConnectivityInformation, HostAddress, SOURCE_CONFIGURATION};
use crate::device_auth::DeviceAuthClient;
use crate::iot::{CaRegistrar, IotAuthClient};
use crate::policy::GroupManager;
use crate::session::SessionManager;
use crate::{Error, Result};

/// External collaborators of the service.
#[derive(Clone)]
pub struct Collaborators {
    /// Identity source of truth.
    pub iot_client: Arc<dyn IotAuthClient>,
    /// Where CA certificates are registered; `None` disables the upload.
    pub ca_registrar: Option<Arc<dyn CaRegistrar>>,
    /// Resolves custom CA URIs.
    pub key_provider: Arc<dyn KeyProvider>,
}

struct SessionTasks {
    stop: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

/// All trust components wired together.
pub struct ClientDevicesAuthService {
    live_config: Arc<LiveConfig>,
    certificates: Arc<CertificateManager>,
    sessions: Arc<SessionManager>,
    groups: Arc<GroupManager>,
    device_auth: Arc<DeviceAuthClient>,
    ca_registrar: Option<Arc<dyn CaRegistrar>>,
    shutdown_tx: broadcast::Sender<()>,
    session_tasks: Mutex<Option<SessionTasks>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ClientDevicesAuthService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientDevicesAuthService")
            .field("certificates", &self.certificates)
            .field("sessions", &self.sessions.session_count())
            .finish_non_exhaustive()
    }
}

impl ClientDevicesAuthService {
    /// Validate `config` and build every component. Nothing runs until
    /// [`Self::start`].
    ///
    /// # Errors
    ///
    /// Returns the validation error, or an IO error if the work directory
    /// cannot be created.
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.work_dir)?;

        let store = Arc::new(CertificateStore::new(&config.work_dir));
        let connectivity = Arc::new(ConnectivityInformation::new());
        let certificates = Arc::new(CertificateManager::new(
            Arc::clone(&store),
            connectivity,
            collaborators.key_provider,
            config.certificates.clone(),
        ));

        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&collaborators.iot_client),
            store.device_certificates(),
        ));
        sessions.set_session_capacity(config.session.capacity);

        let groups = Arc::new(GroupManager::new());
        groups.apply(&config.device_groups)?;

        let device_auth = Arc::new(DeviceAuthClient::new(
            Arc::clone(&sessions),
            Arc::clone(&groups),
            store,
            collaborators.iot_client,
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            live_config: Arc::new(LiveConfig::new(config)),
            certificates,
            sessions,
            groups,
            device_auth,
            ca_registrar: collaborators.ca_registrar,
            shutdown_tx,
            session_tasks: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Configure the CA, record configured connectivity, subscribe the
    /// configured certificate outputs and start the background tasks.
    ///
    /// # Errors
    ///
    /// Returns the CA configuration error, which is fatal for the service,
    /// or the first output subscription error.
    pub async fn start(&self) -> Result<()> {
        let config = self.live_config.get();

        self.certificates
            .configure_certificate_authority(&config.certificate_authority)
            .await?;
        info!(
            ca_type = %config.certificate_authority.ca_type,
            custom = config.certificate_authority.is_using_custom_ca(),
            "Certificate authority configured"
        );

        self.certificates.record_connectivity(
            SOURCE_CONFIGURATION,
            config.connectivity.host_addresses.iter().map(HostAddress::of),
        );

        for output in &config.certificate_outputs {
            self.subscribe_output(output)?;
        }

        self.restart_session_tasks(&config.session);
        let monitor = self
            .certificates
            .expiry_monitor()
            .spawn(DEFAULT_EXPIRY_CHECK_INTERVAL, self.shutdown_tx.subscribe());
        self.tasks.lock().push(monitor);
        self.spawn_ca_upload(config.thing_name.clone());

        info!(
            groups = config.device_groups.definitions.len(),
            outputs = config.certificate_outputs.len(),
            "Client devices auth service started"
        );
        Ok(())
    }

    /// Keep `output.directory` supplied with the subscribed bundle.
    ///
    /// # Errors
    ///
    /// Returns the subscription error.
    pub fn subscribe_output(&self, output: &CertificateOutput) -> Result<()> {
        let directory = output.directory.clone();
        let service_name = output.service_name.clone();
        self.certificates
            .subscribe_to_certificate_updates(GetCertificateRequest::new(
                output.service_name.clone(),
                output.certificate_type,
                move |update| {
                    if let Err(e) = write_bundle_to_dir(&update, &directory) {
                        error!(
                            service = %service_name,
                            dir = %directory.display(),
                            error = %e,
                            "Failed to write certificate bundle"
                        );
                    }
                },
            ))
    }

    /// Stop the session sweeps, if running, and start them with `session`'s
    /// intervals.
    pub fn restart_session_tasks(&self, session: &SessionConfig) {
        let (stop, _) = broadcast::channel(1);
        let refresh = self
            .sessions
            .spawn_refresh_task(session.refresh_interval(), stop.subscribe());
        let idle = self.sessions.spawn_idle_expiry_task(
            session.idle_sweep_interval(),
            session.idle_timeout(),
            stop.subscribe(),
        );

        let previous = self.session_tasks.lock().replace(SessionTasks {
            stop,
            handles: vec![refresh, idle],
        });
        if let Some(previous) = previous {
            let _ = previous.stop.send(());
            self.tasks.lock().extend(previous.handles);
        }
    }

    /// Register the CA with the cloud in the background, if a registrar and
    /// a core device name are configured.
    pub fn spawn_ca_upload(&self, thing_name: Option<String>) {
        let (Some(registrar), Some(thing_name)) = (self.ca_registrar.clone(), thing_name) else {
            return;
        };
        let certificates = Arc::clone(&self.certificates);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            match certificates
                .upload_core_device_cas(registrar.as_ref(), &thing_name, &mut shutdown)
                .await
            {
                Ok(()) | Err(Error::Shutdown) => {}
                Err(e) => error!(thing_name = %thing_name, error = %e, "Failed to upload CA certificates"),
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Validate `new` and apply the sections that differ from the running
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns the validation error, in which case nothing changes, or the
    /// first error applying a section.
    pub async fn apply_config(&self, new: Config) -> Result<ConfigPatch> {
        if let Err(e) = new.validate() {
            warn!(error = %e, "Rejected invalid configuration");
            return Err(e);
        }
        let old = self.live_config.get();
        let patch = compute_diff(&old, &new);
        if patch.is_empty() {
            return Ok(patch);
        }
        info!(changes = %patch.summary(), "Applying configuration changes");

        // restart-only settings keep their running values
        let applied = Config {
            env_files: old.env_files.clone(),
            work_dir: old.work_dir.clone(),
            thing_name: old.thing_name.clone(),
            registry: old.registry.clone(),
            ..new
        };
        apply_patch(&patch, &applied, self).await?;
        self.live_config.set(applied);
        Ok(patch)
    }

    /// Signal every background task to stop and wait for them.
    pub async fn shutdown(&self) {
        info!("Client devices auth service shutting down");
        let _ = self.shutdown_tx.send(());

        let mut handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if let Some(session_tasks) = self.session_tasks.lock().take() {
            let _ = session_tasks.stop.send(());
            handles.extend(session_tasks.handles);
        }
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
    }

    /// A receiver on the service shutdown channel.
    #[must_use]
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// The running configuration.
    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        self.live_config.get()
    }

    /// Authentication and authorization façade.
    #[must_use]
    pub fn device_auth(&self) -> &Arc<DeviceAuthClient> {
        &self.device_auth
    }

    /// Certificate subscriptions and CA.
    #[must_use]
    pub fn certificates(&self) -> &Arc<CertificateManager> {
        &self.certificates
    }

    /// Session store.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Group configuration.
    #[must_use]
    pub fn groups(&self) -> &Arc<GroupManager> {
        &self.groups
    }
}
