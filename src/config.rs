//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::certificate::{CaConfiguration, CertificateType, CertificatesConfig};
use crate::policy::{DeviceGroupsConfig, GroupConfiguration};
use crate::session::manager::{
    DEFAULT_IDLE_SWEEP_INTERVAL, DEFAULT_IDLE_TIMEOUT, DEFAULT_REFRESH_INTERVAL,
    DEFAULT_SESSION_CAPACITY,
};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Directory for CA material, device certificates and issued bundles
    pub work_dir: PathBuf,
    /// Core device name under which CA certificates are registered
    pub thing_name: Option<String>,
    /// Session cache configuration
    pub session: SessionConfig,
    /// Certificate authority configuration
    pub certificate_authority: CaConfiguration,
    /// Leaf certificate configuration
    pub certificates: CertificatesConfig,
    /// Device groups and policies
    pub device_groups: DeviceGroupsConfig,
    /// Statically configured connectivity
    pub connectivity: ConnectivityConfig,
    /// Offline identity records
    pub registry: RegistryConfig,
    /// Certificate bundles to keep written to disk
    pub certificate_outputs: Vec<CertificateOutput>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            work_dir: PathBuf::from("./edge-trust-work"),
            thing_name: None,
            session: SessionConfig::default(),
            certificate_authority: CaConfiguration::default(),
            certificates: CertificatesConfig::default(),
            device_groups: DeviceGroupsConfig::default(),
            connectivity: ConnectivityConfig::default(),
            registry: RegistryConfig::default(),
            certificate_outputs: Vec::new(),
        }
    }
}

/// Session cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of live sessions
    pub capacity: usize,
    /// Seconds between cloud revalidation sweeps
    pub refresh_interval_secs: u64,
    /// Seconds between idle-session sweeps
    pub idle_sweep_interval_secs: u64,
    /// Seconds of inactivity after which a session is closed
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_SESSION_CAPACITY,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL.as_secs(),
            idle_sweep_interval_secs: DEFAULT_IDLE_SWEEP_INTERVAL.as_secs(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
        }
    }
}

impl SessionConfig {
    /// Refresh sweep interval.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    /// Idle sweep interval.
    #[must_use]
    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_interval_secs.max(1))
    }

    /// Idle timeout.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Statically configured connectivity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Host names or IP addresses the gateway is reachable at
    pub host_addresses: Vec<String>,
}

/// Offline identity records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Certificates considered active
    pub certificates: Vec<RegisteredCertificate>,
}

/// A device certificate known to be active
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredCertificate {
    /// Cloud certificate id
    pub certificate_id: String,
    /// PEM file with the device certificate
    pub certificate_file: PathBuf,
    /// Things attached to the certificate
    #[serde(default)]
    pub things: Vec<String>,
}

/// A certificate subscription whose bundle is written to a directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertificateOutput {
    /// Subscribing service
    pub service_name: String,
    /// Server or client certificate
    pub certificate_type: CertificateType,
    /// Directory receiving `cert.pem`, `ca.pem` and `key.pem`
    pub directory: PathBuf,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("EDGE_TRUST_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in path-like settings.
    ///
    /// Only upper-case names are expanded, so policy variables such as
    /// `${iot:Connection.Thing.ThingName}` are never touched.
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        let work_dir = self.work_dir.to_string_lossy().into_owned();
        self.work_dir = PathBuf::from(expand_home(&expand_string(&re, &work_dir)));

        let ca = &mut self.certificate_authority;
        for uri in [&mut ca.private_key_uri, &mut ca.certificate_uri]
            .into_iter()
            .flatten()
        {
            *uri = expand_string(&re, uri);
        }
        for output in &mut self.certificate_outputs {
            let dir = output.directory.to_string_lossy().into_owned();
            output.directory = PathBuf::from(expand_home(&expand_string(&re, &dir)));
        }
    }

    /// Validate everything that is checked before a configuration is
    /// applied.
    ///
    /// # Errors
    ///
    /// Returns `Error::Policy` for invalid groups or policies and
    /// `Error::InvalidConfiguration` for invalid CA settings.
    pub fn validate(&self) -> Result<()> {
        GroupConfiguration::try_from_config(&self.device_groups)?;
        self.certificate_authority.validate()?;
        for output in &self.certificate_outputs {
            if output.service_name.is_empty() {
                return Err(Error::InvalidConfiguration(
                    "certificate_outputs entries need a service_name".into(),
                ));
            }
        }
        Ok(())
    }
}

fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}
