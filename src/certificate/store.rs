//! The live certificate authority.
//!
//! [`CertificateStore`] is the single owner of the CA key and chain. The pair
//! is held as one `Arc<CaMaterial>` behind a lock and replaced wholesale, so
//! an issuer that grabbed the material never sees a key from one CA with a
//! certificate from another.
//!
//! Layout under the work directory:
//!
//! ```text
//! <work_dir>/ca/ca.key       generated CA private key (0600)
//! <work_dir>/ca/ca.crt       generated CA certificate
//! <work_dir>/ca/passphrase   16 printable ASCII characters (0600)
//! <work_dir>/ca.pem          public copy of the active CA certificate
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::device_store::DeviceCertificateStore;
use super::helper::{self, KeyType, parse_certificate_chain, write_private};
use crate::{Error, Result};

/// Subject CN of a generated CA.
pub const CA_COMMON_NAME: &str = "Edge Trust Core CA";
/// Validity of a generated CA (5 years).
pub const CA_VALIDITY: Duration = Duration::from_secs(5 * 365 * 24 * 60 * 60);

const PASSPHRASE_LEN: usize = 16;

// ─────────────────────────────────────────────────────────────────────────────
// CA material
// ─────────────────────────────────────────────────────────────────────────────

/// A CA private key together with its certificate chain.
#[derive(Debug)]
pub struct CaMaterial {
    private_key_pem: String,
    chain_pems: Vec<String>,
}

impl CaMaterial {
    /// The signing CA certificate (first of the chain).
    #[must_use]
    pub fn certificate_pem(&self) -> &str {
        &self.chain_pems[0]
    }

    /// The full chain, signing CA first.
    #[must_use]
    pub fn chain_pems(&self) -> &[String] {
        &self.chain_pems
    }

    /// The CA private key.
    #[must_use]
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }
}

/// Notified after the active CA chain has been replaced.
///
/// Called outside the store's locks, on the thread that performed the swap.
pub trait CaChainObserver: Send + Sync {
    /// The chain now in force.
    fn on_ca_chain_changed(&self, ca_chain_pems: &[String]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Holder of the active CA and the device certificate cache.
pub struct CertificateStore {
    work_dir: PathBuf,
    ca: RwLock<Option<Arc<CaMaterial>>>,
    passphrase: RwLock<Option<String>>,
    observers: RwLock<Vec<Weak<dyn CaChainObserver>>>,
    /// Serializes CA writers; readers only take `ca`.
    update_lock: Mutex<()>,
    device_certificates: Arc<DeviceCertificateStore>,
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("work_dir", &self.work_dir)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl CertificateStore {
    /// Create an empty store rooted at `work_dir`.
    #[must_use]
    pub fn new(work_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            ca: RwLock::new(None),
            passphrase: RwLock::new(None),
            observers: RwLock::new(Vec::new()),
            update_lock: Mutex::new(()),
            device_certificates: Arc::new(DeviceCertificateStore::new(work_dir)),
        }
    }

    /// Cache of device certificates under the same work directory.
    #[must_use]
    pub fn device_certificates(&self) -> Arc<DeviceCertificateStore> {
        Arc::clone(&self.device_certificates)
    }

    /// Register an observer. Only a weak reference is kept.
    pub fn add_observer(&self, observer: &Arc<dyn CaChainObserver>) {
        self.observers.write().push(Arc::downgrade(observer));
    }

    /// Whether a CA is configured.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ca.read().is_some()
    }

    /// The active CA.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyStore` when no CA is configured yet.
    pub fn ca_material(&self) -> Result<Arc<CaMaterial>> {
        self.ca
            .read()
            .clone()
            .ok_or_else(|| Error::KeyStore("No CA certificate configured".to_string()))
    }

    /// PEM of the signing CA certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyStore` when no CA is configured yet.
    pub fn ca_certificate_pem(&self) -> Result<String> {
        Ok(self.ca_material()?.certificate_pem().to_string())
    }

    /// PEMs of the full CA chain; empty when no CA is configured.
    #[must_use]
    pub fn ca_chain_pems(&self) -> Vec<String> {
        self.ca
            .read()
            .as_ref()
            .map(|ca| ca.chain_pems().to_vec())
            .unwrap_or_default()
    }

    /// The CA passphrase, created and persisted on first use.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the passphrase file cannot be read or written.
    pub fn ca_passphrase(&self) -> Result<String> {
        if let Some(p) = self.passphrase.read().as_ref() {
            return Ok(p.clone());
        }
        let mut slot = self.passphrase.write();
        if let Some(p) = slot.as_ref() {
            return Ok(p.clone());
        }

        let path = self.ca_dir().join("passphrase");
        let passphrase = match fs::read_to_string(&path) {
            Ok(p) if p.len() == PASSPHRASE_LEN => p,
            _ => {
                let p = generate_passphrase();
                fs::create_dir_all(self.ca_dir())?;
                write_private(&path, &p)?;
                p
            }
        };
        *slot = Some(passphrase.clone());
        Ok(passphrase)
    }

    /// Configure a locally managed CA of `ca_type`.
    ///
    /// Reuses the CA persisted in the work directory when its key algorithm
    /// matches; otherwise generates and persists a new one.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateGeneration` if a CA cannot be generated, or
    /// an IO error if it cannot be persisted.
    pub fn update(&self, ca_type: KeyType) -> Result<()> {
        let _guard = self.update_lock.lock();
        self.ca_passphrase()?;

        let material = match self.load_persisted(ca_type) {
            Some(material) => {
                debug!(ca_type = %ca_type, "Reusing persisted CA");
                material
            }
            None => {
                let issued = helper::issue_ca(CA_COMMON_NAME, ca_type, CA_VALIDITY)?;
                fs::create_dir_all(self.ca_dir())?;
                write_private(&self.ca_dir().join("ca.key"), &issued.private_key_pem)?;
                fs::write(self.ca_dir().join("ca.crt"), &issued.certificate_pem)?;
                info!(ca_type = %ca_type, "Generated new CA");
                CaMaterial {
                    private_key_pem: issued.private_key_pem,
                    chain_pems: vec![issued.certificate_pem],
                }
            }
        };

        self.swap(material)
    }

    /// Install an externally supplied CA key and chain.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyStore` when the key or chain is unusable.
    pub fn set_ca_key_and_certificate_chain(
        &self,
        private_key_pem: String,
        chain_pems: Vec<String>,
    ) -> Result<()> {
        let _guard = self.update_lock.lock();
        if chain_pems.is_empty() {
            return Err(Error::KeyStore("CA certificate chain is empty".to_string()));
        }
        helper::key_type_of(&private_key_pem)?;
        for pem in &chain_pems {
            parse_certificate_chain(pem).map_err(|e| Error::KeyStore(e.to_string()))?;
        }
        if !helper::key_matches_certificate(&private_key_pem, &chain_pems[0])? {
            return Err(Error::KeyStore(
                "CA private key does not match the CA certificate".to_string(),
            ));
        }
        self.swap(CaMaterial {
            private_key_pem,
            chain_pems,
        })
    }

    fn ca_dir(&self) -> PathBuf {
        self.work_dir.join("ca")
    }

    fn load_persisted(&self, ca_type: KeyType) -> Option<CaMaterial> {
        let key = fs::read_to_string(self.ca_dir().join("ca.key")).ok()?;
        let cert = fs::read_to_string(self.ca_dir().join("ca.crt")).ok()?;
        match helper::key_type_of(&key) {
            Ok(Some(found)) if found == ca_type => {}
            Ok(found) => {
                info!(
                    configured = %ca_type,
                    persisted = ?found,
                    "Persisted CA has a different key type, regenerating"
                );
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Persisted CA key is unreadable, regenerating");
                return None;
            }
        }
        if let Err(e) = parse_certificate_chain(&cert) {
            warn!(error = %e, "Persisted CA certificate is unreadable, regenerating");
            return None;
        }
        Some(CaMaterial {
            private_key_pem: key,
            chain_pems: vec![cert],
        })
    }

    /// Replace the CA, then notify observers if the chain changed.
    fn swap(&self, material: CaMaterial) -> Result<()> {
        fs::create_dir_all(&self.work_dir)?;
        fs::write(self.work_dir.join("ca.pem"), material.certificate_pem())?;

        let chain = material.chain_pems.clone();
        let changed = {
            let mut slot = self.ca.write();
            let changed = slot
                .as_ref()
                .is_none_or(|current| current.chain_pems != material.chain_pems);
            *slot = Some(Arc::new(material));
            changed
        };

        if changed {
            info!(chain_length = chain.len(), "CA chain updated");
            self.notify(&chain);
        }
        Ok(())
    }

    fn notify(&self, chain: &[String]) {
        let live: Vec<Arc<dyn CaChainObserver>> = {
            let mut observers = self.observers.write();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in live {
            observer.on_ca_chain_changed(chain);
        }
    }
}

/// 16 characters from the printable ASCII range.
fn generate_passphrase() -> String {
    const SPAN: u8 = b'~' - b' ';
    rand::random::<[u8; PASSPHRASE_LEN]>()
        .iter()
        .map(|b| char::from((b & 0x7F) % SPAN + b' '))
        .collect()
}
