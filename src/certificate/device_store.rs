//! On-disk cache of device certificates, keyed by content hash.
//!
//! Layout: `<work_dir>/devices/<sha256-hex>.pem`. Writes are idempotent;
//! a hash that is already present is never rewritten.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Error, Result};

/// Directory of cached device certificate PEMs.
#[derive(Debug, Clone)]
pub struct DeviceCertificateStore {
    devices_dir: PathBuf,
}

impl DeviceCertificateStore {
    /// Store rooted at `<work_dir>/devices`.
    #[must_use]
    pub fn new(work_dir: &Path) -> Self {
        Self {
            devices_dir: work_dir.join("devices"),
        }
    }

    /// Directory holding the cached PEMs.
    #[must_use]
    pub fn devices_dir(&self) -> &Path {
        &self.devices_dir
    }

    /// Persist `certificate_pem` under `hash` unless it is already present.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory or file cannot be written.
    pub fn store_device_certificate_if_absent(&self, hash: &str, certificate_pem: &str) -> Result<()> {
        let path = self.path_for(hash)?;
        if path.exists() {
            return Ok(());
        }
        fs::create_dir_all(&self.devices_dir)?;
        fs::write(&path, certificate_pem)?;
        debug!(certificate_hash = hash, "Device certificate cached");
        Ok(())
    }

    /// Load the PEM cached under `hash`, if any.
    ///
    /// # Errors
    ///
    /// Returns an IO error for failures other than a missing file.
    pub fn load_device_certificate(&self, hash: &str) -> Result<Option<String>> {
        let path = self.path_for(hash)?;
        match fs::read_to_string(path) {
            Ok(pem) => Ok(Some(pem)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn path_for(&self, hash: &str) -> Result<PathBuf> {
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Internal(format!("Invalid certificate hash '{hash}'")));
        }
        Ok(self.devices_dir.join(format!("{hash}.pem")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::helper::certificate_hash;

    #[test]
    fn store_then_load() {
        // GIVEN
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceCertificateStore::new(dir.path());
        let hash = certificate_hash("pem");

        // WHEN
        store.store_device_certificate_if_absent(&hash, "pem").unwrap();

        // THEN
        assert_eq!(store.load_device_certificate(&hash).unwrap().as_deref(), Some("pem"));
        assert!(dir.path().join("devices").join(format!("{hash}.pem")).exists());
    }

    #[test]
    fn existing_entry_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceCertificateStore::new(dir.path());
        let hash = certificate_hash("first");

        store.store_device_certificate_if_absent(&hash, "first").unwrap();
        store.store_device_certificate_if_absent(&hash, "second").unwrap();

        assert_eq!(store.load_device_certificate(&hash).unwrap().as_deref(), Some("first"));
    }

    #[test]
    fn missing_entry_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceCertificateStore::new(dir.path());
        assert_eq!(store.load_device_certificate("abcd").unwrap(), None);
    }

    #[test]
    fn path_traversal_hash_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceCertificateStore::new(dir.path());
        assert!(store.load_device_certificate("../etc/passwd").is_err());
    }
}
