//! Resolution of externally managed CA key material.

use std::fs;
use std::io::ErrorKind;

use url::Url;

use super::helper::split_pem_chain;
use crate::{Error, Result};

/// A CA private key and its certificate chain, leaf (the CA) first.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    /// PEM private key.
    pub private_key_pem: String,
    /// PEM certificates.
    pub certificate_chain_pems: Vec<String>,
}

/// Resolves key and certificate URIs into usable PEM material.
///
/// Implementations return `Error::ServiceUnavailable` for transient
/// failures; callers retry those.
pub trait KeyProvider: Send + Sync {
    /// Load the key pair and chain named by the two URIs.
    ///
    /// # Errors
    ///
    /// `Error::ServiceUnavailable` when the backing store is temporarily
    /// unreachable, `Error::InvalidConfiguration` or `Error::KeyStore` when
    /// the material is missing or unusable.
    fn load_key_material(&self, private_key_uri: &Url, certificate_uri: &Url) -> Result<KeyMaterial>;
}

/// Reads `file://` URIs from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileKeyProvider;

impl FileKeyProvider {
    fn read(uri: &Url) -> Result<String> {
        if uri.scheme() != "file" {
            return Err(Error::InvalidConfiguration(format!(
                "Unsupported key URI scheme '{}' for file key provider",
                uri.scheme()
            )));
        }
        let path = uri
            .to_file_path()
            .map_err(|()| Error::InvalidConfiguration(format!("Invalid file URI '{uri}'")))?;
        fs::read_to_string(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                Error::InvalidConfiguration(format!("File not found: {}", path.display()))
            }
            ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::TimedOut => {
                Error::ServiceUnavailable(format!("Reading {}: {e}", path.display()))
            }
            _ => Error::KeyStore(format!("Reading {}: {e}", path.display())),
        })
    }
}

impl KeyProvider for FileKeyProvider {
    fn load_key_material(&self, private_key_uri: &Url, certificate_uri: &Url) -> Result<KeyMaterial> {
        let private_key_pem = Self::read(private_key_uri)?;
        let chain = Self::read(certificate_uri)?;
        let certificate_chain_pems = split_pem_chain(&chain)
            .map_err(|e| Error::KeyStore(format!("Invalid CA certificate at {certificate_uri}: {e}")))?;
        Ok(KeyMaterial {
            private_key_pem,
            certificate_chain_pems,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::helper::{KeyType, issue_ca};
    use std::time::Duration;

    fn file_url(path: &std::path::Path) -> Url {
        Url::from_file_path(path).unwrap()
    }

    #[test]
    fn loads_key_and_chain_from_files() {
        // GIVEN: a CA written to disk
        let dir = tempfile::tempdir().unwrap();
        let ca = issue_ca("Custom CA", KeyType::EcdsaP256, Duration::from_secs(3600)).unwrap();
        let key_path = dir.path().join("ca.key");
        let cert_path = dir.path().join("ca.crt");
        fs::write(&key_path, &ca.private_key_pem).unwrap();
        fs::write(&cert_path, format!("{}\n", ca.certificate_pem)).unwrap();

        // WHEN
        let material = FileKeyProvider
            .load_key_material(&file_url(&key_path), &file_url(&cert_path))
            .unwrap();

        // THEN
        assert_eq!(material.private_key_pem, ca.private_key_pem);
        assert_eq!(material.certificate_chain_pems.len(), 1);
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let url = file_url(&dir.path().join("absent.pem"));
        let err = FileKeyProvider.load_key_material(&url, &url).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn pkcs11_is_not_handled_by_file_provider() {
        let url = Url::parse("pkcs11:object=ca").unwrap();
        let err = FileKeyProvider.load_key_material(&url, &url).unwrap_err();
        assert!(err.to_string().contains("pkcs11"));
    }
}
