//! Certificate authority and leaf certificate rotation.
//!
//! ```text
//!   CertificateStore ── CA swap ──► CertificateRotationHandler ─┐
//!          ▲                                                    │
//!          │ ca_material()        CertificateExpiryMonitor ─────┤
//!          │                                                    ▼
//!   CertificateGenerator ◄──────────── GeneratorRegistry ◄── CertificateManager
//!          │                                                    ▲
//!          └── callback(CertificateUpdate)      ConnectivityInformation
//! ```
//!
//! Every path that produces a certificate (subscription, CA rotation,
//! connectivity change, expiry) goes through
//! [`CertificateGenerator::generate_certificate`].

pub mod config;
pub mod device_store;
pub mod generator;
pub mod helper;
pub mod identity;
pub mod key_provider;
pub mod manager;
pub mod monitor;
pub mod registry;
pub mod rotation;
pub mod store;

pub use config::{CaConfiguration, CertificatesConfig};
pub use device_store::DeviceCertificateStore;
pub use generator::{CertificateGenerator, CertificateType, CertificateUpdate};
pub use helper::KeyType;
pub use key_provider::{FileKeyProvider, KeyMaterial, KeyProvider};
pub use manager::{CertificateManager, GetCertificateRequest};
pub use monitor::CertificateExpiryMonitor;
pub use rotation::CertificateRotationHandler;
pub use store::{CaChainObserver, CertificateStore};
