//! Edge Trust Library
//!
//! Local trust service for client devices connecting to an edge gateway.
//!
//! # Features
//!
//! - **Sessions**: certificate-backed device sessions in a bounded LRU store,
//!   revalidated against the identity source of truth
//! - **Authorization**: group selection rules, policy variables and
//!   wildcard/MQTT resource matching
//! - **Certificates**: a local or imported CA issuing server and client
//!   certificates, rotated on CA change, connectivity change and expiry
//! - **Hot reload**: configuration changes applied section by section

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod certificate;
pub mod cli;
pub mod config;
pub mod config_reload;
pub mod connectivity;
pub mod device_auth;
pub mod error;
pub mod iot;
pub mod policy;
pub mod retry;
pub mod service;
pub mod session;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` overrides `level` when set.
///
/// # Errors
///
/// Returns `Error::Internal` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
