//! Connectivity information aggregation.
//!
//! Every source (the cloud connectivity service, local configuration, ...)
//! contributes its own set of host addresses at which the gateway can be
//! reached. The effective set is the union across sources and feeds the
//! Subject Alternative Names of issued server certificates.
//!
//! Updating a source replaces only that source's contribution, so an address
//! claimed by two sources survives the removal of either one.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Source id used for addresses reported by the cloud connectivity service.
pub const SOURCE_CONNECTIVITY_SERVICE: &str = "connectivity-information-service";

/// Source id used for addresses listed under `connectivity.host_addresses`.
pub const SOURCE_CONFIGURATION: &str = "configuration";

// ─────────────────────────────────────────────────────────────────────────────
// HostAddress
// ─────────────────────────────────────────────────────────────────────────────

/// A host name or IP literal at which the gateway is reachable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostAddress(String);

impl HostAddress {
    /// Wrap a host string.
    pub fn of(host: impl Into<String>) -> Self {
        Self(host.into())
    }

    /// The raw host string.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.0
    }

    /// Parsed IP address, if the host is an IPv4 or IPv6 literal.
    #[must_use]
    pub fn ip_address(&self) -> Option<IpAddr> {
        self.0.parse().ok()
    }

    /// `true` for IPv4/IPv6 literals.
    #[must_use]
    pub fn is_ip_address(&self) -> bool {
        self.ip_address().is_some()
    }

    /// `true` for IP literals and `localhost`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.is_ip_address() || self.0 == "localhost"
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostAddress {
    fn from(s: &str) -> Self {
        Self::of(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Change set
// ─────────────────────────────────────────────────────────────────────────────

/// Difference in the aggregated address set caused by one update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityChanges {
    /// Addresses that were not reachable before the update.
    pub added: BTreeSet<HostAddress>,
    /// Addresses no source claims any more.
    pub removed: BTreeSet<HostAddress>,
}

impl ConnectivityChanges {
    /// Returns `true` when the aggregated set did not change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectivityInformation
// ─────────────────────────────────────────────────────────────────────────────

/// Per-source host address registry.
#[derive(Debug, Default)]
pub struct ConnectivityInformation {
    by_source: RwLock<HashMap<String, BTreeSet<HostAddress>>>,
}

impl ConnectivityInformation {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the addresses contributed by `source`.
    ///
    /// An empty set drops the source entirely. Returns the resulting change
    /// to the aggregated set; the update and the diff are computed under one
    /// write lock so concurrent updates never produce overlapping diffs.
    pub fn record_connectivity_information_for_source(
        &self,
        source: &str,
        addresses: impl IntoIterator<Item = HostAddress>,
    ) -> ConnectivityChanges {
        let addresses: BTreeSet<HostAddress> = addresses.into_iter().collect();

        let mut map = self.by_source.write();
        let before = aggregate(&map);

        info!(
            source = %source,
            addresses = ?addresses.iter().map(HostAddress::host).collect::<Vec<_>>(),
            "Updating connectivity information"
        );

        if addresses.is_empty() {
            map.remove(source);
        } else {
            map.insert(source.to_string(), addresses);
        }

        let after = aggregate(&map);
        drop(map);

        ConnectivityChanges {
            added: after.difference(&before).cloned().collect(),
            removed: before.difference(&after).cloned().collect(),
        }
    }

    /// Union of the addresses of every source.
    #[must_use]
    pub fn aggregated_connectivity_information(&self) -> BTreeSet<HostAddress> {
        aggregate(&self.by_source.read())
    }

    /// Aggregated addresses as plain strings, for SAN generation.
    #[must_use]
    pub fn cached_host_addresses(&self) -> Vec<String> {
        self.aggregated_connectivity_information()
            .into_iter()
            .map(|h| h.0)
            .collect()
    }

    /// Addresses contributed by one source.
    #[must_use]
    pub fn connectivity_information_for_source(&self, source: &str) -> BTreeSet<HostAddress> {
        self.by_source
            .read()
            .get(source)
            .cloned()
            .unwrap_or_default()
    }
}

fn aggregate(map: &HashMap<String, BTreeSet<HostAddress>>) -> BTreeSet<HostAddress> {
    map.values().flatten().cloned().collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
