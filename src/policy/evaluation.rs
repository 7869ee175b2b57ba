//! Allow-only permission evaluation.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use super::group::Permission;
use super::wildcard::{operation_matches, resource_matches};

/// A parsed `service:action` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation<'a> {
    /// Service, e.g. `mqtt`.
    pub service: &'a str,
    /// Action, e.g. `publish`.
    pub action: &'a str,
}

impl<'a> Operation<'a> {
    /// Parse a requested operation. Returns `None` if it is malformed.
    #[must_use]
    pub fn parse(operation: &'a str) -> Option<Self> {
        let (service, action) = operation.split_once(':')?;
        let valid = is_service(service)
            && !action.is_empty()
            && action
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-'));
        valid.then_some(Self { service, action })
    }
}

/// A parsed `service:type:name` resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource<'a> {
    /// Service, e.g. `mqtt`.
    pub service: &'a str,
    /// Resource type, e.g. `topic`.
    pub resource_type: &'a str,
    /// Resource name, e.g. a topic.
    pub name: &'a str,
}

impl<'a> Resource<'a> {
    /// Parse a requested resource. Returns `None` if it is malformed.
    #[must_use]
    pub fn parse(resource: &'a str) -> Option<Self> {
        let mut parts = resource.splitn(3, ':');
        let (service, resource_type, name) = (parts.next()?, parts.next()?, parts.next()?);
        let valid = is_service(service)
            && is_service(resource_type)
            && !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_alphanumeric() || (' '..='~').contains(&c));
        valid.then_some(Self {
            service,
            resource_type,
            name,
        })
    }
}

fn is_service(s: &str) -> bool {
    !s.is_empty() && s.chars().all(char::is_alphabetic)
}

/// Whether any permission across `group_permissions` grants `operation` on
/// `resource`.
///
/// Permissions are expected to have their policy variables already
/// resolved. Malformed requests, and requests whose operation and resource
/// name different services, are denied.
#[must_use]
pub fn is_authorized(
    operation: &str,
    resource: &str,
    group_permissions: &BTreeMap<String, BTreeSet<Permission>>,
) -> bool {
    let Some(op) = Operation::parse(operation) else {
        warn!(operation, "Denying request with invalid operation");
        return false;
    };
    let Some(res) = Resource::parse(resource) else {
        warn!(resource, "Denying request with invalid resource");
        return false;
    };
    if op.service != res.service {
        warn!(
            operation,
            resource, "Denying request whose operation and resource services differ"
        );
        return false;
    }

    let granted = group_permissions.iter().find_map(|(group, permissions)| {
        permissions
            .iter()
            .any(|p| operation_matches(&p.operation, operation) && resource_matches(&p.resource, resource))
            .then_some(group)
    });
    match granted {
        Some(group) => {
            debug!(operation, resource, group = %group, "Request allowed");
            true
        }
        None => {
            debug!(operation, resource, "No permission grants request");
            false
        }
    }
}
