//! Holder of the active group configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::group::{DeviceGroupsConfig, GroupConfiguration, Permission};
use crate::Result;
use crate::session::Session;

/// Resolves which permissions apply to a session.
///
/// The configuration is swapped as a whole; readers hold an `Arc` to the
/// version they started with.
#[derive(Debug, Default)]
pub struct GroupManager {
    configuration: RwLock<Arc<GroupConfiguration>>,
}

impl GroupManager {
    /// Manager with no groups.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `config` and make it active. On error the previous
    /// configuration stays in force.
    ///
    /// # Errors
    ///
    /// Returns `Error::Policy` if the configuration is invalid.
    pub fn apply(&self, config: &DeviceGroupsConfig) -> Result<()> {
        let compiled = GroupConfiguration::try_from_config(config)?;
        info!(
            groups = config.definitions.len(),
            policies = config.policies.len(),
            "Applied device group configuration"
        );
        self.set_group_configuration(compiled);
        Ok(())
    }

    /// Replace the active configuration.
    pub fn set_group_configuration(&self, configuration: GroupConfiguration) {
        *self.configuration.write() = Arc::new(configuration);
    }

    /// The active configuration.
    #[must_use]
    pub fn group_configuration(&self) -> Arc<GroupConfiguration> {
        Arc::clone(&self.configuration.read())
    }

    /// Permissions of every group matching `session`, keyed by group name,
    /// with policy variables resolved against the session.
    #[must_use]
    pub fn get_applicable_policy_permissions(
        &self,
        session: &Session,
    ) -> BTreeMap<String, BTreeSet<Permission>> {
        let configuration = self.group_configuration();
        configuration
            .applicable_groups(session)
            .into_iter()
            .filter_map(|group| {
                let permissions = configuration
                    .group_permissions(group)?
                    .iter()
                    .map(|p| p.resolve_resource_policy_variables(session))
                    .collect();
                Some((group.to_string(), permissions))
            })
            .collect()
    }
}
