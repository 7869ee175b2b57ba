//! Device groups and their policies.
//!
//! [`DeviceGroupsConfig`] is the document as written in configuration.
//! [`GroupConfiguration`] is its validated, compiled form: selection rules
//! parsed and each group's policy flattened into [`Permission`]s.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::rule::SelectionRule;
use super::variable::{find_policy_variables, substitute, validate_policy_variables};
use crate::session::Session;
use crate::{Error, Result};

/// The only supported document format.
pub const FORMAT_VERSION_2021_03_05: &str = "2021-03-05";

fn default_format_version() -> String {
    FORMAT_VERSION_2021_03_05.to_string()
}

/// Statement effect. Only `ALLOW` statements grant anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Effect {
    /// Grant the listed operations on the listed resources.
    #[default]
    #[serde(alias = "allow", alias = "Allow")]
    Allow,
    /// Reserved; ignored during expansion.
    #[serde(alias = "deny", alias = "Deny")]
    Deny,
}

/// One statement of a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyStatement {
    /// Free-form description.
    #[serde(alias = "statementDescription", skip_serializing_if = "Option::is_none")]
    pub statement_description: Option<String>,
    /// Statement effect.
    pub effect: Effect,
    /// Operations such as `mqtt:publish` or `mqtt:*`.
    pub operations: BTreeSet<String>,
    /// Resources such as `mqtt:topic:${iot:Connection.Thing.ThingName}`.
    pub resources: BTreeSet<String>,
}

/// Statement name to statement.
pub type Policy = BTreeMap<String, PolicyStatement>;

/// A group definition as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDefinition {
    /// Rule selecting member devices, e.g. `thingName: sensor-*`.
    #[serde(alias = "selectionRule")]
    pub selection_rule: String,
    /// Policy granted to members.
    #[serde(alias = "policyName")]
    pub policy_name: String,
}

/// The `device_groups` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceGroupsConfig {
    /// Document format version.
    #[serde(alias = "formatVersion")]
    pub format_version: String,
    /// Group name to definition.
    pub definitions: BTreeMap<String, GroupDefinition>,
    /// Policy name to policy.
    pub policies: BTreeMap<String, Policy>,
}

impl Default for DeviceGroupsConfig {
    fn default() -> Self {
        Self {
            format_version: default_format_version(),
            definitions: BTreeMap::new(),
            policies: BTreeMap::new(),
        }
    }
}

/// A single granted operation on a single resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Permission {
    /// Group that grants it.
    pub principal: String,
    /// Operation pattern.
    pub operation: String,
    /// Resource pattern, possibly containing policy variables.
    pub resource: String,
    /// Variable tokens found in `resource`.
    pub resource_policy_variables: BTreeSet<String>,
}

impl Permission {
    /// Create a permission, recording the variables its resource uses.
    #[must_use]
    pub fn new(
        principal: impl Into<String>,
        operation: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        let resource = resource.into();
        Self {
            principal: principal.into(),
            operation: operation.into(),
            resource_policy_variables: find_policy_variables(&resource),
            resource,
        }
    }

    /// This permission with its resource's policy variables substituted
    /// from `session`. Variables the session cannot answer stay verbatim.
    #[must_use]
    pub fn resolve_resource_policy_variables(&self, session: &Session) -> Self {
        if self.resource_policy_variables.is_empty() {
            return self.clone();
        }
        Self {
            principal: self.principal.clone(),
            operation: self.operation.clone(),
            resource: substitute(&self.resource, session).into_owned(),
            resource_policy_variables: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledGroup {
    name: String,
    rule: SelectionRule,
}

/// Validated group configuration.
#[derive(Debug, Clone, Default)]
pub struct GroupConfiguration {
    groups: Vec<CompiledGroup>,
    group_permissions: BTreeMap<String, BTreeSet<Permission>>,
}

impl GroupConfiguration {
    /// Validate and compile `config`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Policy` if the format version is unsupported, a
    /// selection rule does not parse, a group references a missing policy,
    /// or a resource uses an unknown policy variable.
    pub fn try_from_config(config: &DeviceGroupsConfig) -> Result<Self> {
        if config.format_version != FORMAT_VERSION_2021_03_05 {
            return Err(Error::Policy(format!(
                "Unsupported device groups format version {}",
                config.format_version
            )));
        }

        for statement in config.policies.values().flat_map(BTreeMap::values) {
            for resource in &statement.resources {
                validate_policy_variables(resource)?;
            }
        }

        let mut groups = Vec::with_capacity(config.definitions.len());
        let mut group_permissions = BTreeMap::new();
        for (name, definition) in &config.definitions {
            let policy = config.policies.get(&definition.policy_name).ok_or_else(|| {
                Error::Policy(format!(
                    "Policies doesn't have policy named {}",
                    definition.policy_name
                ))
            })?;
            let rule = SelectionRule::parse(&definition.selection_rule).map_err(|e| {
                Error::Policy(format!("Invalid selection rule for group {name}: {e}"))
            })?;
            group_permissions.insert(name.clone(), expand_policy(name, policy));
            groups.push(CompiledGroup {
                name: name.clone(),
                rule,
            });
        }

        debug!(groups = groups.len(), "Compiled device group configuration");
        Ok(Self {
            groups,
            group_permissions,
        })
    }

    /// Whether no groups are defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Names of the groups whose selection rule matches `session`.
    #[must_use]
    pub fn applicable_groups(&self, session: &Session) -> Vec<&str> {
        self.groups
            .iter()
            .filter(|g| g.rule.matches(session))
            .map(|g| g.name.as_str())
            .collect()
    }

    /// Flattened permissions granted by `group`.
    #[must_use]
    pub fn group_permissions(&self, group: &str) -> Option<&BTreeSet<Permission>> {
        self.group_permissions.get(group)
    }
}

fn expand_policy(group: &str, policy: &Policy) -> BTreeSet<Permission> {
    policy
        .values()
        .filter(|statement| statement.effect == Effect::Allow)
        .flat_map(|statement| {
            statement
                .operations
                .iter()
                .filter(|op| !op.is_empty())
                .flat_map(|op| {
                    statement
                        .resources
                        .iter()
                        .filter(|r| !r.is_empty())
                        .map(move |r| Permission::new(group, op.as_str(), r.as_str()))
                })
        })
        .collect()
}
