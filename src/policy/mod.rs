//! Group policies and permission evaluation.
//!
//! ```text
//! DeviceGroupsConfig ──validate──► GroupConfiguration ──► GroupManager
//!                                                             │
//!              session ──selection rules──► applicable groups ┘
//!                                                 │
//!                   Permission (variables resolved)
//!                                                 ▼
//!                              evaluation::is_authorized
//! ```

pub mod evaluation;
pub mod group;
pub mod manager;
pub mod rule;
pub mod variable;
pub mod wildcard;

pub use evaluation::is_authorized;
pub use group::{
    DeviceGroupsConfig, Effect, GroupConfiguration, GroupDefinition, Permission, Policy,
    PolicyStatement,
};
pub use manager::GroupManager;
pub use rule::SelectionRule;
