//! Policy variables: `${namespace:path}` tokens in resource strings.
//!
//! Only the tokens in [`CATALOG`] are recognized, case-insensitively.
//! Substitution is best-effort: unknown or malformed tokens, and tokens whose
//! session attribute is missing, stay in the resource verbatim. Validation,
//! which runs when a configuration is applied, is strict.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::session::Session;
use crate::{Error, Result};

/// A recognized policy variable and the session attribute it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyVariable {
    /// Canonical token text.
    pub token: &'static str,
    /// Session facet namespace.
    pub namespace: &'static str,
    /// Attribute within the facet.
    pub attribute: &'static str,
}

/// Every supported policy variable.
pub const CATALOG: &[PolicyVariable] = &[PolicyVariable {
    token: "${iot:Connection.Thing.ThingName}",
    namespace: "Thing",
    attribute: "ThingName",
}];

/// Candidate tokens, before catalog lookup.
static POLICY_VARIABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    // literal pattern, cannot fail
    Regex::new(r"(?i)\$\{[a-z]+:[a-z.]+\}").unwrap_or_else(|_| unreachable!())
});

impl PolicyVariable {
    /// Catalog entry for `token`, ignoring case.
    #[must_use]
    pub fn lookup(token: &str) -> Option<&'static Self> {
        CATALOG.iter().find(|v| v.token.eq_ignore_ascii_case(token))
    }
}

/// Candidate variable tokens in `resource`, as written.
#[must_use]
pub fn find_policy_variables(resource: &str) -> BTreeSet<String> {
    POLICY_VARIABLE_PATTERN
        .find_iter(resource)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Check that every `${` in `resource` opens a recognized variable.
///
/// # Errors
///
/// Returns `Error::Policy` naming the first offending token.
pub fn validate_policy_variables(resource: &str) -> Result<()> {
    let mut rest = resource;
    while let Some(start) = rest.find("${") {
        let candidate = &rest[start..];
        let recognized = CATALOG.iter().find(|v| {
            candidate
                .get(..v.token.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(v.token))
        });
        match recognized {
            Some(v) => rest = &candidate[v.token.len()..],
            None => {
                return Err(Error::Policy(format!(
                    "Policy contains unknown variables in resource {resource}"
                )));
            }
        }
    }
    Ok(())
}

/// Substitute every recognized variable in `resource` that `session` can
/// answer.
#[must_use]
pub fn substitute<'a>(resource: &'a str, session: &Session) -> Cow<'a, str> {
    POLICY_VARIABLE_PATTERN.replace_all(resource, |caps: &regex::Captures<'_>| {
        let token = &caps[0];
        PolicyVariable::lookup(token)
            .and_then(|v| session.attribute(v.namespace, v.attribute))
            .map_or_else(|| token.to_string(), str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iot::{Certificate, Thing};
    use pretty_assertions::assert_eq;

    fn session_with_thing() -> Session {
        Session::for_certificate(Certificate::active("h", "c")).with_thing(Thing::of("b").unwrap())
    }

    #[test]
    fn recognized_variables_validate() {
        for resource in [
            "${iot:Connection.Thing.ThingName}",
            "${ioT:ConneCtion.tHing.thingName}",
            "${iot:Connection.Thing.ThingName}}",
            "{{${iot:Connection.Thing.ThingName}}",
            "{${iot:Connection.Thing.ThingName}}",
            "mqtt:topic:${iot:Connection.Thing.ThingName}${iot:Connection.Thing.ThingName}",
            "mqtt:topic:no-variables",
        ] {
            assert!(validate_policy_variables(resource).is_ok(), "{resource}");
        }
    }

    #[test]
    fn malformed_variables_are_rejected() {
        for resource in [
            "${}",
            "${ }",
            "${iot}",
            "${iot:Connection.Thing.ThingNames}",
            "${iot:Connection.Thing.*}",
            "${a${iot:Connection.Thing.ThingName}}",
            "${${iot:Connection.Thing.ThingName}}",
            "${*${iot:Connection.Thing.ThingName}}",
            "${*}",
            "/msg/${iot:Connection.Thing.ThingName/}",
            "/msg/${iot:Connection}.Thing.RealThing}/src",
        ] {
            assert!(
                matches!(validate_policy_variables(resource), Err(Error::Policy(_))),
                "{resource}"
            );
        }
    }

    #[test]
    fn substitution_without_thing_leaves_token() {
        // GIVEN: no thing attached
        let session = Session::for_certificate(Certificate::active("h", "c"));
        let resource = "/msg/${iot:Connection.Thing.ThingName}";

        // THEN
        assert_eq!(substitute(resource, &session), resource);
    }

    #[test]
    fn substitution_with_thing_replaces_every_occurrence() {
        let session = session_with_thing();
        assert_eq!(substitute("/msg/${iot:Connection.Thing.ThingName}", &session), "/msg/b");
        assert_eq!(
            substitute(
                "${iot:Connection.Thing.ThingName}${IOT:connection.thing.thingname}",
                &session
            ),
            "bb"
        );
    }

    #[test]
    fn malformed_tokens_survive_substitution() {
        let session = session_with_thing();
        for resource in [
            "/msg/${iot:Connection.Thing.ThingName/}",
            "/msg/${iot:Connection}.Thing.RealThing}/src",
        ] {
            assert_eq!(substitute(resource, &session), resource);
        }
        assert_eq!(
            substitute(
                "/msg/${iot:Connection.Thing.ThingName}/${iot:Connection}.Thing.RealThing}/src",
                &session
            ),
            "/msg/b/${iot:Connection}.Thing.RealThing}/src"
        );
    }

    #[test]
    fn finds_candidate_tokens() {
        let found = find_policy_variables("a/${iot:Connection.Thing.ThingName}/${x:y}");
        assert_eq!(found.len(), 2);
    }
}
