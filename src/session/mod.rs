//! Authenticated sessions.
//!
//! A [`Session`] owns exactly one authentication basis (a device
//! [`Certificate`] or an internal [`Component`]) fixed at construction, plus
//! an optional [`Thing`] facet that is resolved at most once, lazily, by
//! [`Session::get_or_attach_thing`].
//!
//! Sessions are held by the [`SessionManager`] in a capacity-bounded LRU
//! cache ([`cache::SessionCache`]) and handed out as `Arc<Session>`, so an
//! in-flight authorization keeps a consistent view even if the entry is
//! evicted meanwhile.

pub mod cache;
pub mod manager;

use std::future::Future;

use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::Result;
use crate::iot::{Certificate, Component, Thing};

pub use cache::SessionCache;
pub use manager::SessionManager;

/// What authenticated the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthBasis {
    /// A device certificate verified against the cloud.
    Certificate(Certificate),
    /// An internal component.
    Component(Component),
}

/// An authenticated identity context.
#[derive(Debug)]
pub struct Session {
    basis: AuthBasis,
    /// `Some(None)` caches a negative association result.
    thing: OnceCell<Option<Thing>>,
    created_at: Instant,
}

impl Session {
    /// Session authenticated by a device certificate.
    #[must_use]
    pub fn for_certificate(certificate: Certificate) -> Self {
        Self::new(AuthBasis::Certificate(certificate))
    }

    /// Session for an internal component.
    #[must_use]
    pub fn for_component() -> Self {
        Self::new(AuthBasis::Component(Component))
    }

    fn new(basis: AuthBasis) -> Self {
        Self {
            basis,
            thing: OnceCell::new(),
            created_at: Instant::now(),
        }
    }

    /// Pre-resolve the thing facet.
    #[must_use]
    pub fn with_thing(mut self, thing: Thing) -> Self {
        self.thing = OnceCell::from(Some(thing));
        self
    }

    /// The authentication basis.
    #[must_use]
    pub fn basis(&self) -> &AuthBasis {
        &self.basis
    }

    /// The certificate facet, for certificate-authenticated sessions.
    #[must_use]
    pub fn certificate(&self) -> Option<&Certificate> {
        match &self.basis {
            AuthBasis::Certificate(c) => Some(c),
            AuthBasis::Component(_) => None,
        }
    }

    /// The component facet, for component sessions.
    #[must_use]
    pub fn component(&self) -> Option<&Component> {
        match &self.basis {
            AuthBasis::Component(c) => Some(c),
            AuthBasis::Certificate(_) => None,
        }
    }

    /// The attached thing, if the association was resolved positively.
    #[must_use]
    pub fn thing(&self) -> Option<&Thing> {
        self.thing.get().and_then(Option::as_ref)
    }

    /// Whether the thing association has already been resolved (either way).
    #[must_use]
    pub fn is_thing_resolved(&self) -> bool {
        self.thing.initialized()
    }

    /// Resolve the thing facet once.
    ///
    /// `resolve` runs at most once per session; concurrent callers wait for
    /// the first one. Its result, including `None`, is cached. An `Err` is
    /// not cached, so the next caller tries again.
    pub async fn get_or_attach_thing<F, Fut>(&self, resolve: F) -> Result<Option<&Thing>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Thing>>>,
    {
        self.thing
            .get_or_try_init(resolve)
            .await
            .map(Option::as_ref)
    }

    /// Look up an identity attribute by facet namespace and attribute name.
    #[must_use]
    pub fn attribute(&self, namespace: &str, name: &str) -> Option<&str> {
        match (namespace, name) {
            (Thing::NAMESPACE, "ThingName") => self.thing().map(Thing::thing_name),
            (Certificate::NAMESPACE, "CertificateId") => {
                self.certificate().map(|c| c.certificate_id.as_str())
            }
            _ => None,
        }
    }

    /// When the session was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::Error;

    fn session() -> Session {
        Session::for_certificate(Certificate::active("hash", "cert-1"))
    }

    #[tokio::test]
    async fn thing_resolution_runs_once_and_caches_negative_result() {
        // GIVEN
        let s = session();
        let calls = AtomicUsize::new(0);

        // WHEN: resolving twice with a negative answer
        for _ in 0..2 {
            let thing = s
                .get_or_attach_thing(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await
                .unwrap();
            assert!(thing.is_none());
        }

        // THEN
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(s.is_thing_resolved());
    }

    #[tokio::test]
    async fn failed_resolution_is_retried() {
        let s = session();

        let first = s
            .get_or_attach_thing(|| async { Err(Error::Internal("offline".into())) })
            .await;
        assert!(first.is_err());
        assert!(!s.is_thing_resolved());

        let thing = Thing::of("b").unwrap();
        let second = s
            .get_or_attach_thing(|| async move { Ok(Some(thing)) })
            .await
            .unwrap();
        assert_eq!(second.map(Thing::thing_name), Some("b"));
    }

    #[test]
    fn attributes_expose_thing_and_certificate() {
        let s = session().with_thing(Thing::of("b").unwrap());
        assert_eq!(s.attribute("Thing", "ThingName"), Some("b"));
        assert_eq!(s.attribute("Certificate", "CertificateId"), Some("cert-1"));
        assert_eq!(s.attribute("Thing", "Other"), None);
    }

    #[test]
    fn component_session_has_no_certificate() {
        let s = Session::for_component();
        assert!(s.certificate().is_none());
        assert!(s.component().is_some());
    }
}
